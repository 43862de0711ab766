//! Bad-response and escalation policy.
//!
//! An invalid input gets the step's configured retry message and a strike on
//! the current ledger row. Reaching the strike limit aborts the flow: the
//! attempt is marked failed, collected data is rolled back, the ledger is
//! cleared, and the user gets the agent-handoff message. A valid transition
//! appends a new row, so strikes reset implicitly.

use crate::catalog::{ErrorKind, Step};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::store::model::{HistoryReason, LedgerRow};

impl Engine {
    pub(crate) async fn handle_invalid(
        &self,
        user: &str,
        row: &LedgerRow,
        step: &Step,
        kind: ErrorKind,
    ) -> Result<()> {
        // A missing retry message is a seeding defect, not a user error.
        let message = step
            .bad_response(kind)
            .ok_or_else(|| EngineError::MessageNotConfigured {
                flow: row.flow.to_string(),
                level: row.level,
                error: kind.to_string(),
            })?
            .to_string();

        let count = self.store.increment_bad_response(row.id).await?;
        if count >= self.config.strike_limit {
            tracing::info!(
                user,
                flow = %row.flow,
                level = row.level,
                count,
                "Strike limit reached, aborting flow"
            );
            let handoff = self.catalog.agent_handoff().prompt.clone();
            return self
                .abort_flow(user, row.flow, HistoryReason::Error, &handoff)
                .await;
        }

        tracing::debug!(user, flow = %row.flow, level = row.level, %kind, count, "Invalid input");
        self.messenger.send_text(user, &message).await?;
        Ok(())
    }
}
