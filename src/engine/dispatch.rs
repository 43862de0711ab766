//! Dispatcher: entry points, outcome application, commands, scheduled sweeps.

use std::collections::HashMap;

use chrono::Utc;

use crate::catalog::{ErrorKind, FlowId};
use crate::channels::{InboundMessage, Payload};
use crate::engine::rollback;
use crate::engine::{
    ABANDONED_MESSAGE, BACK_KEYWORD, CANCELLED_MESSAGE, Engine, GENERIC_FAILURE, START_KEYWORD,
    STOP_KEYWORD,
};
use crate::error::{EngineError, Result};
use crate::store::model::{HistoryReason, HistoryStatus, LedgerRow};

/// What a step handler decided. Handlers compute outcomes; only the
/// dispatcher turns them into ledger writes and sends, in that order.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Valid input: append a row for the next step and send its prompt.
    Next {
        flow: FlowId,
        level: u8,
        /// The validated/normalized input, recorded on the new row.
        stored: String,
        vars: HashMap<&'static str, String>,
    },
    /// Invalid input: run the bad-response policy.
    Invalid(ErrorKind),
    /// Extraction gate rejected a document: resubmission prompt, no strike.
    Resubmit,
    /// The flow finished successfully.
    Complete { message: &'static str },
    /// The saga aborted: fail the attempt, roll back, clear.
    Failed { message: &'static str },
    /// The user declined at a confirmation step.
    Cancelled,
    /// No reply owed.
    Ignore,
}

impl Engine {
    /// Process one inbound message end to end.
    ///
    /// Handler errors are caught here: the user stays at the same step, the
    /// ledger is untouched, and a generic retry message goes out.
    pub async fn advance(&self, msg: &InboundMessage) -> Result<()> {
        let user = msg.from.as_str();
        let _guard = self.lock_user(user).await;

        let payload = match msg.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(user, message_id = %msg.id, error = %e, "Malformed envelope");
                self.messenger.send_text(user, GENERIC_FAILURE).await?;
                return Ok(());
            }
        };

        let Some(row) = self.store.current_row(user).await? else {
            // Implicit root: only "start" gets a reply, anything else is
            // ignored so strangers and typos produce no traffic.
            if let Payload::Text(text) = &payload {
                if text.trim().eq_ignore_ascii_case(START_KEYWORD) {
                    self.store
                        .append_ledger_row(user, FlowId::Root, 0, START_KEYWORD)
                        .await?;
                    self.send_step(user, self.catalog.root(), &HashMap::new())
                        .await?;
                }
            }
            return Ok(());
        };

        // Commands shortcut normal validation at any step.
        if let Payload::Text(text) = &payload {
            let text = text.trim();
            if text.eq_ignore_ascii_case(STOP_KEYWORD) {
                return self.handle_stop(user, &row).await;
            }
            if text.eq_ignore_ascii_case(BACK_KEYWORD) {
                return self.handle_back(user, &row).await;
            }
        }

        match self.run_handler(user, &row, &payload).await {
            Ok(outcome) => self.apply_outcome(user, &row, outcome).await,
            Err(e) => {
                tracing::error!(
                    user,
                    flow = %row.flow,
                    level = row.level,
                    error = %e,
                    "Handler failed, user stays at the same step"
                );
                self.messenger.send_text(user, GENERIC_FAILURE).await?;
                Ok(())
            }
        }
    }

    async fn apply_outcome(&self, user: &str, row: &LedgerRow, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Next {
                flow,
                level,
                stored,
                vars,
            } => {
                let next = self.catalog.get(flow, level).ok_or_else(|| {
                    EngineError::UnknownStep {
                        flow: flow.to_string(),
                        level,
                    }
                })?;
                self.store
                    .append_ledger_row(user, flow, level, &stored)
                    .await?;
                if level == 1 && flow != FlowId::Root {
                    self.store.open_history(user, flow).await?;
                }
                self.send_step(user, next, &vars).await
            }
            Outcome::Invalid(kind) => {
                let step = self.catalog.get(row.flow, row.level).ok_or_else(|| {
                    EngineError::UnknownStep {
                        flow: row.flow.to_string(),
                        level: row.level,
                    }
                })?;
                self.handle_invalid(user, row, step, kind).await
            }
            Outcome::Resubmit => {
                let step = self.catalog.get(row.flow, row.level).ok_or_else(|| {
                    EngineError::UnknownStep {
                        flow: row.flow.to_string(),
                        level: row.level,
                    }
                })?;
                let message = step.resubmit_message.as_deref().ok_or_else(|| {
                    EngineError::MessageNotConfigured {
                        flow: row.flow.to_string(),
                        level: row.level,
                        error: "resubmit".to_string(),
                    }
                })?;
                self.messenger.send_text(user, message).await?;
                Ok(())
            }
            Outcome::Complete { message } => {
                self.store.clear_ledger(user).await?;
                self.messenger.send_text(user, message).await?;
                Ok(())
            }
            Outcome::Failed { message } => {
                self.abort_flow(user, row.flow, HistoryReason::Error, message)
                    .await
            }
            Outcome::Cancelled => {
                self.abort_flow(user, row.flow, HistoryReason::NormalFinish, CANCELLED_MESSAGE)
                    .await?;
                self.throttle().await;
                self.store
                    .append_ledger_row(user, FlowId::Root, 0, START_KEYWORD)
                    .await?;
                self.send_step(user, self.catalog.root(), &HashMap::new())
                    .await
            }
            Outcome::Ignore => Ok(()),
        }
    }

    /// Fail the current attempt: close its history row, roll back collected
    /// data, clear the ledger, then tell the user. The rollback runs before
    /// the clear because it reads phone numbers off the ledger.
    pub(crate) async fn abort_flow(
        &self,
        user: &str,
        flow: FlowId,
        reason: HistoryReason,
        farewell: &str,
    ) -> Result<()> {
        if flow != FlowId::Root {
            self.store
                .close_history(user, flow, HistoryStatus::Fail, reason)
                .await?;
        }
        let mode = rollback::infer_mode(self.store.as_ref(), user, flow).await?;
        rollback::rollback_collected(self.store.as_ref(), user, flow, mode).await?;
        self.store.clear_ledger(user).await?;
        self.messenger.send_text(user, farewell).await?;
        Ok(())
    }

    /// "stop": abort whatever is in progress and return to the menu.
    async fn handle_stop(&self, user: &str, row: &LedgerRow) -> Result<()> {
        tracing::info!(user, flow = %row.flow, "User stopped the conversation");
        if row.flow == FlowId::Root {
            self.store.clear_ledger(user).await?;
        } else {
            self.abort_flow(user, row.flow, HistoryReason::NormalFinish, CANCELLED_MESSAGE)
                .await?;
            self.throttle().await;
        }
        self.store
            .append_ledger_row(user, FlowId::Root, 0, START_KEYWORD)
            .await?;
        self.send_step(user, self.catalog.root(), &HashMap::new())
            .await
    }

    /// "back": pop the current row and re-prompt the previous step, without
    /// re-running its side effects.
    async fn handle_back(&self, user: &str, row: &LedgerRow) -> Result<()> {
        if row.flow == FlowId::Root && row.level == 0 {
            // Nothing behind the menu; just show it again.
            return self
                .send_step(user, self.catalog.root(), &HashMap::new())
                .await;
        }
        self.store.pop_current_row(user).await?;
        let Some(previous) = self.store.current_row(user).await? else {
            self.store
                .append_ledger_row(user, FlowId::Root, 0, START_KEYWORD)
                .await?;
            return self
                .send_step(user, self.catalog.root(), &HashMap::new())
                .await;
        };
        let step = self
            .catalog
            .get(previous.flow, previous.level)
            .ok_or_else(|| EngineError::UnknownStep {
                flow: previous.flow.to_string(),
                level: previous.level,
            })?;
        let vars = self.prompt_vars(user, previous.flow, previous.level).await?;
        self.send_step(user, step, &vars).await
    }

    /// One abandonment sweep: expire every conversation idle past the TTL,
    /// rolling back exactly like an aborted flow. A failure on one user is
    /// logged and does not stop the sweep.
    pub async fn reap_idle(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.ledger_ttl).unwrap_or_default();
        let users = self.store.idle_users(cutoff).await?;
        for user in users {
            let _guard = self.lock_user(&user).await;
            // Re-check under the lock: the user may have progressed since
            // the scan.
            let Some(row) = self.store.current_row(&user).await? else {
                continue;
            };
            if row.created_at > cutoff {
                continue;
            }
            tracing::info!(user, flow = %row.flow, level = row.level, "Expiring idle conversation");
            if let Err(e) = self
                .abort_flow(&user, row.flow, HistoryReason::TimeLimitReached, ABANDONED_MESSAGE)
                .await
            {
                tracing::error!(user, error = %e, "Failed to expire conversation");
            }
        }
        self.prune_locks().await;
        Ok(())
    }

    /// Drain the inbox sequentially, oldest first. Each entry gets exactly
    /// one processing attempt: a failure after the ledger has advanced must
    /// not replay the message against the new step, so errors are logged and
    /// the entry is deleted either way. Undecodable payloads are dropped.
    pub async fn drain_inbox(&self) -> Result<()> {
        while let Some(entry) = self.store.next_inbox_entry().await? {
            match serde_json::from_value::<InboundMessage>(entry.payload.clone()) {
                Ok(msg) => {
                    if let Err(e) = self.advance(&msg).await {
                        tracing::error!(
                            message_id = %entry.message_id,
                            error = %e,
                            "Inbound processing failed, dropping entry"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %entry.message_id,
                        error = %e,
                        "Dropping undecodable inbox entry"
                    );
                }
            }
            self.store.delete_inbox_entry(entry.id).await?;
            self.throttle().await;
        }
        Ok(())
    }
}
