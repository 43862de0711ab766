//! Conversation orchestration engine.
//!
//! `advance` is the single entry point for inbound messages. It serializes
//! processing per user address, dispatches on the current ledger row's
//! `(flow, level)`, runs the step handler, and applies the resulting outcome.
//! Ledger writes always land before the outbound reply they correspond to.

mod dispatch;
mod flows;
mod policy;
mod rollback;

pub use rollback::RollbackMode;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::{Catalog, FlowId, Step};
use crate::channels::Messenger;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::extract::TextRecognizer;
use crate::otp::OtpService;
use crate::partner::{PartnerClient, ProvisioningSaga};
use crate::store::Database;

pub(crate) const START_KEYWORD: &str = "start";
pub(crate) const STOP_KEYWORD: &str = "stop";
pub(crate) const BACK_KEYWORD: &str = "back";

pub(crate) const GENERIC_FAILURE: &str =
    "Sorry, we couldn't process that message. Please send it again.";
pub const ABANDONED_MESSAGE: &str =
    "This conversation expired due to inactivity. Send \"start\" whenever you're ready to begin again.";
pub(crate) const CANCELLED_MESSAGE: &str = "No problem, we've cancelled that.";
pub(crate) const PROVISIONING_FAILED: &str =
    "Something went wrong while setting up your account. Please contact an agent, or send \"start\" to try again.";
pub(crate) const REGISTRATION_DONE: &str = "You're all set! Your driver account is ready.";
pub(crate) const VEHICLE_CHANGE_DONE: &str = "Done! Your vehicle has been updated.";
pub(crate) const PHONE_CHANGE_DONE: &str = "Done! Your phone number has been updated.";

/// Orchestrates conversations: dispatch, strike policy, sub-workflows,
/// abandonment sweeps, inbox draining.
pub struct Engine {
    store: Arc<dyn Database>,
    messenger: Arc<dyn Messenger>,
    recognizer: Arc<dyn TextRecognizer>,
    catalog: Arc<Catalog>,
    config: EngineConfig,
    saga: ProvisioningSaga,
    otp: OtpService,
    /// One mutex per user address: concurrent messages for the same user are
    /// serialized, distinct users proceed in parallel.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Database>,
        messenger: Arc<dyn Messenger>,
        recognizer: Arc<dyn TextRecognizer>,
        partner: Arc<dyn PartnerClient>,
        catalog: Arc<Catalog>,
        config: EngineConfig,
    ) -> Self {
        let saga = ProvisioningSaga::new(Arc::clone(&store), partner);
        let otp = OtpService::new(Arc::clone(&store), Arc::clone(&messenger), config.otp_ttl);
        Self {
            store,
            messenger,
            recognizer,
            catalog,
            config,
            saga,
            otp,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the per-user mutex, creating it on first contact.
    pub(crate) async fn lock_user(&self, user: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(user.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop per-user mutexes nobody holds. A strong count above one means a
    /// guard (or a pending `lock_owned`) is still out there, so the entry
    /// stays.
    pub(crate) async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Send a step's prompt, rendered with `vars`. Steps carrying a media URL
    /// go out as an image with the prompt as caption.
    pub(crate) async fn send_step(
        &self,
        user: &str,
        step: &Step,
        vars: &HashMap<&'static str, String>,
    ) -> Result<()> {
        let body = step.render(vars);
        match &step.media_url {
            Some(media) => self.messenger.send_image(user, media, Some(&body)).await?,
            None => self.messenger.send_text(user, &body).await?,
        }
        Ok(())
    }

    /// Inter-send delay, applied between consecutive outbound messages to the
    /// same user.
    pub(crate) async fn throttle(&self) {
        if !self.config.send_throttle.is_zero() {
            tokio::time::sleep(self.config.send_throttle).await;
        }
    }

    /// The validated input stored on the user's ledger row for `(flow, level)`.
    ///
    /// This is how later steps recover earlier answers: the phone entered at
    /// level 1 is the `message` of the level-2 row, because a row records the
    /// answer that moved the user onto its step.
    pub(crate) async fn stored_input(&self, user: &str, flow: FlowId, level: u8) -> Result<String> {
        self.store
            .find_ledger_row(user, flow, level)
            .await?
            .map(|row| row.message)
            .ok_or_else(|| {
                EngineError::PhoneRowMissing {
                    user: user.to_string(),
                }
                .into()
            })
    }
}
