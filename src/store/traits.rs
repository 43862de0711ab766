//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::catalog::FlowId;
use crate::error::DatabaseError;
use crate::store::model::{
    Car, CarAssociation, DocumentFile, Driver, DriverLicense, HistoryReason, HistoryRow,
    HistoryStatus, InboxEntry, LedgerRow, OtpRow,
};

/// Backend-agnostic database trait covering the ledger, history, provisioning
/// entities, OTP rows, and the inbound message inbox.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversation ledger + cursor ────────────────────────────────

    /// Append a ledger row for `user` and repoint their cursor at it.
    async fn append_ledger_row(
        &self,
        user: &str,
        flow: FlowId,
        level: u8,
        message: &str,
    ) -> Result<LedgerRow, DatabaseError>;

    /// The row the user's cursor points at, if any.
    async fn current_row(&self, user: &str) -> Result<Option<LedgerRow>, DatabaseError>;

    /// All ledger rows for a user, newest first.
    async fn ledger_rows(&self, user: &str) -> Result<Vec<LedgerRow>, DatabaseError>;

    /// Find the user's ledger row for a specific step, newest first.
    async fn find_ledger_row(
        &self,
        user: &str,
        flow: FlowId,
        level: u8,
    ) -> Result<Option<LedgerRow>, DatabaseError>;

    /// Increment `bad_response_count` on a row; returns the updated count.
    async fn increment_bad_response(&self, row_id: i64) -> Result<u32, DatabaseError>;

    /// Delete the current row and repoint the cursor at the previous one.
    /// Returns the deleted row.
    async fn pop_current_row(&self, user: &str) -> Result<Option<LedgerRow>, DatabaseError>;

    /// Delete all ledger rows and the cursor for a user.
    async fn clear_ledger(&self, user: &str) -> Result<(), DatabaseError>;

    /// User addresses whose current row is older than `cutoff`.
    async fn idle_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, DatabaseError>;

    // ── History tracker ─────────────────────────────────────────────

    /// Find the open (in-progress) history row for `(user, flow)`, creating
    /// one if absent. Never duplicates an open attempt.
    async fn open_history(&self, user: &str, flow: FlowId) -> Result<HistoryRow, DatabaseError>;

    /// Close the open history row for `(user, flow)` with a terminal status.
    /// A no-op if no open row exists.
    async fn close_history(
        &self,
        user: &str,
        flow: FlowId,
        status: HistoryStatus,
        reason: HistoryReason,
    ) -> Result<(), DatabaseError>;

    /// All history rows for a user, newest first (audit queries and tests).
    async fn history_rows(&self, user: &str) -> Result<Vec<HistoryRow>, DatabaseError>;

    // ── Document files ──────────────────────────────────────────────

    async fn insert_document(&self, doc: &DocumentFile) -> Result<(), DatabaseError>;

    async fn documents_for_owner(&self, user: &str) -> Result<Vec<DocumentFile>, DatabaseError>;

    /// Re-own all of a user's documents to a driver record.
    async fn assign_documents_to_driver(
        &self,
        user: &str,
        driver_id: Uuid,
    ) -> Result<(), DatabaseError>;

    /// Delete documents still owned by the user address (not yet re-owned).
    async fn delete_documents_for_owner(&self, user: &str) -> Result<(), DatabaseError>;

    // ── Drivers / licenses ──────────────────────────────────────────

    async fn insert_driver(&self, driver: &Driver) -> Result<(), DatabaseError>;

    async fn find_driver_by_phone(&self, phone: &str) -> Result<Option<Driver>, DatabaseError>;

    async fn update_driver_remote_id(
        &self,
        driver_id: Uuid,
        remote_profile_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn update_driver_phone(&self, driver_id: Uuid, phone: &str)
    -> Result<(), DatabaseError>;

    async fn delete_driver(&self, driver_id: Uuid) -> Result<(), DatabaseError>;

    async fn insert_license(&self, license: &DriverLicense) -> Result<(), DatabaseError>;

    async fn find_license_for_driver(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<DriverLicense>, DatabaseError>;

    async fn delete_licenses_for_driver(&self, driver_id: Uuid) -> Result<(), DatabaseError>;

    // ── Cars / associations ─────────────────────────────────────────

    async fn insert_car(&self, car: &Car) -> Result<(), DatabaseError>;

    async fn find_car(&self, car_id: Uuid) -> Result<Option<Car>, DatabaseError>;

    async fn update_car_remote_id(
        &self,
        car_id: Uuid,
        remote_vehicle_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn delete_car(&self, car_id: Uuid) -> Result<(), DatabaseError>;

    async fn insert_association(&self, assoc: &CarAssociation) -> Result<(), DatabaseError>;

    /// The association with a null `end_date`, if any.
    async fn active_association(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<CarAssociation>, DatabaseError>;

    /// All associations of a driver, active and ended, newest first.
    async fn associations_for_driver(
        &self,
        driver_id: Uuid,
    ) -> Result<Vec<CarAssociation>, DatabaseError>;

    /// The most recently ended association (largest `end_date`).
    async fn last_ended_association(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<CarAssociation>, DatabaseError>;

    /// Set `end_date` on an association.
    async fn end_association(
        &self,
        assoc_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Clear `end_date` on an association, making it active again.
    async fn reopen_association(&self, assoc_id: Uuid) -> Result<(), DatabaseError>;

    async fn delete_association(&self, assoc_id: Uuid) -> Result<(), DatabaseError>;

    // ── OTP ─────────────────────────────────────────────────────────

    async fn insert_otp(&self, otp: &OtpRow) -> Result<(), DatabaseError>;

    /// Most recently created OTP row for a phone, regardless of validity.
    async fn latest_otp(&self, phone: &str) -> Result<Option<OtpRow>, DatabaseError>;

    async fn mark_otp_used(&self, otp_id: Uuid) -> Result<(), DatabaseError>;

    async fn delete_otps_for_phone(&self, phone: &str) -> Result<(), DatabaseError>;

    // ── Inbox (manual queue) ────────────────────────────────────────

    /// Enqueue an inbound message. Returns false if `message_id` was already
    /// queued (duplicate webhook delivery).
    async fn enqueue_inbox(
        &self,
        message_id: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// Oldest queued entry, if any.
    async fn next_inbox_entry(&self) -> Result<Option<InboxEntry>, DatabaseError>;

    /// Remove an entry after it was successfully processed.
    async fn delete_inbox_entry(&self, entry_id: i64) -> Result<(), DatabaseError>;
}
