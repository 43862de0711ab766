//! Persisted entity models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::FlowId;

/// One validated transition in a user's conversation.
///
/// The current step of a user is the row their cursor points at; rows are
/// append-mostly and deleted only by "back", "stop", aborts, and the reaper.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: i64,
    pub user_address: String,
    pub flow: FlowId,
    pub level: u8,
    /// The validated/normalized input that caused this transition.
    pub message: String,
    /// Invalid-input strikes accumulated while sitting at this step.
    pub bad_response_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Coarse status of one flow attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    InProgress,
    Succeeded,
    Fail,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Terminal reason recorded when a flow attempt closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReason {
    NormalFinish,
    Error,
    TimeLimitReached,
}

impl HistoryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NormalFinish => "normal_finish",
            Self::Error => "error",
            Self::TimeLimitReached => "time_limit_reached",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal_finish" => Some(Self::NormalFinish),
            "error" => Some(Self::Error),
            "time_limit_reached" => Some(Self::TimeLimitReached),
            _ => None,
        }
    }
}

/// One row per (user, flow attempt); audit only, never control flow.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: Uuid,
    pub user_address: String,
    pub flow: FlowId,
    pub status: HistoryStatus,
    pub reason: Option<HistoryReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSide {
    Front,
    Back,
}

impl DocumentSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "front" => Some(Self::Front),
            "back" => Some(Self::Back),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    DriverLicense,
    CarRegistration,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DriverLicense => "driver_license",
            Self::CarRegistration => "car_registration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "driver_license" => Some(Self::DriverLicense),
            "car_registration" => Some(Self::CarRegistration),
            _ => None,
        }
    }
}

/// A submitted document image. Owned by the submitting user address until a
/// driver record exists, then re-owned by that driver.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    pub id: Uuid,
    pub owner_address: String,
    pub driver_id: Option<Uuid>,
    pub media_id: String,
    pub media_url: String,
    pub kind: DocumentKind,
    pub side: DocumentSide,
    pub created_at: DateTime<Utc>,
}

/// Driver personal info, extracted from the license front.
#[derive(Debug, Clone)]
pub struct Driver {
    pub id: Uuid,
    /// Normalized phone number (with country code), unique.
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    /// Remote contractor-profile id, set by the provisioning saga.
    pub remote_profile_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Driver license info.
#[derive(Debug, Clone)]
pub struct DriverLicense {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub license_number: String,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

/// Vehicle info, extracted from the registration card.
#[derive(Debug, Clone)]
pub struct Car {
    pub id: Uuid,
    pub plate: String,
    pub make: String,
    pub color: String,
    pub first_registration: Option<NaiveDate>,
    /// Remote vehicle id, set by the provisioning saga.
    pub remote_vehicle_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Temporal driver↔car relation. The active association is the one with a
/// null `end_date`; changing vehicle ends the old one and creates a new one.
#[derive(Debug, Clone)]
pub struct CarAssociation {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub car_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

/// A one-time verification code. A found-but-used or found-but-expired row is
/// treated the same as not found.
#[derive(Debug, Clone)]
pub struct OtpRow {
    pub id: Uuid,
    pub phone: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl OtpRow {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.expires_at > now
    }
}

/// A durable inbox row for a not-yet-processed inbound message.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub id: i64,
    /// Channel-native message id, unique — duplicate webhook deliveries are
    /// dropped on insert.
    pub message_id: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_and_reason_roundtrip() {
        for s in [
            HistoryStatus::InProgress,
            HistoryStatus::Succeeded,
            HistoryStatus::Fail,
        ] {
            assert_eq!(HistoryStatus::parse(s.as_str()), Some(s));
        }
        for r in [
            HistoryReason::NormalFinish,
            HistoryReason::Error,
            HistoryReason::TimeLimitReached,
        ] {
            assert_eq!(HistoryReason::parse(r.as_str()), Some(r));
        }
        assert_eq!(HistoryStatus::parse("nope"), None);
    }

    #[test]
    fn otp_validity() {
        let now = Utc::now();
        let mut otp = OtpRow {
            id: Uuid::new_v4(),
            phone: "+212612345678".into(),
            code: "123456".into(),
            expires_at: now + Duration::minutes(5),
            used: false,
            created_at: now,
        };
        assert!(otp.is_valid_at(now));
        otp.used = true;
        assert!(!otp.is_valid_at(now));
        otp.used = false;
        otp.expires_at = now - Duration::seconds(1);
        assert!(!otp.is_valid_at(now));
    }
}
