//! OTP issuance and verification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::channels::Messenger;
use crate::error::Result;
use crate::store::Database;
use crate::store::model::OtpRow;

const CODE_LENGTH: usize = 6;

/// Verdict of an OTP check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    Accepted,
    /// No matching valid code (includes used rows and absent rows).
    WrongCode,
    /// The latest code exists but has expired; the caller re-issues.
    Expired,
}

/// Issues and verifies one-time codes over the message channel.
pub struct OtpService {
    store: Arc<dyn Database>,
    messenger: Arc<dyn Messenger>,
    ttl: Duration,
}

impl OtpService {
    pub fn new(store: Arc<dyn Database>, messenger: Arc<dyn Messenger>, ttl: Duration) -> Self {
        Self {
            store,
            messenger,
            ttl,
        }
    }

    /// Generate a fresh code for `phone`, persist it, and deliver it to the
    /// user's chat address. Re-issuing on a step revisit is safe: the newest
    /// row always wins at verification time.
    pub async fn issue(&self, user_address: &str, phone: &str) -> Result<()> {
        let now = Utc::now();
        let code = generate_code();
        let row = OtpRow {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            code: code.clone(),
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            used: false,
            created_at: now,
        };
        self.store.insert_otp(&row).await?;
        tracing::info!(phone, "OTP issued");

        self.messenger
            .send_text(
                user_address,
                &format!("Your verification code is {code}. It expires in 5 minutes."),
            )
            .await?;
        Ok(())
    }

    /// Check `code` against the newest row for `phone`. Used and absent rows
    /// are equivalent to not-found; an expired row yields `Expired` so the
    /// caller can re-issue.
    pub async fn verify(&self, phone: &str, code: &str) -> Result<OtpCheck> {
        let now = Utc::now();
        let Some(row) = self.store.latest_otp(phone).await? else {
            return Ok(OtpCheck::WrongCode);
        };
        if !row.is_valid_at(now) {
            // A used row behaves like not-found; only a live-but-expired row
            // is worth re-issuing.
            return Ok(if row.used {
                OtpCheck::WrongCode
            } else {
                OtpCheck::Expired
            });
        }
        if row.code != code {
            return Ok(OtpCheck::WrongCode);
        }
        self.store.mark_otp_used(row.id).await?;
        Ok(OtpCheck::Accepted)
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
