//! Configuration types.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of invalid inputs at the same step before the flow is aborted.
    pub strike_limit: u32,
    /// Idle time after which the reaper expires a conversation.
    pub ledger_ttl: Duration,
    /// Period of the abandonment sweep.
    pub reaper_interval: Duration,
    /// Period of the inbox drain.
    pub inbox_interval: Duration,
    /// OTP validity window.
    pub otp_ttl: Duration,
    /// Maximum accepted inbound image size in bytes.
    pub max_image_bytes: u64,
    /// Delay inserted between consecutive outbound sends to one user.
    pub send_throttle: Duration,
    /// Country code prepended to normalized phone numbers.
    pub country_code: String,
    /// Timeout for partner-platform and outbound-send HTTP calls.
    pub http_timeout: Duration,
    /// Timeout for OCR calls.
    pub ocr_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strike_limit: 2,
            ledger_ttl: Duration::from_secs(300), // 5 minutes
            reaper_interval: Duration::from_secs(60),
            inbox_interval: Duration::from_secs(2),
            otp_ttl: Duration::from_secs(300),
            max_image_bytes: 5 * 1024 * 1024,
            send_throttle: Duration::from_millis(1500),
            country_code: "+212".to_string(),
            http_timeout: Duration::from_secs(15),
            ocr_timeout: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.strike_limit, 2);
        assert_eq!(cfg.ledger_ttl, Duration::from_secs(300));
        assert!(cfg.ocr_timeout >= cfg.http_timeout);
    }
}
