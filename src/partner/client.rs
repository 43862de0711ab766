//! Remote partner platform API.
//!
//! Success criteria are status codes: create calls return 200/201 with an id
//! field, bind returns 2xx, get-profile must be exactly 200 and update-phone
//! exactly 204.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::PartnerError;

/// Vehicle creation payload.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleRequest {
    pub plate: String,
    pub make: String,
    pub color: String,
}

/// Contractor profile creation payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileRequest {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub license_number: String,
}

/// Partner platform remote procedures.
#[async_trait]
pub trait PartnerClient: Send + Sync {
    /// Create a vehicle; returns the remote vehicle id.
    async fn create_vehicle(&self, req: &VehicleRequest) -> Result<String, PartnerError>;

    /// Create a contractor profile; returns the remote profile id.
    async fn create_profile(&self, req: &ProfileRequest) -> Result<String, PartnerError>;

    /// Bind a driver profile to a vehicle.
    async fn bind_vehicle(&self, profile_id: &str, vehicle_id: &str) -> Result<(), PartnerError>;

    /// Fetch a profile; must return 200.
    async fn get_profile(&self, profile_id: &str) -> Result<serde_json::Value, PartnerError>;

    /// Update a profile's phone number; must return 204.
    async fn update_phone(&self, profile_id: &str, phone: &str) -> Result<(), PartnerError>;
}

/// HTTP implementation of [`PartnerClient`].
pub struct HttpPartnerClient {
    base_url: String,
    token: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPartnerClient {
    pub fn new(base_url: String, token: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn map_send_err(&self, call: &str, e: reqwest::Error) -> PartnerError {
        if e.is_timeout() {
            PartnerError::Timeout {
                call: call.to_string(),
                timeout: self.timeout,
            }
        } else {
            PartnerError::RequestFailed {
                call: call.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// POST `body`, expect a 2xx JSON response carrying `id_field`.
    async fn post_expecting_id(
        &self,
        call: &str,
        path: &str,
        body: &impl Serialize,
        id_field: &str,
    ) -> Result<String, PartnerError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_err(call, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PartnerError::UnexpectedStatus {
                call: call.to_string(),
                status: status.as_u16(),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| PartnerError::RequestFailed {
            call: call.to_string(),
            reason: format!("decoding response: {e}"),
        })?;
        json.get(id_field)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| PartnerError::MalformedResponse {
                call: call.to_string(),
                field: id_field.to_string(),
            })
    }
}

#[async_trait]
impl PartnerClient for HttpPartnerClient {
    async fn create_vehicle(&self, req: &VehicleRequest) -> Result<String, PartnerError> {
        self.post_expecting_id("create_vehicle", "vehicles", req, "vehicle_id")
            .await
    }

    async fn create_profile(&self, req: &ProfileRequest) -> Result<String, PartnerError> {
        self.post_expecting_id(
            "create_profile",
            "contractor-profiles",
            req,
            "contractor_profile_id",
        )
        .await
    }

    async fn bind_vehicle(&self, profile_id: &str, vehicle_id: &str) -> Result<(), PartnerError> {
        let resp = self
            .client
            .post(self.url(&format!("contractor-profiles/{profile_id}/vehicle")))
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({ "vehicle_id": vehicle_id }))
            .send()
            .await
            .map_err(|e| self.map_send_err("bind_vehicle", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PartnerError::UnexpectedStatus {
                call: "bind_vehicle".to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn get_profile(&self, profile_id: &str) -> Result<serde_json::Value, PartnerError> {
        let resp = self
            .client
            .get(self.url(&format!("contractor-profiles/{profile_id}")))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| self.map_send_err("get_profile", e))?;

        // Exactly 200, not any 2xx.
        if resp.status().as_u16() != 200 {
            return Err(PartnerError::UnexpectedStatus {
                call: "get_profile".to_string(),
                status: resp.status().as_u16(),
            });
        }
        resp.json().await.map_err(|e| PartnerError::RequestFailed {
            call: "get_profile".to_string(),
            reason: format!("decoding response: {e}"),
        })
    }

    async fn update_phone(&self, profile_id: &str, phone: &str) -> Result<(), PartnerError> {
        let resp = self
            .client
            .put(self.url(&format!("contractor-profiles/{profile_id}/phone")))
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({ "phone": phone }))
            .send()
            .await
            .map_err(|e| self.map_send_err("update_phone", e))?;

        // Exactly 204.
        if resp.status().as_u16() != 204 {
            return Err(PartnerError::UnexpectedStatus {
                call: "update_phone".to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_compose_against_trimmed_base() {
        let c = HttpPartnerClient::new(
            "https://partner.example/api/v1/".into(),
            SecretString::from("tok"),
            Duration::from_secs(1),
        );
        assert_eq!(c.url("vehicles"), "https://partner.example/api/v1/vehicles");
        assert_eq!(
            c.url("contractor-profiles/p1/vehicle"),
            "https://partner.example/api/v1/contractor-profiles/p1/vehicle"
        );
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_request_failed() {
        let c = HttpPartnerClient::new(
            "http://127.0.0.1:1".into(),
            SecretString::from("tok"),
            Duration::from_millis(200),
        );
        let err = c
            .create_vehicle(&VehicleRequest {
                plate: "1234-A-56".into(),
                make: "DACIA".into(),
                color: "BLANC".into(),
            })
            .await
            .unwrap_err();
        matches!(
            err,
            PartnerError::RequestFailed { .. } | PartnerError::Timeout { .. }
        )
        .then_some(())
        .expect("expected transport-level error");
    }
}
