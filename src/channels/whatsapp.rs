//! HTTP client for the outbound messaging gateway.
//!
//! The gateway speaks a WhatsApp-style API: `POST {base}/messages/text` with
//! `{ to, body, typing_time }` and `POST {base}/messages/image` with
//! `{ to, caption?, media, typing_time }`, bearer-token authenticated.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::transport::Messenger;
use crate::error::ChannelError;

/// Gateway client for outbound text and image sends.
pub struct GatewayClient {
    base_url: String,
    token: SecretString,
    /// Typing-indicator duration the gateway shows before delivering, in
    /// seconds. Doubles as a burst throttle on the gateway side.
    typing_time: u32,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: String, token: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            typing_time: 2,
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: serde_json::Value, to: &str) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                to: to.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Gateway {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for GatewayClient {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        tracing::debug!(to, "Sending text message");
        self.post(
            "messages/text",
            serde_json::json!({
                "to": to,
                "body": body,
                "typing_time": self.typing_time,
            }),
            to,
        )
        .await
    }

    async fn send_image(
        &self,
        to: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        tracing::debug!(to, media_url, "Sending image message");
        let mut body = serde_json::json!({
            "to": to,
            "media": media_url,
            "typing_time": self.typing_time,
        });
        if let Some(cap) = caption {
            body["caption"] = serde_json::Value::String(cap.to_string());
        }
        self.post("messages/image", body, to).await
    }
}
