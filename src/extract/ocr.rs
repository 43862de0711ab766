//! Remote OCR call — image URL in, recognized text lines out.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::OcrError;

/// Text-recognition seam. The production implementation calls a remote OCR
/// service; tests substitute canned line sets.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Recognize text in the image at `image_url`, returning the ordered
    /// lines as the OCR engine laid them out.
    async fn recognize(&self, image_url: &str) -> Result<Vec<String>, OcrError>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(rename = "ParsedResults", default)]
    parsed_results: Vec<ParsedResult>,
    #[serde(rename = "ErrorMessage", default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParsedResult {
    #[serde(rename = "TextOverlay")]
    text_overlay: Option<TextOverlay>,
}

#[derive(Debug, Deserialize)]
struct TextOverlay {
    #[serde(rename = "Lines", default)]
    lines: Vec<OverlayLine>,
}

#[derive(Debug, Deserialize)]
struct OverlayLine {
    #[serde(rename = "LineText", default)]
    line_text: String,
}

/// OCR.space-style HTTP client.
pub struct OcrSpaceClient {
    endpoint: String,
    api_key: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl OcrSpaceClient {
    pub fn new(endpoint: String, api_key: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            api_key,
            timeout,
            client,
        }
    }
}

#[async_trait]
impl TextRecognizer for OcrSpaceClient {
    async fn recognize(&self, image_url: &str) -> Result<Vec<String>, OcrError> {
        let form = [
            ("url", image_url),
            ("isOverlayRequired", "true"),
            ("OCREngine", "2"),
        ];
        let resp = self
            .client
            .post(&self.endpoint)
            .header("apikey", self.api_key.expose_secret())
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OcrError::Timeout(self.timeout)
                } else {
                    OcrError::RequestFailed(e.to_string())
                }
            })?;

        let parsed: OcrResponse = resp
            .json()
            .await
            .map_err(|e| OcrError::RequestFailed(format!("decoding response: {e}")))?;

        if let Some(msg) = parsed.error_message.filter(|m| !m.is_empty()) {
            return Err(OcrError::Provider(msg));
        }

        let lines: Vec<String> = parsed
            .parsed_results
            .into_iter()
            .filter_map(|r| r.text_overlay)
            .flat_map(|o| o.lines)
            .map(|l| l.line_text.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if lines.is_empty() {
            return Err(OcrError::EmptyResult);
        }
        Ok(lines)
    }
}
