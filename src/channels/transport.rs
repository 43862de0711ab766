//! Wire types for the messaging channel and the `Messenger` send seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Inbound message kind. Text and image bodies are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBody {
    pub id: String,
    pub link: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Inbound webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageBody>,
}

/// The typed payload of an inbound message, after shape validation.
#[derive(Debug, Clone)]
pub enum Payload<'a> {
    Text(&'a str),
    Image(&'a ImageBody),
}

impl InboundMessage {
    /// The payload matching the envelope's declared `type`, or an error when
    /// the declared type and the present body disagree.
    pub fn payload(&self) -> Result<Payload<'_>, ChannelError> {
        match self.kind {
            MessageKind::Text => self
                .text
                .as_ref()
                .map(|t| Payload::Text(t.body.as_str()))
                .ok_or_else(|| {
                    ChannelError::InvalidEnvelope(format!("message {}: type=text, no text body", self.id))
                }),
            MessageKind::Image => self
                .image
                .as_ref()
                .map(Payload::Image)
                .ok_or_else(|| {
                    ChannelError::InvalidEnvelope(format!("message {}: type=image, no image body", self.id))
                }),
        }
    }
}

/// Outbound send capability. One implementation talks to the real gateway;
/// tests substitute a recording mock.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError>;

    async fn send_image(
        &self,
        to: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_envelope_deserializes() {
        let json = serde_json::json!({
            "id": "wamid.1",
            "type": "text",
            "from": "212612345678",
            "text": { "body": "start" }
        });
        let msg: InboundMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(msg.payload().unwrap(), Payload::Text("start")));
    }

    #[test]
    fn image_envelope_deserializes() {
        let json = serde_json::json!({
            "id": "wamid.2",
            "type": "image",
            "from": "212612345678",
            "image": {
                "id": "media.9",
                "link": "https://cdn.example/media.9.jpg",
                "file_size": 420000,
                "preview": "data:image/jpeg;base64,..."
            }
        });
        let msg: InboundMessage = serde_json::from_value(json).unwrap();
        match msg.payload().unwrap() {
            Payload::Image(img) => {
                assert_eq!(img.id, "media.9");
                assert_eq!(img.file_size, 420000);
            }
            other => panic!("expected image payload, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_type_and_body_is_invalid() {
        let json = serde_json::json!({
            "id": "wamid.3",
            "type": "image",
            "from": "212612345678",
            "text": { "body": "not an image" }
        });
        let msg: InboundMessage = serde_json::from_value(json).unwrap();
        assert!(msg.payload().is_err());
    }
}
