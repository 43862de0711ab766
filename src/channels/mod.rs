//! Message transport: inbound webhook envelopes and outbound sends.

pub mod transport;
pub mod webhook;
pub mod whatsapp;

pub use transport::{ImageBody, InboundMessage, MessageKind, Messenger, Payload};
pub use webhook::{WebhookState, webhook_routes};
pub use whatsapp::GatewayClient;
