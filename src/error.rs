//! Error types for the onboarding engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("Partner platform error: {0}")]
    Partner(#[from] PartnerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with key {key}")]
    NotFound { entity: String, key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Invalid inbound envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// OCR / text-recognition errors.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR request failed: {0}")]
    RequestFailed(String),

    #[error("OCR provider reported: {0}")]
    Provider(String),

    #[error("OCR response missing parsed text")]
    EmptyResult,

    #[error("OCR call timed out after {0:?}")]
    Timeout(Duration),
}

/// Partner platform call errors.
#[derive(Debug, thiserror::Error)]
pub enum PartnerError {
    #[error("{call} returned unexpected status {status}")]
    UnexpectedStatus { call: String, status: u16 },

    #[error("{call} response missing field {field}")]
    MalformedResponse { call: String, field: String },

    #[error("{call} request failed: {reason}")]
    RequestFailed { call: String, reason: String },

    #[error("{call} timed out after {timeout:?}")]
    Timeout { call: String, timeout: Duration },
}

/// Conversation engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No step configured for flow {flow} level {level}")]
    UnknownStep { flow: String, level: u8 },

    #[error("No bad-response message configured for flow {flow} level {level} error {error}")]
    MessageNotConfigured {
        flow: String,
        level: u8,
        error: String,
    },

    #[error("No phone-collection row found in ledger for {user}")]
    PhoneRowMissing { user: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
