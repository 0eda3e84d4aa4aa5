//! Error types for the fable bot.

use std::time::Duration;

use crate::guard::RateCheck;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Errors from the external router and story generator.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} returned an empty response")]
    EmptyResponse { provider: String },

    #[error("Provider {provider} quota or balance exhausted: {reason}")]
    QuotaExhausted { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Short label for structured logs.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::RequestFailed { .. } => "request_failed",
            Self::Timeout { .. } => "timeout",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::EmptyResponse { .. } => "empty_response",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Json(_) => "json",
        }
    }
}

/// Conversation state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No transition from state {state} on event {event}")]
    NoTransition { state: String, event: String },

    #[error("Unknown profile field: {0}")]
    UnknownField(String),

    #[error("Intake incomplete: missing {0}")]
    IncompleteIntake(&'static str),
}

/// Failures at the generation pipeline boundary.
///
/// Everything the pipeline can hit is normalized into this type so the
/// conversation engine only ever sees one error family.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("No profile for user {user_id}")]
    ProfileMissing { user_id: i64 },

    #[error("Generation denied: {0:?}")]
    RateLimited(RateCheck),

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Router failure: {0}")]
    Router(LlmError),

    #[error("Generator failure: {0}")]
    Generator(LlmError),
}

impl GenerationError {
    /// Distinguishing cause for logs.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::ProfileMissing { .. } => "profile_missing",
            Self::RateLimited(_) => "rate_limited",
            Self::Storage(_) => "storage",
            Self::Router(e) | Self::Generator(e) => e.cause(),
        }
    }

    /// The message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::ProfileMissing { .. } => {
                "I couldn't find your profile. Use /start to set it up again.".to_string()
            }
            Self::RateLimited(check) => check.message(),
            Self::Storage(_) | Self::Router(_) | Self::Generator(_) => {
                "❌ Something went wrong while writing the fable. Please try again later."
                    .to_string()
            }
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
