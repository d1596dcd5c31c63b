//! Error taxonomy for the switch domain.
//!
//! Callers branch on the variant, never on message text: `Frozen` is
//! permanent, `Precondition` means re-fetch state before acting again,
//! `Storage` is the only variant worth retrying.

use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, SwitchError>;

#[derive(Debug, Error)]
pub enum SwitchError {
    /// The switch reached its terminal phase. Permanent; never retried.
    #[error("switch is terminal; no further mutations are possible")]
    Frozen,

    /// The operation is not valid in the current phase.
    #[error("precondition failed: {reason}")]
    Precondition { reason: String },

    /// The backing store rejected or lost the operation.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The broadcast transport failed. Recorded in the ledger, not retried.
    #[error("publish failed: {message}")]
    Publish { message: String },

    /// Bad secret, or an expired or unknown session token.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },
}

impl SwitchError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with(message: impl Into<String>, source: BoxedError) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with(message: impl Into<String>, source: BoxedError) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Stable taxonomy string used in logs and wire error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frozen => "frozen",
            Self::Precondition { .. } => "precondition",
            Self::Storage { .. } => "storage",
            Self::Publish { .. } => "publish",
            Self::Auth { .. } => "auth",
            Self::Config { .. } => "config",
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen)
    }

    /// Only storage failures are transient enough to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

impl From<rusqlite::Error> for SwitchError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
