//! Error taxonomy for the telemetry client
//!
//! Synchronous command failures are returned as [`ClientError`] at the call site.
//! Failures reported asynchronously by the transport never cross a call boundary;
//! the core records them (sanitized) in the observer snapshot instead.

use crate::client::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for telemetry client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed or missing credentials/trust material. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Connect failed: {message}")]
    Connect { message: String },

    #[error("Publish failed: {message}")]
    Publish { message: String },

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Timed out after {waited_ms}ms waiting for {target:?}")]
    Timeout {
        target: ConnectionState,
        waited_ms: u64,
    },
}

impl ClientError {
    /// Create connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create publish error
    pub fn publish<S: Into<String>>(message: S) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    /// Create configuration error from a plain message
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(crate::config::ConfigError::InvalidConfig(message.into()))
    }

    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Whether the caller may simply retry the operation later
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ClientError::Configuration(_))
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|sig)[=:]\s*[^\s&]+").expect("valid secret pattern")
});

static SAS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SharedAccessSignature\s+\S+").expect("valid SAS pattern"));

const MAX_ERROR_LEN: usize = 500;

/// Redact credentials from error text before it reaches logs or observers
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SAS_PATTERN.replace_all(message, "SharedAccessSignature ***");
    let mut sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
