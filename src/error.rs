use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the cluster coordination layer
///
/// Lifecycle errors (`ProviderInit`, `Configuration`, `Join`, `Lifecycle`) are
/// returned to the caller. Per-message errors (`Decode`, `HandlerParse`,
/// `Handler`, `Transport` during fan-out) are logged where they happen and
/// never interrupt the coordinator.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The membership provider could not bind or initialize
    #[error("Provider initialization error: {0}")]
    ProviderInit(String),

    /// Invalid configuration, or a missing message handler at start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Joining the cluster failed or reached no peers
    #[error("Join error: {0}")]
    Join(String),

    /// Inbound cluster bytes were empty, truncated or malformed
    #[error("Decode error: {0}")]
    Decode(String),

    /// The binary codec failed to encode an envelope
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// The body of an application envelope is not a valid message
    #[error("Message parse error: {0}")]
    HandlerParse(String),

    /// The registered message handler rejected a message
    #[error("Message handler error: {0}")]
    Handler(String),

    /// This node's health score is above the configured threshold
    #[error("Cluster health score {score} exceeds threshold {threshold}")]
    Health { score: u32, threshold: u32 },

    /// Two members claim the same identity
    #[error("Fatal member conflict: {0}")]
    ConflictFatal(String),

    /// Operation not permitted in the coordinator's current state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Point-to-point delivery errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// System I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Health { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Lifecycle(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Configuration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::ProviderInit(_) => "provider_init_error",
            ClusterError::Configuration(_) => "configuration_error",
            ClusterError::Join(_) => "join_error",
            ClusterError::Decode(_) => "decode_error",
            ClusterError::Encode(_) => "encode_error",
            ClusterError::HandlerParse(_) => "handler_parse_error",
            ClusterError::Handler(_) => "handler_error",
            ClusterError::Health { .. } => "health_error",
            ClusterError::ConflictFatal(_) => "conflict_fatal",
            ClusterError::Lifecycle(_) => "lifecycle_error",
            ClusterError::Transport(_) => "transport_error",
            ClusterError::Io(_) => "io_error",
        }
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ClusterError::Decode(err.to_string())
    }
}

// Axum IntoResponse implementation for the monitoring endpoints
impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! decode_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Decode($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Decode(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! parse_error {
    ($msg:expr) => {
        $crate::error::ClusterError::HandlerParse($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::HandlerParse(format!($fmt, $($arg)*))
    };
}
