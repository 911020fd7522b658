//! Error types for the adapter conditioning engine

use ipadapter_domain::DomainError;
use thiserror::Error;

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum IpAdapterError {
    /// Candle framework errors
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// A checkpoint tensor does not have the shape its projection expects
    #[error("Shape mismatch for '{tensor}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A tensor required by the selected projection is absent
    #[error("Missing tensor '{0}' in adapter checkpoint")]
    MissingTensor(String),
    /// The checkpoint lacks the per-layer key/value namespace
    #[error("Invalid adapter file: {0}")]
    InvalidAdapterFile(String),
    /// No embedding could be extracted from the conditioning input
    #[error("Missing conditioning: {0}")]
    MissingConditioning(String),
    /// Parameter validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] DomainError),
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IpAdapterError {
    /// Classify a failure raised while pulling weights out of a `VarBuilder`.
    pub fn from_weight_error(error: candle_core::Error) -> Self {
        match error {
            candle_core::Error::WithBacktrace { inner, .. } => Self::from_weight_error(*inner),
            candle_core::Error::CannotFindTensor { path } => Self::MissingTensor(path),
            candle_core::Error::UnexpectedShape { msg, expected, got } => Self::ShapeMismatch {
                tensor: msg
                    .strip_prefix("shape mismatch for ")
                    .unwrap_or(msg.as_str())
                    .to_string(),
                expected: expected.dims().to_vec(),
                actual: got.dims().to_vec(),
            },
            other => Self::Candle(other),
        }
    }
}

impl From<IpAdapterError> for candle_core::Error {
    fn from(error: IpAdapterError) -> Self {
        match error {
            IpAdapterError::Candle(e) => e,
            _ => candle_core::Error::Msg(error.to_string()),
        }
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, IpAdapterError>;
