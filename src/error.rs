//! Error taxonomy for generation requests
//!
//! Per-request errors never escape the request handler: they are folded into a
//! [`GenerationResult`](crate::generation::GenerationResult) carrying an
//! [`ErrorKind`] and a message. Only [`HarnessError::Startup`] is fatal.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for request-level operations
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Errors raised while serving a generation request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
    /// Registry accessed before startup completed
    #[error("model registry is not initialized")]
    NotInitialized,

    /// Empty prompt or out-of-range decoding parameter
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Variant selector outside {base, fine-tuned}
    #[error("unknown model variant: {0:?} (expected \"base\" or \"fine-tuned\")")]
    UnknownVariant(String),

    /// The backend raised an error
    #[error("generation failed: {0}")]
    GenerationFailure(String),

    /// The backend call exceeded its bound
    #[error("generation timed out after {}s", .0.as_secs_f64())]
    GenerationTimeout(Duration),

    /// Registry initialization failed
    #[error("startup failed: {0}")]
    Startup(String),
}

impl HarnessError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::InvalidRequest(_) | Self::UnknownVariant(_) => ErrorKind::InvalidRequest,
            Self::GenerationFailure(_) | Self::Startup(_) => ErrorKind::GenerationFailure,
            Self::GenerationTimeout(_) => ErrorKind::GenerationTimeout,
        }
    }
}

/// Reportable error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotInitialized,
    InvalidRequest,
    GenerationFailure,
    GenerationTimeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "NotInitialized"),
            Self::InvalidRequest => write!(f, "InvalidRequest"),
            Self::GenerationFailure => write!(f, "GenerationFailure"),
            Self::GenerationTimeout => write!(f, "GenerationTimeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_variant_is_invalid_request() {
        let err = HarnessError::UnknownVariant("large".to_string());
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("large"));
    }

    #[test]
    fn test_timeout_message() {
        let err = HarnessError::GenerationTimeout(Duration::from_secs(120));
        assert_eq!(err.kind(), ErrorKind::GenerationTimeout);
        assert_eq!(err.to_string(), "generation timed out after 120s");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::GenerationFailure).unwrap();
        assert_eq!(json, "\"generation_failure\"");
    }
}
