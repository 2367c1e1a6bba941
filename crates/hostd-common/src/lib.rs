// Re-export dependencies used in public interfaces of common types

pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod api;
pub mod etag;
pub mod expiry;
pub mod names;

/// API version prefix used in every resource URL.
pub const API_VERSION: &str = "1.0";

/// Project used when a request does not name one.
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Error, Debug)]
pub enum HostdError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal Error: {0}")]
    Internal(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostdError {
    /// HTTP status a client sees for this error.
    ///
    /// Collaborator errors are passed through this classification unchanged,
    /// so a store reporting `NotFound` reads exactly like a local lookup miss.
    pub fn status_code(&self) -> u16 {
        match self {
            HostdError::BadRequest(_) => 400,
            HostdError::Forbidden(_) => 403,
            HostdError::NotFound(_) => 404,
            HostdError::Conflict(_) => 409,
            HostdError::PreconditionFailed(_) => 412,
            HostdError::Timeout(_) => 504,
            HostdError::Internal(_) | HostdError::Io(_) | HostdError::Json(_) => 500,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        HostdError::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HostdError::Internal(msg.into())
    }
}

// Define the primary Result type for hostd operations
pub type Result<T> = std::result::Result<T, HostdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(HostdError::bad_request("x").status_code(), 400);
        assert_eq!(HostdError::Conflict("x".into()).status_code(), 409);
        assert_eq!(HostdError::PreconditionFailed("x".into()).status_code(), 412);
        assert_eq!(HostdError::NotFound("x".into()).status_code(), 404);
        assert_eq!(HostdError::internal("x").status_code(), 500);

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(HostdError::from(json_err).status_code(), 500);
    }

    #[test]
    fn test_display_keeps_message() {
        let err = HostdError::Conflict("Name 'c1/snap0' already in use".to_string());
        assert_eq!(err.to_string(), "Name 'c1/snap0' already in use");
    }
}
