//! Error types for kiln.

use thiserror::Error;

/// Result type alias using kiln's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kiln operations.
///
/// External tool failures are not errors: adapters report them as structured
/// results. This enum covers storage, configuration and programmer errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Host record not found
    #[error("Record not found: {0}")]
    RecordNotFound(i64),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Attaching an artifact to a host record failed
    #[error("Attach error: {0}")]
    Attach(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job options stored on the row do not parse
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::nil();
        let err = Error::JobNotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_record_not_found() {
        let err = Error::RecordNotFound(1406);
        assert_eq!(err.to_string(), "Record not found: 1406");
    }

    #[test]
    fn test_error_display_job() {
        let err = Error::Job("queue full".to_string());
        assert_eq!(err.to_string(), "Job error: queue full");
    }

    #[test]
    fn test_error_display_attach() {
        let err = Error::Attach("copy failed".to_string());
        assert_eq!(err.to_string(), "Attach error: copy failed");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("bad timeout".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad timeout");
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("empty program".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty program");
    }

    #[test]
    fn test_error_display_invalid_options() {
        let err = Error::InvalidOptions("invalid type: string \"300\", expected u32".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid job options: invalid type: string \"300\", expected u32"
        );
    }

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error:"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
