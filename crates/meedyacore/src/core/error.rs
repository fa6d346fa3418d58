use thiserror::Error;

use crate::download::queue::DownloadState;

/// Centralized error types for the engine
///
/// Command-level failures (bad input, unknown ids) are returned to the caller.
/// Failures that happen inside a download are recorded on the work item instead
/// and surface to subscribers as `Failed` events, never as `AppError`.
///
/// # Example
///
/// ```no_run
/// use meedyacore::core::error::AppError;
///
/// fn handle_error(err: AppError) {
///     eprintln!("Error: {}", err);
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid URL, empty job, unknown codec name, malformed import file
    #[error("Invalid input: {0}")]
    UserInput(String),

    /// The downloader binary is missing or not executable
    #[error("Failed to start downloader: {0}")]
    Spawn(String),

    /// The downloader ran and failed
    #[error("Download failed: {0}")]
    Runtime(String),

    /// Every entry of the fallback chain was tried
    #[error("All {attempts} formats failed: {last_error}")]
    FallbackExhausted { attempts: usize, last_error: String },

    /// Snapshot could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Metadata tagging after a successful download
    #[error("Post-processing error: {0}")]
    PostProcessing(String),

    /// Unknown work item id
    #[error("Work item not found: {0}")]
    NotFound(String),

    /// State machine violation
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DownloadState,
        to: DownloadState,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// True for errors caused by what the caller passed in.
    pub fn is_user_error(&self) -> bool {
        matches!(self, AppError::UserInput(_) | AppError::Url(_) | AppError::NotFound(_))
    }
}

/// Helper function to convert String to AppError::Runtime
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Runtime(err)
    }
}

/// Helper function to convert &str to AppError::Runtime
impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        AppError::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_exhausted_message() {
        let err = AppError::FallbackExhausted {
            attempts: 3,
            last_error: "Codec not available".to_string(),
        };
        assert_eq!(err.to_string(), "All 3 formats failed: Codec not available");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = AppError::InvalidTransition {
            id: "abc".to_string(),
            from: DownloadState::Complete,
            to: DownloadState::Downloading,
        };
        assert_eq!(err.to_string(), "Invalid transition for abc: complete -> downloading");
    }

    #[test]
    fn test_user_error_classification() {
        assert!(AppError::UserInput("x".into()).is_user_error());
        assert!(AppError::NotFound("x".into()).is_user_error());
        assert!(!AppError::Spawn("x".into()).is_user_error());
        assert!(!AppError::from("boom").is_user_error());
    }
}
