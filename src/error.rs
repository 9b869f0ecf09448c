//! Error types shared by the buildmaster and the agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoozerError {
    /// Missing or malformed configuration. Not retried until a reload.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Network/DB/filesystem hiccup, safe to retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Client fault, never retried.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Long-poll expired without a row. Not an error for the caller.
    #[error("No data")]
    NoData,

    /// The build script exited non-zero. Terminal.
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// Worker infrastructure failure, retried up to the attempt limit.
    #[error("Build temporarily failed: {0}")]
    BuildTempFailed(String),
}

impl DoozerError {
    /// Whether a retry can make progress without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DoozerError::Transient(_) | DoozerError::Database(_) | DoozerError::BuildTempFailed(_)
        )
    }
}

impl From<sqlx::Error> for DoozerError {
    fn from(e: sqlx::Error) -> Self {
        DoozerError::Database(e.to_string())
    }
}

impl From<git2::Error> for DoozerError {
    fn from(e: git2::Error) -> Self {
        DoozerError::Git(e.message().to_string())
    }
}

impl From<std::io::Error> for DoozerError {
    fn from(e: std::io::Error) -> Self {
        DoozerError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for DoozerError {
    fn from(e: reqwest::Error) -> Self {
        DoozerError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for DoozerError {
    fn from(e: serde_json::Error) -> Self {
        DoozerError::BadRequest(format!("Malformed JSON: {}", e))
    }
}
