use thiserror::Error;

/// Error taxonomy for the daily digest pipeline.
///
/// Collaborator failures never corrupt store or cache state; they surface
/// as one of these variants and the caller decides how to proceed.
#[derive(Error, Debug)]
pub enum DaybriefError {
    /// Source-side fetch failure. Transient; a partial batch may still have
    /// been merged before this was reported.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// External summarizer failure or timeout. Any prior cached artifact is
    /// left untouched.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Distribution failure. Does not affect store or cache state.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Item store or summary cache I/O failure. Fatal to the current job
    /// invocation; the scheduler retries on its next regular fire.
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Day key is not a valid `YYYY-MM-DD` date.
    #[error("invalid day key: {0}")]
    InvalidDayKey(String),
}

impl From<rusqlite::Error> for DaybriefError {
    fn from(e: rusqlite::Error) -> Self {
        DaybriefError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DaybriefError {
    fn from(e: serde_json::Error) -> Self {
        DaybriefError::Storage(format!("serialization: {}", e))
    }
}

impl From<tokio::task::JoinError> for DaybriefError {
    fn from(e: tokio::task::JoinError) -> Self {
        DaybriefError::Storage(format!("blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, DaybriefError>;
