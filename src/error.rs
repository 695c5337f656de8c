use thiserror::Error;

#[derive(Debug, Error)]
pub enum FloorsumError {
    #[error("config invalid: {0}")]
    InvalidConfig(String),
    #[error("summarization cancelled")]
    Cancelled,
    #[error("summarizer call failed: {0}")]
    InvokeFailed(String),
    #[error("summarizer timed out after {0}s")]
    Timeout(u64),
    #[error("summarizer response rejected: {0}")]
    RejectedResponse(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl FloorsumError {
    /// Failures worth another attempt within the same batch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvokeFailed(_) | Self::Timeout(_) | Self::RejectedResponse(_)
        )
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
