use thiserror::Error;

/// Error taxonomy for the core. Variants are classified by kind, not by the
/// type that produced them, so callers can branch on retry/abort policy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad caller input: out-of-range week, unknown team, malformed scores.
    /// Local, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Missing foreign key, impossible score divergence, duplicate unique
    /// keys. The affected transaction rolls back; the process continues.
    #[error("data integrity: {0}")]
    Integrity(String),

    /// Monthly provider quota gate refused the call.
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Connection reset, timeout, 5xx. Retried with backoff; reclassified as
    /// fatal for the current task once retries are exhausted.
    #[error("provider unavailable: {0}")]
    ProviderTransient(String),

    /// 401/403 from the provider. Aborts the current task, no retry.
    #[error("provider auth failure: {0}")]
    ProviderAuth(String),

    /// Malformed provider response or another non-retryable provider failure.
    #[error("provider error: {0}")]
    ProviderFatal(String),

    #[error("an update task is already pending or running")]
    TaskInProgress,

    #[error("task cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// True when a bounded retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::ProviderTransient(_))
    }

    /// Short machine-readable kind, surfaced on admin endpoints and stored in
    /// failed task rows.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::Integrity(_) => "data_integrity",
            CoreError::QuotaExhausted(_) => "quota_exhausted",
            CoreError::ProviderTransient(_) => "provider_transient",
            CoreError::ProviderAuth(_) => "provider_auth",
            CoreError::ProviderFatal(_) => "provider_fatal",
            CoreError::TaskInProgress => "task_in_progress",
            CoreError::Cancelled => "cancelled",
            CoreError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::ProviderTransient("timeout".into()).is_transient());
        assert!(!CoreError::ProviderAuth("401".into()).is_transient());
        assert!(!CoreError::QuotaExhausted("90%".into()).is_transient());
        assert!(!CoreError::Validation("week 99".into()).is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoreError::TaskInProgress.kind(), "task_in_progress");
        assert_eq!(CoreError::Cancelled.kind(), "cancelled");
    }
}
