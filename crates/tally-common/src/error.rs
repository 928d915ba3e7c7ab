use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("uniqueness conflict: {0}")]
    Conflict(String),
    #[error("application {id} is still referenced by {metrics} metric(s)")]
    ApplicationInUse { id: i64, metrics: usize },
    #[error("partition is held by another consumer: {0}")]
    PartitionClaimed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TallyError {
    /// Errors after which the same entry should be retried instead of dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Io(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::Validation(_) => "validation",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Storage(_) => "storage",
            Self::Conflict(_) => "conflict",
            Self::ApplicationInUse { .. } => "application_in_use",
            Self::PartitionClaimed(_) => "partition_claimed",
            Self::NotFound(_) => "not_found",
            Self::InternalError(_) => "internal",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::TallyError;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TallyError::StorageUnavailable("pool timed out".to_string()).is_retryable());
        assert!(
            TallyError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "eof"))
                .is_retryable()
        );
        assert!(!TallyError::Validation("bucket counts".to_string()).is_retryable());
        assert!(!TallyError::Conflict("metrics_info_key".to_string()).is_retryable());
        assert!(!TallyError::InvalidEnvelope("missing name".to_string()).is_retryable());
        assert!(!TallyError::PartitionClaimed("agg-1a2b3c4d".to_string()).is_retryable());
    }
}
