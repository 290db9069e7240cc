//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// The backing store cannot serve requests at all
    ///
    /// Callers must not interpret this as "no activity".
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A read or write against the store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The ingestion queue stayed saturated for the whole enqueue timeout
    #[error("Ingestion queue full: enqueue timed out after {timeout_ms}ms")]
    QueueFull { timeout_ms: u64 },

    /// The pipeline no longer accepts events
    #[error("Ingestion pipeline is closed")]
    PipelineClosed,

    /// A compliance rule has an unusable configuration
    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A mitigation directive could not be handed to its sink
    #[error("Failed to deliver directive via '{sink}': {reason}")]
    Delivery { sink: String, reason: String },

    /// Events were still unwritten when the pipeline finished draining
    #[error("Drain finished with {pending} unflushed events")]
    Drain { pending: usize },
}

impl AuditError {
    /// True for the "store unavailable" class, which must fail fast
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AuditError::StoreUnavailable(_))
    }
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Storage(e.to_string())
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(AuditError::StoreUnavailable("down".into()).is_unavailable());
        assert!(!AuditError::Storage("disk full".into()).is_unavailable());
        assert!(!AuditError::PipelineClosed.is_unavailable());
    }

    #[test]
    fn test_error_display() {
        let err = AuditError::InvalidRule {
            rule_id: "r1".to_string(),
            reason: "time window must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid rule 'r1': time window must be positive"
        );
        assert_eq!(
            AuditError::QueueFull { timeout_ms: 250 }.to_string(),
            "Ingestion queue full: enqueue timed out after 250ms"
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: AuditError = io.into();
        assert!(matches!(err, AuditError::Storage(ref m) if m.contains("boom")));
    }
}
