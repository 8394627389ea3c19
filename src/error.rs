use crate::db::models::BetStatus;

/// Failures surfaced by storage and the decision pipeline.
///
/// Invariant violations (duplicates, illegal transitions, caps, disabled
/// segments) are always reported through this type, never silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Duplicate candidate: {0}")]
    DuplicateCandidate(String),

    #[error("Daily cap reached for {scope}: {count}/{limit}")]
    DailyCapReached { scope: String, count: i64, limit: i64 },

    #[error("Illegal transition for bet {bet_id}: {from} -> {to}")]
    IllegalTransition {
        bet_id: i64,
        from: BetStatus,
        to: BetStatus,
    },

    #[error("Bet {0} not found")]
    BetNotFound(i64),

    #[error("Event {0} has no stored odds")]
    UnknownEvent(String),

    #[error("Segment {0} is DISABLED")]
    SegmentDisabled(String),

    #[error("Segment {0} is not publishable")]
    NotPublishable(String),

    #[error("A non-empty reason is required")]
    MissingReason,

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl PipelineError {
    /// Whether the failure is worth retrying (busy / locked database).
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the failure is a rejected invariant rather than an I/O fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidSnapshot(_)
                | PipelineError::DuplicateCandidate(_)
                | PipelineError::DailyCapReached { .. }
                | PipelineError::IllegalTransition { .. }
                | PipelineError::BetNotFound(_)
                | PipelineError::UnknownEvent(_)
                | PipelineError::SegmentDisabled(_)
                | PipelineError::NotPublishable(_)
                | PipelineError::MissingReason
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_database_is_transient() {
        let err = PipelineError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_transient());
        assert!(!err.is_rejection());
    }

    #[test]
    fn invariant_violations_are_rejections() {
        assert!(PipelineError::MissingReason.is_rejection());
        assert!(PipelineError::DuplicateCandidate("x".into()).is_rejection());
        assert!(!PipelineError::LockPoisoned.is_transient());
    }
}
