//! Error types for the session controller and its shared memory store.

use thiserror::Error;

use crate::memory_db::WorkStatus;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The store was used before `initialize()` or after `close()`.
    #[error("shared memory store not initialized, call initialize() first")]
    NotInitialized,

    /// A work item was asked to leave a state it cannot leave.
    #[error("work item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: WorkStatus,
        to: WorkStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Underlying SQLite failure.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("connection pool unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the failure came from the storage engine rather than the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Pool(_) | Error::Io(_) | Error::NotInitialized
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = Error::InvalidTransition {
            id: 7,
            from: WorkStatus::Completed,
            to: WorkStatus::Ready,
        };
        assert_eq!(err.to_string(), "work item 7 cannot move from completed to ready");
        assert!(!err.is_store_failure());
    }

    #[test]
    fn sqlite_errors_are_store_failures() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_store_failure());
        assert!(err.to_string().starts_with("store unavailable"));
    }
}
