//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No destination available (tried: {})", format_tried(.tried))]
    NoDestinationAvailable { tried: Vec<(String, String)> },

    #[error("Integrity error: {path} expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Mirror {mirror} pending: {reason}")]
    MirrorPending { mirror: String, reason: String },

    #[error("Lock contention: {key} is held by another run")]
    LockContention { key: String },

    #[error("Removable medium unavailable: {0}")]
    MediumUnavailable(String),

    #[error("Handoff medium not ready (sequence {sequence})")]
    HandoffNotReady { sequence: u64 },

    #[error("Atomic commit failed for {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Delta error: {0}")]
    Delta(String),

    #[error("Run cancelled before commit")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_tried(tried: &[(String, String)]) -> String {
    if tried.is_empty() {
        return "none configured".to_string();
    }
    tried
        .iter()
        .map(|(id, reason)| format!("{id}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Config(_) => 2,
            EngineError::NoDestinationAvailable { .. } => 3,
            EngineError::Integrity { .. } => 4,
            EngineError::LockContention { .. } => 5,
            EngineError::MediumUnavailable(_) | EngineError::HandoffNotReady { .. } => 6,
            EngineError::MirrorPending { .. } => 10,
            _ => 1,
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected: impl ToString, actual: impl ToString) -> Self {
        EngineError::Integrity {
            path: path.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Failures a later scheduled invocation may clear without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::NoDestinationAvailable { .. }
                | EngineError::MirrorPending { .. }
                | EngineError::LockContention { .. }
                | EngineError::MediumUnavailable(_)
                | EngineError::HandoffNotReady { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let no_dest = EngineError::NoDestinationAvailable { tried: vec![] };
        let integrity = EngineError::integrity("/a", "00", "ff");
        let lock = EngineError::LockContention { key: "src.full".into() };

        assert_eq!(no_dest.exit_code(), 3);
        assert_eq!(integrity.exit_code(), 4);
        assert_eq!(lock.exit_code(), 5);
        assert_eq!(EngineError::Config("x".into()).exit_code(), 2);
    }

    #[test]
    fn test_no_destination_message_lists_candidates() {
        let err = EngineError::NoDestinationAvailable {
            tried: vec![
                ("disk-a".into(), "missing".into()),
                ("disk-b".into(), "low space".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("disk-a: missing"));
        assert!(msg.contains("disk-b: low space"));
    }

    #[test]
    fn test_integrity_is_not_transient() {
        assert!(!EngineError::integrity("/a", "1", "2").is_transient());
        assert!(EngineError::MediumUnavailable("usb".into()).is_transient());
    }
}
