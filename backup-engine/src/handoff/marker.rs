//! Handoff marker: the medium's sequence number and ready flag.

use crate::handoff::MARKER_REL;
use crate::storage::StorageBackend;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffMarker {
    /// Strictly increases with every export
    pub sequence_number: u64,
    /// Set only once every file of this sequence's manifest verified on the medium
    pub ready: bool,
    pub exported_by: String,
    pub updated_at: DateTime<Utc>,
}

impl HandoffMarker {
    pub fn new(sequence_number: u64, ready: bool, exported_by: &str) -> Self {
        Self {
            sequence_number,
            ready,
            exported_by: exported_by.to_string(),
            updated_at: Utc::now(),
        }
    }
}

pub fn read_marker(medium: &dyn StorageBackend) -> Result<Option<HandoffMarker>> {
    if !medium.exists(MARKER_REL)? {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&medium.read(MARKER_REL)?)?))
}

pub fn write_marker(medium: &dyn StorageBackend, marker: &HandoffMarker) -> Result<()> {
    medium.write_atomic(MARKER_REL, &serde_json::to_vec_pretty(marker)?)
}
