//! Destination Selector: pick the primary write root for a run.

use crate::storage::StorageBackend;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DestinationSelector {
    candidates: Vec<Arc<dyn StorageBackend>>,
    min_free_bytes: u64,
}

impl DestinationSelector {
    /// `candidates` are in priority order.
    pub fn new(candidates: Vec<Arc<dyn StorageBackend>>, min_free_bytes: u64) -> Self {
        Self {
            candidates,
            min_free_bytes,
        }
    }

    pub fn candidates(&self) -> &[Arc<dyn StorageBackend>] {
        &self.candidates
    }

    /// First candidate that exists, passes a real write check and has more
    /// than the free-space floor. Never falls back to an unverified root.
    pub fn select(&self) -> Result<Arc<dyn StorageBackend>> {
        let mut tried = Vec::with_capacity(self.candidates.len());

        for candidate in &self.candidates {
            match self.qualify(candidate.as_ref()) {
                Ok(free) => {
                    info!(
                        "Selected destination '{}' at {} ({} bytes free)",
                        candidate.id(),
                        candidate.root().display(),
                        free
                    );
                    return Ok(Arc::clone(candidate));
                }
                Err(reason) => {
                    warn!("Destination '{}' rejected: {}", candidate.id(), reason);
                    tried.push((candidate.id().to_string(), reason));
                }
            }
        }

        Err(EngineError::NoDestinationAvailable { tried })
    }

    fn qualify(&self, candidate: &dyn StorageBackend) -> std::result::Result<u64, String> {
        candidate.ensure_available().map_err(|e| e.to_string())?;
        candidate
            .check_writable()
            .map_err(|e| format!("write check failed: {e}"))?;

        let free = candidate
            .free_space()
            .map_err(|e| format!("free space unknown: {e}"))?;
        debug!("Destination '{}' has {} bytes free", candidate.id(), free);
        if !above_floor(free, self.min_free_bytes) {
            return Err(format!(
                "{} bytes free, not above floor of {} bytes",
                free, self.min_free_bytes
            ));
        }
        Ok(free)
    }
}

/// Free space must be strictly above the floor. A zero floor disables the check.
fn above_floor(free: u64, floor: u64) -> bool {
    floor == 0 || free > floor
}
