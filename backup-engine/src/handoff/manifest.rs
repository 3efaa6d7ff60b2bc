//! Export manifest: what one export sequence put on the medium.

use crate::handoff::MANIFEST_REL;
use crate::integrity::ContentHash;
use crate::storage::StorageBackend;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Artifact id
    pub name: String,
    pub source_id: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Location on the medium, relative to its root
    pub path: String,
    pub sha256: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffManifest {
    pub sequence_number: u64,
    pub exported_by: String,
    pub created_at: DateTime<Utc>,
    /// Importers expected to acknowledge this export
    pub importers: Vec<String>,
    pub entries: Vec<ManifestEntry>,
}

impl HandoffManifest {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

pub fn read_manifest(medium: &dyn StorageBackend) -> Result<Option<HandoffManifest>> {
    if !medium.exists(MANIFEST_REL)? {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&medium.read(MANIFEST_REL)?)?))
}

pub fn write_manifest(medium: &dyn StorageBackend, manifest: &HandoffManifest) -> Result<()> {
    medium.write_atomic(MANIFEST_REL, &serde_json::to_vec_pretty(manifest)?)
}
