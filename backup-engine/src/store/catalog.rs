//! Artifact catalog.
//!
//! One record per committed artifact under `catalog/<source>`, naming the
//! primary root it was committed to. Retention, replication retries,
//! handoff export and restore all work from the catalog rather than from
//! directory listings, so an artifact on an unplugged root is still known.

use crate::archive::BackupArtifact;
use crate::store::{StateStore, StoreExt};
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub artifact: BackupArtifact,
    /// Primary root the artifact was committed to
    pub root_id: String,
    pub root: PathBuf,
    /// Path relative to `root`
    pub rel_path: String,
}

impl CatalogEntry {
    pub fn path(&self) -> PathBuf {
        self.rel_path
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    pub fn id(&self) -> &str {
        &self.artifact.id
    }
}

/// Relative location of an artifact inside any root.
pub fn artifact_rel_path(source_id: &str, artifact_id: &str) -> String {
    format!("{source_id}/{artifact_id}")
}

fn namespace(source_id: &str) -> String {
    format!("catalog/{source_id}")
}

pub struct ArtifactCatalog {
    store: Arc<dyn StateStore>,
}

impl ArtifactCatalog {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn insert(&self, entry: &CatalogEntry) -> Result<()> {
        self.store
            .save_json(&namespace(&entry.artifact.source_id), &entry.artifact.id, entry)
    }

    pub fn get(&self, source_id: &str, artifact_id: &str) -> Result<Option<CatalogEntry>> {
        self.store.load_json(&namespace(source_id), artifact_id)
    }

    pub fn remove(&self, source_id: &str, artifact_id: &str) -> Result<bool> {
        self.store.delete(&namespace(source_id), artifact_id)
    }

    /// Every artifact of a source, oldest first.
    pub fn list(&self, source_id: &str) -> Result<Vec<CatalogEntry>> {
        let mut entries: Vec<CatalogEntry> = self.store.load_all(&namespace(source_id))?;
        entries.sort_by(|a, b| {
            a.artifact
                .created_at
                .cmp(&b.artifact.created_at)
                .then_with(|| a.artifact.id.cmp(&b.artifact.id))
        });
        Ok(entries)
    }

    /// Artifacts grouped by baseline, oldest chain first; each chain is
    /// ordered by generation.
    pub fn chains(&self, source_id: &str) -> Result<Vec<Vec<CatalogEntry>>> {
        let mut by_baseline: BTreeMap<String, Vec<CatalogEntry>> = BTreeMap::new();
        for entry in self.list(source_id)? {
            by_baseline
                .entry(entry.artifact.baseline.clone())
                .or_default()
                .push(entry);
        }

        let mut chains: Vec<Vec<CatalogEntry>> = by_baseline.into_values().collect();
        for chain in &mut chains {
            chain.sort_by_key(|e| (e.artifact.generation, e.artifact.created_at));
        }
        chains.sort_by_key(|chain| chain.first().map(|e| e.artifact.created_at));
        Ok(chains)
    }

    /// The artifacts needed to reconstruct `artifact_id`: its baseline
    /// followed by every incremental up to and including it, following
    /// parent links.
    pub fn chain_to(&self, source_id: &str, artifact_id: &str) -> Result<Vec<CatalogEntry>> {
        let mut chain = Vec::new();
        let mut next = Some(artifact_id.to_string());

        while let Some(id) = next {
            let entry = self.get(source_id, &id)?.ok_or_else(|| {
                crate::utils::errors::EngineError::StateConflict(format!(
                    "artifact '{id}' of '{source_id}' is not in the catalog"
                ))
            })?;
            next = entry.artifact.parent.clone();
            chain.push(entry);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Most recently committed artifact of a source.
    pub fn latest(&self, source_id: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.list(source_id)?.pop())
    }
}
