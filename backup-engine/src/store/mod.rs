//! Durable engine state.
//!
//! All mutable on-disk state (snapshot states, the artifact catalog, delivery
//! ledger, pending-mirror markers, run reports) goes through a [`StateStore`].
//! Components receive the store as `Arc<dyn StateStore>` instead of reaching
//! for paths themselves. Records are JSON documents addressed by
//! (namespace, name); every write is write-then-rename and `update` holds an
//! exclusive lock across its read-modify-write.

pub mod catalog;
pub mod ledger;

use crate::daemon::lock::FileLock;
use crate::utils::atomic::{is_temp_name, write_atomic};
use crate::utils::errors::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RECORD_EXT: &str = "json";

/// Repository interface for engine state.
pub trait StateStore: Send + Sync {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>>;

    fn save(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<()>;

    /// Returns `true` if a record was removed.
    fn delete(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Record names in a namespace, sorted.
    fn list(&self, namespace: &str) -> Result<Vec<String>>;

    /// Atomic read-modify-write. `f` receives the current record and returns
    /// the new one (`None` deletes it).
    fn update(
        &self,
        namespace: &str,
        name: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Result<Option<Vec<u8>>>,
    ) -> Result<()>;
}

/// Typed JSON helpers over any store.
pub trait StoreExt: StateStore {
    fn load_json<T: DeserializeOwned>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        match self.load(namespace, name)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, namespace: &str, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.save(namespace, name, &bytes)
    }

    fn load_all<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for name in self.list(namespace)? {
            if let Some(value) = self.load_json(namespace, &name)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    fn update_json<T, F>(&self, namespace: &str, name: &str, mut f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        self.update(namespace, name, &mut |current| {
            let current = match current {
                Some(bytes) => Some(serde_json::from_slice(&bytes)?),
                None => None,
            };
            match f(current)? {
                Some(next) => Ok(Some(serde_json::to_vec_pretty(&next)?)),
                None => Ok(None),
            }
        })
    }
}

impl<S: StateStore + ?Sized> StoreExt for S {}

/// Make an arbitrary identifier safe to use as a record or file name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Filesystem-backed store rooted at the engine's state directory.
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        namespace
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |dir, part| dir.join(sanitize_name(part)))
    }

    fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", sanitize_name(name), RECORD_EXT))
    }

    fn lock_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!(".{}.lock", sanitize_name(name)))
    }
}

impl StateStore for FsStateStore {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.record_path(namespace, name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.record_path(namespace, name), bytes)
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        match fs::remove_file(self.record_path(namespace, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.namespace_dir(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || is_temp_name(&name) {
                    return None;
                }
                name.strip_suffix(&format!(".{RECORD_EXT}")).map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn update(
        &self,
        namespace: &str,
        name: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Result<Option<Vec<u8>>>,
    ) -> Result<()> {
        let _guard = FileLock::exclusive(&self.lock_path(namespace, name))?;
        let current = self.load(namespace, name)?;
        match f(current)? {
            Some(next) => self.save(namespace, name, &next),
            None => self.delete(namespace, name).map(|_| ()),
        }
    }
}
