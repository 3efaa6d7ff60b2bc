//! Backup Engine Library
//!
//! Incremental, content-verified backups with mirror replication and an
//! air-gapped handoff over removable media.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod dedup;
pub mod executor;
pub mod fs;
pub mod handoff;
pub mod integrity;
pub mod replication;
pub mod retention;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{Engine, Mode, RunOutcome, RunReport, RunRequest};
pub use utils::errors::{EngineError, Result};
