//! Utility modules for the backup engine.

pub mod atomic;
pub mod errors;
pub mod logger;

pub use errors::{EngineError, Result};
