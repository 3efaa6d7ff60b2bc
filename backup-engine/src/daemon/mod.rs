//! Process-level concerns: run locks and signal handling.

pub mod lock;
pub mod shutdown;
