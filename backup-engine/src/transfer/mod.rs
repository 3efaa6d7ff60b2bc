//! Byte movement between storage roots.

pub mod copy;
pub mod progress;
