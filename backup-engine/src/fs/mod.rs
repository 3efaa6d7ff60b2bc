//! File system traversal and attribute handling.

pub mod metadata;
pub mod walker;
