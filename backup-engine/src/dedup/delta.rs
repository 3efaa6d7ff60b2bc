//! Byte-level deltas between artifacts (rsync rolling hash via fast_rsync).

use crate::utils::errors::{EngineError, Result};
use fast_rsync::{apply, diff, Signature, SignatureOptions};

/// Block size for artifact signatures (16KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Delta turning `base` into `target`.
pub fn encode(base: &[u8], target: &[u8], block_size: u32) -> Result<Vec<u8>> {
    let signature = Signature::calculate(
        base,
        SignatureOptions {
            block_size,
            crypto_hash_size: 8,
        },
    );
    let mut delta = Vec::new();
    diff(&signature.index(), target, &mut delta)
        .map_err(|e| EngineError::Delta(format!("diff failed: {e}")))?;
    Ok(delta)
}

pub fn decode(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    apply(base, delta, &mut out).map_err(|e| EngineError::Delta(format!("apply failed: {e}")))?;
    Ok(out)
}

/// Delta size as a fraction of the target size.
pub fn delta_ratio(delta_len: usize, target_len: usize) -> f64 {
    if target_len == 0 {
        return 1.0;
    }
    delta_len as f64 / target_len as f64
}
