//! Content digests and verification.
//!
//! Every artifact is identified by the SHA-256 of its bytes. Hashing streams
//! through a fixed buffer so multi-gigabyte archives never sit in memory.
//! A mismatch is always an [`EngineError::Integrity`]; there is no tolerance.

use crate::utils::atomic::write_atomic;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Algorithm name written to digest sidecars.
pub const ALGORITHM: &str = "sha256";

/// Extension of the digest sidecar next to each artifact.
pub const SIDECAR_EXT: &str = "sha256";

/// A SHA-256 digest.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| EngineError::Archive(format!("invalid digest '{s}': {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Archive(format!("digest '{s}' is not 32 bytes")))?;
        Ok(Self(bytes))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let digest = Sha256::digest(data);
    ContentHash(digest.into())
}

/// Hash everything a reader yields, returning the digest and byte count.
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<(ContentHash, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((ContentHash(hasher.finalize().into()), total))
}

/// Hash a file by streaming it.
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path)?;
    let (hash, _) = hash_reader(&mut file)?;
    Ok(hash)
}

/// `Ok(true)` when the file's digest equals `expected`.
pub fn verify_file(path: &Path, expected: &ContentHash) -> Result<bool> {
    Ok(hash_file(path)? == *expected)
}

/// Hash `path` and fail with an integrity error unless it equals `expected`.
pub fn ensure_matches(path: &Path, expected: &ContentHash) -> Result<()> {
    let actual = hash_file(path)?;
    if actual != *expected {
        return Err(EngineError::integrity(path, expected, actual));
    }
    Ok(())
}

/// Writer adapter that hashes every byte passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> (W, ContentHash, u64) {
        (self.inner, ContentHash(self.hasher.finalize().into()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Path of the digest sidecar for an artifact.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

pub fn format_sidecar(hash: &ContentHash) -> String {
    format!("{} {}\n", ALGORITHM, hash.to_hex())
}

pub fn parse_sidecar(content: &str) -> Result<ContentHash> {
    let mut parts = content.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(algo), Some(hex)) if algo.eq_ignore_ascii_case(ALGORITHM) => ContentHash::from_hex(hex),
        (Some(algo), Some(_)) => Err(EngineError::Archive(format!(
            "unsupported digest algorithm '{algo}'"
        ))),
        _ => Err(EngineError::Archive("malformed digest sidecar".to_string())),
    }
}

pub fn write_sidecar(artifact: &Path, hash: &ContentHash) -> Result<()> {
    write_atomic(&sidecar_path(artifact), format_sidecar(hash).as_bytes())
}

pub fn read_sidecar(artifact: &Path) -> Result<ContentHash> {
    let content = std::fs::read_to_string(sidecar_path(artifact))?;
    parse_sidecar(&content)
}
