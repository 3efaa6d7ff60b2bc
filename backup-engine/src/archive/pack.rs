//! Pack container format.
//!
//! A pack is a stream of length-prefixed JSON records, optionally wrapped in
//! zstd:
//!
//! ```text
//! MAGIC "BKPACK01"
//! [u32 LE len][PackHeader JSON]
//! [u32 LE len][PackRecord JSON] [file bytes, for File records] ...
//! [u32 LE len][PackRecord::End JSON]
//! ```
//!
//! Records carry mode bits and mtimes, so extraction reproduces attributes
//! as well as content. Removal records let an incremental pack express
//! deletions relative to its parent.

use crate::archive::naming::ArtifactKind;
use crate::fs::metadata::FileAttributes;
use crate::fs::walker::{EntryKind, ScanEntry};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use tokio_util::sync::CancellationToken;

const PACK_MAGIC: &[u8; 8] = b"BKPACK01";
const FORMAT_VERSION: u32 = 1;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackHeader {
    pub format_version: u32,
    pub kind: ArtifactKind,
    pub source_id: String,
    pub generation: u64,
    /// Baseline artifact this pack's chain is measured against
    pub baseline: Option<String>,
    /// Artifact this pack is a delta of (None for a full pack)
    pub parent: Option<String>,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

impl PackHeader {
    pub fn new(
        kind: ArtifactKind,
        source_id: &str,
        generation: u64,
        baseline: Option<String>,
        parent: Option<String>,
        host: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            kind,
            source_id: source_id.to_string(),
            generation,
            baseline,
            parent,
            host: host.to_string(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackRecord {
    File {
        path: String,
        size: u64,
        attrs: FileAttributes,
    },
    Dir {
        path: String,
        attrs: FileAttributes,
    },
    Symlink {
        path: String,
        target: String,
    },
    Removed {
        path: String,
    },
    End {
        entries: u64,
        bytes: u64,
    },
}

/// What a pack captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackStats {
    pub entries: u64,
    pub files: u64,
    pub content_bytes: u64,
    pub removed: u64,
}

/// What goes into a pack.
pub struct PackInput<'a> {
    pub header: PackHeader,
    pub entries: Vec<&'a ScanEntry>,
    pub removed: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "algorithm")]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

/// Packages a capture into an artifact stream and reads it back.
pub trait Archiver: Send + Sync {
    /// File extension for artifacts this archiver writes.
    fn extension(&self) -> &'static str;

    fn write_pack(&self, input: &PackInput<'_>, out: &mut dyn Write, cancel: &CancellationToken) -> Result<PackStats>;

    fn open<'a>(&self, input: Box<dyn Read + 'a>) -> Result<PackReader<Box<dyn Read + 'a>>>;
}

/// The engine's archiver: pack records with optional zstd compression.
#[derive(Debug, Clone, Copy)]
pub struct PackArchiver {
    compression: Compression,
}

impl PackArchiver {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Archiver able to read an artifact with the given extension.
    pub fn for_extension(extension: &str) -> Result<Self> {
        match extension {
            "pack" => Ok(Self::new(Compression::None)),
            "pack.zst" => Ok(Self::new(Compression::Zstd { level: 3 })),
            other => Err(EngineError::Archive(format!("unknown artifact extension '{other}'"))),
        }
    }
}

impl Archiver for PackArchiver {
    fn extension(&self) -> &'static str {
        match self.compression {
            Compression::None => "pack",
            Compression::Zstd { .. } => "pack.zst",
        }
    }

    fn write_pack(&self, input: &PackInput<'_>, out: &mut dyn Write, cancel: &CancellationToken) -> Result<PackStats> {
        match self.compression {
            Compression::None => write_records(input, out, cancel),
            Compression::Zstd { level } => {
                let mut encoder = zstd::stream::write::Encoder::new(out, level)?;
                let stats = write_records(input, &mut encoder, cancel)?;
                encoder.finish()?;
                Ok(stats)
            }
        }
    }

    fn open<'a>(&self, input: Box<dyn Read + 'a>) -> Result<PackReader<Box<dyn Read + 'a>>> {
        let stream: Box<dyn Read + 'a> = match self.compression {
            Compression::None => input,
            Compression::Zstd { .. } => Box::new(zstd::stream::read::Decoder::new(input)?),
        };
        PackReader::new(stream)
    }
}

fn write_frame<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| EngineError::Archive("pack record too large".into()))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&bytes)?;
    Ok(())
}

fn write_records(input: &PackInput<'_>, out: &mut dyn Write, cancel: &CancellationToken) -> Result<PackStats> {
    let mut stats = PackStats::default();

    out.write_all(PACK_MAGIC)?;
    write_frame(out, &input.header)?;

    for path in input.removed {
        write_frame(out, &PackRecord::Removed { path: path.clone() })?;
        stats.removed += 1;
        stats.entries += 1;
    }

    for entry in &input.entries {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match entry.kind {
            EntryKind::File => {
                let file = File::open(&entry.path)?;
                write_frame(
                    out,
                    &PackRecord::File {
                        path: entry.relative.clone(),
                        size: entry.size,
                        attrs: entry.attrs,
                    },
                )?;
                let copied = io::copy(&mut file.take(entry.size), &mut *out)?;
                if copied != entry.size {
                    return Err(EngineError::Archive(format!(
                        "{} shrank during capture ({} of {} bytes)",
                        entry.path.display(),
                        copied,
                        entry.size
                    )));
                }
                stats.files += 1;
                stats.content_bytes += entry.size;
            }
            EntryKind::Dir => write_frame(
                out,
                &PackRecord::Dir {
                    path: entry.relative.clone(),
                    attrs: entry.attrs,
                },
            )?,
            EntryKind::Symlink => write_frame(
                out,
                &PackRecord::Symlink {
                    path: entry.relative.clone(),
                    target: entry.link_target.clone().unwrap_or_default(),
                },
            )?,
        }
        stats.entries += 1;
    }

    write_frame(
        out,
        &PackRecord::End {
            entries: stats.entries,
            bytes: stats.content_bytes,
        },
    )?;
    out.flush()?;
    Ok(stats)
}

/// Sequential reader over a pack stream.
pub struct PackReader<R> {
    inner: R,
    header: PackHeader,
    /// Unread content bytes of the current File record
    remaining: u64,
    finished: bool,
}

impl<R: Read> PackReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact_or_truncated(&mut inner, &mut magic)?;
        if &magic != PACK_MAGIC {
            return Err(EngineError::Archive("not a pack stream (bad magic)".into()));
        }

        let header: PackHeader = read_frame(&mut inner)?;
        if header.format_version != FORMAT_VERSION {
            return Err(EngineError::Archive(format!(
                "unsupported pack format version {}",
                header.format_version
            )));
        }

        Ok(Self {
            inner,
            header,
            remaining: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &PackHeader {
        &self.header
    }

    /// Next record, or `None` after the end record. Content of a File record
    /// the caller did not copy out is skipped.
    pub fn next_record(&mut self) -> Result<Option<PackRecord>> {
        if self.finished {
            return Ok(None);
        }
        if self.remaining > 0 {
            self.copy_content(&mut io::sink())?;
        }

        let record: PackRecord = read_frame(&mut self.inner)?;
        match record {
            PackRecord::End { .. } => {
                self.finished = true;
                Ok(None)
            }
            PackRecord::File { size, .. } => {
                self.remaining = size;
                Ok(Some(record))
            }
            other => Ok(Some(other)),
        }
    }

    /// Copy the content of the current File record into `out`.
    pub fn copy_content(&mut self, out: &mut dyn Write) -> Result<u64> {
        let expected = self.remaining;
        let copied = io::copy(&mut (&mut self.inner).take(expected), &mut *out)?;
        self.remaining = 0;
        if copied != expected {
            return Err(EngineError::Archive(format!(
                "pack truncated: file content {copied} of {expected} bytes"
            )));
        }
        Ok(copied)
    }

    /// Read through every record, returning them without content.
    pub fn records(mut self) -> Result<Vec<PackRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

fn read_exact_or_truncated<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<()> {
    inner.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            EngineError::Archive("pack truncated".into())
        } else {
            EngineError::Io(e)
        }
    })
}

fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(inner: &mut R) -> Result<T> {
    let mut len = [0u8; 4];
    read_exact_or_truncated(inner, &mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(EngineError::Archive(format!("pack record length {len} exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    read_exact_or_truncated(inner, &mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walker::{walk_directory, WalkOptions};
    use std::fs;
    use tempfile::TempDir;

    fn header() -> PackHeader {
        PackHeader::new(ArtifactKind::Full, "projects", 0, None, None, "vault01", Utc::now())
    }

    fn pack_tree(archiver: &PackArchiver, dir: &TempDir, removed: &[String]) -> Vec<u8> {
        let scan = walk_directory(dir.path(), &WalkOptions::default()).unwrap();
        let input = PackInput {
            header: header(),
            entries: scan.iter().collect(),
            removed,
        };
        let mut out = Vec::new();
        archiver
            .write_pack(&input, &mut out, &CancellationToken::new())
            .unwrap();
        out
    }

    #[test]
    fn test_records_in_order_with_content() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("docs"))?;
        fs::write(dir.path().join("docs/readme.md"), b"# hello")?;

        let archiver = PackArchiver::new(Compression::Zstd { level: 3 });
        let bytes = pack_tree(&archiver, &dir, &["old.txt".to_string()]);

        let mut reader = archiver.open(Box::new(io::Cursor::new(bytes)))?;
        assert_eq!(reader.header().source_id, "projects");

        assert_eq!(reader.next_record()?, Some(PackRecord::Removed { path: "old.txt".into() }));
        assert!(matches!(reader.next_record()?, Some(PackRecord::Dir { ref path, .. }) if path == "docs"));
        match reader.next_record()? {
            Some(PackRecord::File { path, size, .. }) => {
                assert_eq!(path, "docs/readme.md");
                assert_eq!(size, 7);
            }
            other => panic!("unexpected record {other:?}"),
        }
        let mut content = Vec::new();
        reader.copy_content(&mut content)?;
        assert_eq!(content, b"# hello");
        assert_eq!(reader.next_record()?, None);
        Ok(())
    }

    #[test]
    fn test_unread_content_is_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.bin"), vec![1u8; 4096])?;
        fs::write(dir.path().join("b.bin"), vec![2u8; 10])?;

        let archiver = PackArchiver::new(Compression::None);
        let bytes = pack_tree(&archiver, &dir, &[]);
        let records = archiver.open(Box::new(io::Cursor::new(bytes)))?.records()?;

        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[test]
    fn test_truncated_pack_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.bin"), vec![9u8; 2048])?;

        let archiver = PackArchiver::new(Compression::None);
        let mut bytes = pack_tree(&archiver, &dir, &[]);
        bytes.truncate(bytes.len() - 100);

        let result = archiver.open(Box::new(io::Cursor::new(bytes)))?.records();
        assert!(matches!(result, Err(EngineError::Archive(_))));
        Ok(())
    }

    #[test]
    fn test_bad_magic() {
        let archiver = PackArchiver::new(Compression::None);
        let result = archiver.open(Box::new(io::Cursor::new(b"NOTAPACK........".to_vec())));
        assert!(matches!(result, Err(EngineError::Archive(_))));
    }

    #[test]
    fn test_cancelled_write() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"a")?;
        let scan = walk_directory(dir.path(), &WalkOptions::default())?;
        let input = PackInput {
            header: header(),
            entries: scan.iter().collect(),
            removed: &[],
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = PackArchiver::new(Compression::None).write_pack(&input, &mut Vec::new(), &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        Ok(())
    }

    #[test]
    fn test_extension_mapping() -> Result<()> {
        assert_eq!(PackArchiver::new(Compression::None).extension(), "pack");
        assert_eq!(PackArchiver::for_extension("pack.zst")?.extension(), "pack.zst");
        assert!(PackArchiver::for_extension("tar.gz").is_err());
        Ok(())
    }
}
