//! Resumable file copy.
//!
//! Copies append to a `.partial` file next to the destination. If a previous
//! attempt was interrupted (a medium unplugged, a mirror gone away), the next
//! attempt continues from the partial's length. The caller verifies the
//! finished partial against the source digest before renaming it into place,
//! so a corrupt prefix is caught there and the partial discarded.

use crate::transfer::progress::{TransferSummary, TransferTimer};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Hidden partial path for a destination file.
pub fn partial_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

/// Copy `src` into `partial`, resuming from whatever `partial` already holds.
/// The partial is fsynced before returning.
pub fn copy_with_resume(src: &Path, partial: &Path) -> io::Result<TransferSummary> {
    let timer = TransferTimer::start();
    let mut source = File::open(src)?;
    let src_len = source.metadata()?.len();

    let mut dest = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(partial)?;

    let mut resumed_from = dest.metadata()?.len();
    if resumed_from > src_len {
        tracing::warn!(
            "Partial {} is longer than its source, starting over",
            partial.display()
        );
        dest.set_len(0)?;
        resumed_from = 0;
    }

    source.seek(SeekFrom::Start(resumed_from))?;
    dest.seek(SeekFrom::Start(resumed_from))?;

    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, source);
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, dest);
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    let dest = writer.into_inner().map_err(|e| e.into_error())?;
    dest.sync_all()?;

    Ok(timer.finish(copied, resumed_from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_copy() -> io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        fs::write(&src, vec![5u8; 10_000])?;
        let partial = partial_path_for(&dir.path().join("dst.bin"));

        let summary = copy_with_resume(&src, &partial)?;

        assert_eq!(summary.bytes, 10_000);
        assert_eq!(summary.resumed_from, 0);
        assert_eq!(fs::read(&partial)?, fs::read(&src)?);
        Ok(())
    }

    #[test]
    fn test_resume_appends_remainder() -> io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data)?;

        let partial = partial_path_for(&dir.path().join("dst.bin"));
        fs::write(&partial, &data[..12_345])?;

        let summary = copy_with_resume(&src, &partial)?;

        assert_eq!(summary.resumed_from, 12_345);
        assert_eq!(summary.bytes, 50_000 - 12_345);
        assert_eq!(fs::read(&partial)?, data);
        Ok(())
    }

    #[test]
    fn test_oversized_partial_restarts() -> io::Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src.bin");
        fs::write(&src, b"short")?;
        let partial = partial_path_for(&dir.path().join("dst.bin"));
        fs::write(&partial, b"much longer stale content")?;

        copy_with_resume(&src, &partial)?;

        assert_eq!(fs::read(&partial)?, b"short");
        Ok(())
    }

    #[test]
    fn test_partial_name_is_hidden() {
        let p = partial_path_for(Path::new("/m/FULL.pack"));
        assert_eq!(p, PathBuf::from("/m/.FULL.pack.partial"));
    }
}
