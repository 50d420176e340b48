//! Crash-safe file writes.
//!
//! Every persisted artifact goes through `write_atomic`: the bytes land in
//! a sibling temp file, get flushed and fsynced, then rename over the
//! target. A reader therefore sees the old content or the new content,
//! never a torn file. The parent directory fsync after the rename is best
//! effort; its failure is logged, not surfaced.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("atomic write of {path} failed: {source}")]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let wrap = |source: std::io::Error| WriteError {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            return Err(wrap(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "target has no parent directory",
            )));
        }
    };

    let mut tmp = NamedTempFile::new_in(parent).map_err(wrap)?;
    tmp.write_all(bytes).map_err(wrap)?;
    tmp.flush().map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.persist(path).map_err(|e| wrap(e.error))?;

    match fs::File::open(parent) {
        Ok(dir) => {
            if let Err(e) = dir.sync_all() {
                tracing::warn!(dir = %parent.display(), error = %e, "directory fsync failed");
            }
        }
        Err(e) => {
            tracing::warn!(dir = %parent.display(), error = %e, "directory open for fsync failed");
        }
    }
    Ok(())
}

/// `write_atomic` with a single retry for transient failures. The second
/// failure surfaces.
pub fn write_atomic_retry(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    match write_atomic(path, bytes) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(path = %path.display(), error = %first, "atomic write failed, retrying once");
            write_atomic(path, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        write_atomic(&target, b"first").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");

        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(&dir.path().join("out"), b"data").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0], "out");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nope").join("state.json");
        assert!(write_atomic(&target, b"x").is_err());
    }
}
