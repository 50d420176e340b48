//! Initial discovery walk.

use crate::registry::RECORD_FILE;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every aggregate record file under `root`, in directory order.
/// Unreadable entries are skipped with a log line.
pub fn scan_records(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && e.file_name().to_str() == Some(RECORD_FILE))
        .map(|e| e.into_path())
        .collect()
}
