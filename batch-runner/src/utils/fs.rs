//! Filesystem helpers shared across modules.
//!
//! These helpers attach operation + path context to IO errors.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error("creating directory", parent, e))
}

/// Whether a path exists. Permission errors count as "exists".
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(true)
}

/// Size of a file in bytes.
pub async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| io_error("reading metadata of", path, e))
}

/// Append a suffix to the final component of a path (`jobs.csv` + `.state.db`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Display name of a path: its file name, or the whole path when it has none.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/batches/jobs.csv"), ".state.db"),
            PathBuf::from("/batches/jobs.csv.state.db")
        );
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(Path::new("/tmp/input.tar.gz")), "input.tar.gz");
    }

    #[tokio::test]
    async fn test_file_size_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.bin");
        ensure_parent_dir(&path).await.unwrap();
        tokio::fs::write(&path, b"12345").await.unwrap();

        assert_eq!(file_size(&path).await.unwrap(), 5);
        assert!(path_exists(&path).await);
        assert!(file_size(&dir.path().join("missing")).await.is_err());
    }
}
