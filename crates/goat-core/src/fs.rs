// SPDX-License-Identifier: CEPL-1.0
//! Whole-file reads for byte-code blobs and other small assets.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to open {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is empty")]
    Empty { path: PathBuf },
}

/// Reads the full contents of `path`, treating a zero-length file as an error.
pub fn read_file_checked(path: impl AsRef<Path>) -> Result<Vec<u8>, FileError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| FileError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(FileError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

/// Reads the full contents of `path`.
///
/// An unreadable or zero-length file logs an error and yields an empty vector;
/// callers must treat empty as failure.
pub fn read_file(path: impl AsRef<Path>) -> Vec<u8> {
    match read_file_checked(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("{e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_whole_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(read_file(f.path()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_file_yields_empty_vec() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(read_file(f.path()).is_empty());
        assert!(matches!(
            read_file_checked(f.path()),
            Err(FileError::Empty { .. })
        ));
    }

    #[test]
    fn missing_file_yields_empty_vec() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.spv");
        assert!(read_file(&missing).is_empty());
        let err = read_file_checked(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.spv"));
    }
}
