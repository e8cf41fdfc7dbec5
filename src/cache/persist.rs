//! Atomic JSON file operations.
//!
//! Writes go to a temporary sibling file which is synced and then renamed over
//! the canonical path. Readers only ever see the old file or the new one.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::cache::types::{CacheError, CacheResult};

/// Read and deserialize a JSON file. A missing file yields `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> CacheResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CacheError::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` as 2-space indented JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CacheResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| CacheError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let value: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_write_is_pretty_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");

        write_json_atomic(&path, &vec!["a"]).unwrap();
        write_json_atomic(&path, &vec!["b", "c"]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"b\""));
        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back.unwrap(), vec!["b", "c"]);

        // Only the canonical file is left behind.
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"[{ not json").unwrap();
        let err = read_json::<Vec<String>>(&path).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"1").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
