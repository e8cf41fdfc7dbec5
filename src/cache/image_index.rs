//! Persisted map of image content hashes to cached image files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::persist;
use crate::cache::types::CacheResult;

pub const IMAGE_HASH_INDEX_FILE: &str = "image_hashes.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHashEntry {
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImageHashIndex {
    path: PathBuf,
    entries: BTreeMap<String, ImageHashEntry>,
}

impl ImageHashIndex {
    /// Load the index; a missing file is an empty index.
    pub fn load(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, hash: &str) -> Option<&ImageHashEntry> {
        self.entries.get(hash)
    }

    pub fn insert(&mut self, hash: impl Into<String>, filename: impl Into<String>) {
        self.insert_at(hash, filename, Utc::now());
    }

    pub fn insert_at(
        &mut self,
        hash: impl Into<String>,
        filename: impl Into<String>,
        created_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            hash.into(),
            ImageHashEntry {
                filename: filename.into(),
                created_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries created at or before `cutoff` (all entries when `None`).
    pub fn older_than(&self, cutoff: Option<DateTime<Utc>>) -> Vec<(String, ImageHashEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| cutoff.map_or(true, |c| e.created_at <= c))
            .map(|(h, e)| (h.clone(), e.clone()))
            .collect()
    }

    pub fn remove(&mut self, hash: &str) -> Option<ImageHashEntry> {
        self.entries.remove(hash)
    }

    pub fn save(&self) -> CacheResult<()> {
        persist::write_json_atomic(&self.path, &self.entries)?;
        debug!("Saved {} image hashes to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_then_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(IMAGE_HASH_INDEX_FILE);

        let mut index = ImageHashIndex::load(&path).unwrap();
        assert!(index.is_empty());
        index.insert("abc123", "reminder_1.png");
        index.save().unwrap();

        let reloaded = ImageHashIndex::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("abc123").unwrap().filename, "reminder_1.png");
    }

    #[test]
    fn test_older_than_filters_by_created_at() {
        let dir = tempdir().unwrap();
        let mut index = ImageHashIndex::load(dir.path().join(IMAGE_HASH_INDEX_FILE)).unwrap();
        let now = Utc::now();
        index.insert_at("old", "a.png", now - Duration::days(10));
        index.insert_at("new", "b.png", now);

        let old = index.older_than(Some(now - Duration::days(1)));
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].0, "old");
        assert_eq!(index.older_than(None).len(), 2);
    }
}
