//! Fingerprint store: at-most-once submission tracking for reminders.
//!
//! The in-memory map is the live view; `task_cache.json` is the source of
//! truth at open time and is rewritten in the background after mutations.
//!
//! Durability: `record_submission` returns once the record is visible in
//! memory. The disk write happens later on the flush task, so a crash before
//! that write loses the record. Call [`FingerprintStore::flush`] when the
//! caller needs the record on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::cache::flush::{FlushHandle, RecordMap, SnapshotWriter};
use crate::cache::persist;
use crate::cache::types::{
    CacheError, CacheRecord, CacheResult, Reminder, StoreConfig, StoreStats, TaskFingerprint,
};

/// Compute the dedup key of a reminder: SHA-256 over `title|date|time|list`.
pub fn fingerprint<R: Reminder + ?Sized>(reminder: &R) -> TaskFingerprint {
    let key = format!(
        "{}|{}|{}|{}",
        reminder.title(),
        reminder.date(),
        reminder.time(),
        reminder.list()
    );
    TaskFingerprint::from_hex(hex::encode(Sha256::digest(key.as_bytes())))
}

/// Deduplication cache for submitted reminders
#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    config: StoreConfig,
    records: Arc<RwLock<RecordMap>>,
    io_lock: Arc<tokio::sync::Mutex<()>>,
    flusher: FlushHandle,
}

impl FingerprintStore {
    /// Open the store backed by `path` with default configuration.
    pub async fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        Self::open_with_config(path, StoreConfig::default()).await
    }

    /// Load `path` (missing file = empty store) and start the flush task.
    ///
    /// Must be called from within a tokio runtime. A corrupt file is returned
    /// as [`CacheError::Serialization`]; the caller decides whether to start
    /// empty instead.
    #[instrument(skip(path, config), fields(path = %path.as_ref().display()))]
    pub async fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            persist::read_json::<Vec<CacheRecord>>(&load_path)
        })
        .await
        .map_err(|e| CacheError::io(&path, std::io::Error::other(e)))??;

        let now = Utc::now();
        let mut records = RecordMap::new();
        let mut expired = 0usize;
        for record in loaded.unwrap_or_default() {
            if record.is_expired(config.ttl, now) {
                expired += 1;
                continue;
            }
            records.insert(record.fingerprint.clone(), record);
        }
        info!(
            "Loaded {} task records from {} ({} expired dropped)",
            records.len(),
            path.display(),
            expired
        );

        let records = Arc::new(RwLock::new(records));
        let io_lock = Arc::new(tokio::sync::Mutex::new(()));
        let writer = SnapshotWriter::new(path.clone(), Arc::clone(&records), Arc::clone(&io_lock));
        let flusher = FlushHandle::spawn(writer, config.flush_delay, config.queue_capacity);

        Ok(Self {
            path,
            config,
            records,
            io_lock,
            flusher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True iff a non-expired record with the same fingerprint exists.
    pub fn is_duplicate<R: Reminder + ?Sized>(&self, reminder: &R) -> bool {
        self.lookup(reminder).is_some()
    }

    pub fn lookup<R: Reminder + ?Sized>(&self, reminder: &R) -> Option<CacheRecord> {
        let key = fingerprint(reminder);
        let now = Utc::now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(&key)
            .filter(|r| !r.is_expired(self.config.ttl, now))
            .cloned()
    }

    /// Record a successful submission and schedule a flush.
    ///
    /// The record is visible to readers when this returns; the disk write is
    /// not. Fails only when the flush task has been stopped, in which case the
    /// record is still held in memory.
    pub fn record_submission<R: Reminder + ?Sized>(
        &self,
        reminder: &R,
        external_id: Option<&str>,
    ) -> CacheResult<CacheRecord> {
        self.record_submission_at(reminder, external_id, Utc::now())
    }

    /// Like [`record_submission`](Self::record_submission) with an explicit timestamp.
    pub fn record_submission_at<R: Reminder + ?Sized>(
        &self,
        reminder: &R,
        external_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> CacheResult<CacheRecord> {
        let record = CacheRecord {
            fingerprint: fingerprint(reminder),
            title: reminder.title().to_string(),
            date: reminder.date().to_string(),
            time: reminder.time().to_string(),
            list: reminder.list().to_string(),
            created_at,
            external_id: external_id.map(str::to_string),
        };

        {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records.insert(record.fingerprint.clone(), record.clone());
        }
        debug!("Recorded submission {} ({})", record.fingerprint, record.title);

        self.flusher.schedule()?;
        Ok(record)
    }

    /// Remove every record older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.config.ttl;
        let removed = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let before = records.len();
            records.retain(|_, r| !r.is_expired(ttl, now));
            before - records.len()
        };

        if removed > 0 {
            info!("Purged {} expired task records", removed);
            if let Err(e) = self.flusher.schedule() {
                warn!("Could not schedule flush after purge: {}", e);
            }
        }
        removed
    }

    /// Remove (or in `dry_run`, list) records created at or before `cutoff`.
    /// `None` selects every record.
    pub fn remove_older_than(
        &self,
        cutoff: Option<DateTime<Utc>>,
        dry_run: bool,
    ) -> Vec<CacheRecord> {
        let selected = |r: &CacheRecord| cutoff.map_or(true, |c| r.created_at <= c);

        let mut matched: Vec<CacheRecord> = if dry_run {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            records.values().filter(|r| selected(*r)).cloned().collect()
        } else {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<TaskFingerprint> = records
                .values()
                .filter(|r| selected(*r))
                .map(|r| r.fingerprint.clone())
                .collect();
            keys.iter().filter_map(|k| records.remove(k)).collect()
        };
        matched.sort_by_key(|r| r.created_at);

        if !dry_run && !matched.is_empty() {
            if let Err(e) = self.flusher.schedule() {
                warn!("Could not schedule flush after cleanup: {}", e);
            }
        }
        matched
    }

    pub fn stats(&self) -> StoreStats {
        let recent_cutoff = Utc::now() - ChronoDuration::hours(24);
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);

        let mut per_list_counts = BTreeMap::new();
        let mut recent_count = 0;
        for record in records.values() {
            *per_list_counts.entry(record.list.clone()).or_insert(0) += 1;
            if record.created_at > recent_cutoff {
                recent_count += 1;
            }
        }

        StoreStats {
            total_records: records.len(),
            per_list_counts,
            recent_count,
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<CacheRecord> {
        let mut all: Vec<CacheRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    /// Empty the map and delete the backing file.
    pub async fn clear(&self) -> CacheResult<usize> {
        let _io = self.io_lock.lock().await;
        let cleared = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let n = records.len();
            records.clear();
            n
        };
        persist::remove_if_exists(&self.path)?;
        info!("Cleared {} task records and removed {}", cleared, self.path.display());
        Ok(cleared)
    }

    /// Write the current record set now and wait for it.
    pub async fn flush(&self) -> CacheResult<()> {
        self.flusher.drain().await
    }

    /// Flush pending changes and stop the flush task.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.flusher.shutdown().await
    }

    /// Stop the flush task without writing pending changes, as a crash would.
    pub fn abort(&self) {
        self.flusher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::ParsedReminder;
    use std::time::Duration;
    use tempfile::tempdir;

    fn standup() -> ParsedReminder {
        ParsedReminder::new("Standup", "2024-12-25", "09:30", "Work")
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint(&standup());
        let b = fingerprint(&standup().with_description("notes").with_priority("high"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        // Stable across builds and restarts.
        assert_eq!(
            a.as_str(),
            hex::encode(Sha256::digest(b"Standup|2024-12-25|09:30|Work"))
        );
    }

    #[test]
    fn test_fingerprint_covers_every_key_field() {
        let base = fingerprint(&standup());
        let variants = [
            ParsedReminder::new("Standup!", "2024-12-25", "09:30", "Work"),
            ParsedReminder::new("Standup", "2024-12-26", "09:30", "Work"),
            ParsedReminder::new("Standup", "2024-12-25", "09:31", "Work"),
            ParsedReminder::new("Standup", "2024-12-25", "09:30", "Home"),
        ];
        for v in &variants {
            assert_ne!(fingerprint(v), base, "{v:?}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let dir = tempdir().unwrap();
        let store = FingerprintStore::open(dir.path().join("task_cache.json"))
            .await
            .unwrap();

        assert!(!store.is_duplicate(&standup()));
        store.record_submission(&standup(), Some("ext-1")).unwrap();

        assert!(store.is_duplicate(&standup().with_description("different")));
        let moved = ParsedReminder::new("Standup", "2024-12-26", "09:30", "Work");
        assert!(!store.is_duplicate(&moved));

        let record = store.lookup(&standup()).unwrap();
        assert_eq!(record.external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = tempdir().unwrap();
        let store = FingerprintStore::open(dir.path().join("task_cache.json"))
            .await
            .unwrap();

        let old = Utc::now() - ChronoDuration::days(45);
        store.record_submission_at(&standup(), None, old).unwrap();
        store
            .record_submission(&ParsedReminder::new("Lunch", "2024-12-25", "12:00", "Home"), None)
            .unwrap();

        // Expired records are invisible before they are purged.
        assert!(!store.is_duplicate(&standup()));
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_stats_counts_lists_and_recent() {
        let dir = tempdir().unwrap();
        let store = FingerprintStore::open(dir.path().join("task_cache.json"))
            .await
            .unwrap();

        store.record_submission(&standup(), None).unwrap();
        store
            .record_submission(&ParsedReminder::new("Retro", "2024-12-27", "15:00", "Work"), None)
            .unwrap();
        store
            .record_submission_at(
                &ParsedReminder::new("Dentist", "2024-12-28", "08:00", "Home"),
                None,
                Utc::now() - ChronoDuration::days(3),
            )
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.per_list_counts.get("Work"), Some(&2));
        assert_eq!(stats.per_list_counts.get("Home"), Some(&1));
        assert_eq!(stats.recent_count, 2);
    }

    #[tokio::test]
    async fn test_remove_older_than_dry_run_keeps_records() {
        let dir = tempdir().unwrap();
        let store = FingerprintStore::open(dir.path().join("task_cache.json"))
            .await
            .unwrap();
        let old = Utc::now() - ChronoDuration::days(10);
        store.record_submission_at(&standup(), None, old).unwrap();
        store
            .record_submission(&ParsedReminder::new("Retro", "2024-12-27", "15:00", "Work"), None)
            .unwrap();

        let cutoff = Some(Utc::now() - ChronoDuration::days(5));
        let preview = store.remove_older_than(cutoff, true);
        assert_eq!(preview.len(), 1);
        assert_eq!(store.len(), 2);

        let removed = store.remove_older_than(cutoff, false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].title, "Standup");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_reports_closed() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            flush_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let store = FingerprintStore::open_with_config(dir.path().join("task_cache.json"), config)
            .await
            .unwrap();
        store.shutdown().await.unwrap();

        let err = store.record_submission(&standup(), None).unwrap_err();
        assert!(matches!(err, CacheError::StoreClosed));
        // Still visible in memory.
        assert!(store.is_duplicate(&standup()));
    }
}
