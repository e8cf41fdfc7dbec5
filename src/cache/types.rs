//! Types shared by the fingerprint store, the cache layout and the
//! migration / cleanup engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Anything the reminder parser hands us. Only these four fields take part in
/// deduplication; everything else the parser knows is opaque here.
pub trait Reminder {
    fn title(&self) -> &str;
    fn date(&self) -> &str;
    fn time(&self) -> &str;
    fn list(&self) -> &str;
}

/// Parsed reminder as produced by the parsing collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReminder {
    pub title: String,
    pub date: String,
    pub time: String,
    pub list: String,
    pub description: Option<String>,
    pub priority: Option<String>,
}

impl ParsedReminder {
    pub fn new(
        title: impl Into<String>,
        date: impl Into<String>,
        time: impl Into<String>,
        list: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            date: date.into(),
            time: time.into(),
            list: list.into(),
            description: None,
            priority: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

impl Reminder for ParsedReminder {
    fn title(&self) -> &str {
        &self.title
    }

    fn date(&self) -> &str {
        &self.date
    }

    fn time(&self) -> &str {
        &self.time
    }

    fn list(&self) -> &str {
        &self.list
    }
}

/// Hex-encoded SHA-256 over `title|date|time|list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFingerprint(String);

impl TaskFingerprint {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A successfully submitted reminder, as persisted in `task_cache.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(rename = "task_hash")]
    pub fingerprint: TaskFingerprint,
    pub title: String,
    pub date: String,
    pub time: String,
    pub list: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "microsoft_id", default)]
    pub external_id: Option<String>,
}

impl CacheRecord {
    /// True when the record is older than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .is_some_and(|expires| expires < now)
    }
}

/// Snapshot of the fingerprint store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub per_list_counts: BTreeMap<String, usize>,
    /// Records created within the last 24 hours.
    pub recent_count: usize,
}

/// Fingerprint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Records older than this are dropped on load and by `purge_expired`.
    pub ttl: Duration,
    /// How long the flush worker waits to coalesce writes.
    pub flush_delay: Duration,
    /// Capacity of the flush command queue.
    pub queue_capacity: usize,
}

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            flush_delay: Duration::from_millis(250),
            queue_capacity: 32,
        }
    }
}

/// Logical partition of the unified cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Images,
    Tasks,
    Config,
    Temp,
    Global,
    LegacyRoot,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 6] = [
        CacheCategory::Images,
        CacheCategory::Tasks,
        CacheCategory::Config,
        CacheCategory::Temp,
        CacheCategory::Global,
        CacheCategory::LegacyRoot,
    ];

    /// Subdirectory name under the cache root.
    pub fn dir_name(self) -> &'static str {
        match self {
            CacheCategory::Images => "images",
            CacheCategory::Tasks => "tasks",
            CacheCategory::Config => "config",
            CacheCategory::Temp => "temp",
            CacheCategory::Global => "global",
            CacheCategory::LegacyRoot => "legacy",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for CacheCategory {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheCategory::ALL
            .into_iter()
            .find(|c| c.dir_name() == s)
            .ok_or_else(|| CacheError::UnknownCategory(s.to_string()))
    }
}

/// File count and size of one category directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// One unit of legacy data to relocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationItem {
    pub category: CacheCategory,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub items: Vec<MigrationItem>,
    pub total_size: u64,
    pub migration_required: bool,
}

/// Migration policy.
///
/// When both `skip_existing` and `force_overwrite` are set, `force_overwrite`
/// wins and occupied destinations are overwritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub dry_run: bool,
    pub backup: bool,
    pub delete_source: bool,
    pub skip_existing: bool,
    pub force_overwrite: bool,
}

impl MigrationOptions {
    /// Whether an item whose destination is already occupied is left alone.
    pub fn skips_occupied(&self) -> bool {
        self.skip_existing && !self.force_overwrite
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub item: MigrationItem,
    pub error: String,
    /// Bytes written to the destination before the item stopped.
    #[serde(default)]
    pub bytes_copied: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub migrated: Vec<MigrationItem>,
    pub would_migrate: Vec<MigrationItem>,
    pub skipped: Vec<MigrationItem>,
    pub failed: Vec<MigrationFailure>,
    pub backups: Vec<PathBuf>,
    pub total_bytes_moved: u64,
    pub cancelled: bool,
}

impl MigrationResult {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Cleanup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanCategory {
    Tasks,
    Images,
    ImageHashes,
    Temp,
    Generated,
}

impl CleanCategory {
    pub const ALL: [CleanCategory; 5] = [
        CleanCategory::Tasks,
        CleanCategory::Images,
        CleanCategory::ImageHashes,
        CleanCategory::Temp,
        CleanCategory::Generated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CleanCategory::Tasks => "tasks",
            CleanCategory::Images => "images",
            CleanCategory::ImageHashes => "image-hashes",
            CleanCategory::Temp => "temp",
            CleanCategory::Generated => "generated",
        }
    }
}

impl fmt::Display for CleanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanCategory {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imageHashes" | "image_hashes" => Ok(CleanCategory::ImageHashes),
            other => CleanCategory::ALL
                .into_iter()
                .find(|c| c.as_str() == other)
                .ok_or_else(|| CacheError::UnknownCategory(other.to_string())),
        }
    }
}

/// Which categories a cleanup pass walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanSelection {
    All,
    Only(Vec<CleanCategory>),
}

impl CleanSelection {
    /// Parse `all` or a list of category names. An empty list selects nothing.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> CacheResult<Self> {
        if names.iter().any(|n| n.as_ref() == "all") {
            return Ok(CleanSelection::All);
        }
        let mut categories = Vec::with_capacity(names.len());
        for name in names {
            let category: CleanCategory = name.as_ref().parse()?;
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        Ok(CleanSelection::Only(categories))
    }

    pub fn categories(&self) -> Vec<CleanCategory> {
        match self {
            CleanSelection::All => CleanCategory::ALL.to_vec(),
            CleanSelection::Only(categories) => categories.clone(),
        }
    }
}

impl Default for CleanSelection {
    fn default() -> Self {
        CleanSelection::Only(Vec::new())
    }
}

/// Cleanup pass options.
#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    pub categories: CleanSelection,
    pub dry_run: bool,
    /// Caller already confirmed. Never implies `clear_all`.
    pub force: bool,
    /// `<integer><unit>` with unit in d/h/m; empty means no age restriction.
    pub older_than: String,
    /// Wipe the whole fingerprint store regardless of age.
    pub clear_all: bool,
}

/// Outcome of cleaning one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanResult {
    pub category: CleanCategory,
    pub files_count: usize,
    pub size_bytes: u64,
    /// Paths (or record keys for record-set categories); preview mode only.
    pub files: Vec<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl CleanResult {
    pub fn new(category: CleanCategory) -> Self {
        Self {
            category,
            files_count: 0,
            size_bytes: 0,
            files: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub(crate) fn record(&mut self, entry: impl Into<String>, size: u64, dry_run: bool) {
        self.files_count += 1;
        self.size_bytes = self.size_bytes.saturating_add(size);
        if dry_run {
            self.files.push(entry.into());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanSummary {
    pub dry_run: bool,
    pub results: Vec<CleanResult>,
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_duration: Duration,
    /// Records wiped (or, in preview, that would be wiped) by `clear_all`.
    pub cleared_records: Option<usize>,
    pub cancelled: bool,
}

impl CleanSummary {
    pub(crate) fn push(&mut self, result: CleanResult) {
        self.total_files += result.files_count;
        self.total_bytes = self.total_bytes.saturating_add(result.size_bytes);
        self.results.push(result);
    }

    pub fn result_for(&self, category: CleanCategory) -> Option<&CleanResult> {
        self.results.iter().find(|r| r.category == category)
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.error.is_some())
    }
}

/// Error types for the cache subsystem
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache file {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid age filter '{0}': expected <integer><d|h|m>, e.g. 7d")]
    InvalidAgeFilter(String),

    #[error("Unknown cache category: {0}")]
    UnknownCategory(String),

    #[error("Fingerprint store is closed")]
    StoreClosed,

    #[error("Fingerprint store is open; migrate before opening it")]
    StoreOpen,

    #[error("Operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for the cache subsystem
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip_names() {
        for category in CacheCategory::ALL {
            let parsed: CacheCategory = category.dir_name().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("thumbnails".parse::<CacheCategory>().is_err());
    }

    #[test]
    fn test_clean_selection_parse() {
        assert_eq!(CleanSelection::parse(&["all"]).unwrap(), CleanSelection::All);
        let sel = CleanSelection::parse(&["tasks", "imageHashes", "tasks"]).unwrap();
        assert_eq!(
            sel.categories(),
            vec![CleanCategory::Tasks, CleanCategory::ImageHashes]
        );
        assert!(CleanSelection::parse(&["bogus"]).is_err());
        assert_eq!(CleanSelection::All.categories().len(), 5);
    }

    #[test]
    fn test_force_overwrite_wins_over_skip_existing() {
        let options = MigrationOptions {
            skip_existing: true,
            force_overwrite: true,
            ..Default::default()
        };
        assert!(!options.skips_occupied());

        let options = MigrationOptions {
            skip_existing: true,
            ..Default::default()
        };
        assert!(options.skips_occupied());
    }

    #[test]
    fn test_record_expiry() {
        let now = Utc::now();
        let record = CacheRecord {
            fingerprint: TaskFingerprint::from_hex("ab".into()),
            title: "t".into(),
            date: "2024-12-25".into(),
            time: "09:30".into(),
            list: "Work".into(),
            created_at: now - chrono::Duration::days(31),
            external_id: None,
        };
        assert!(record.is_expired(DEFAULT_TTL, now));
        assert!(!record.is_expired(Duration::from_secs(40 * 24 * 3600), now));
    }

    #[test]
    fn test_expiry_saturates_instead_of_overflowing() {
        let now = Utc::now();
        let mut record = CacheRecord {
            fingerprint: TaskFingerprint::from_hex("ab".into()),
            title: "t".into(),
            date: "2024-12-25".into(),
            time: "09:30".into(),
            list: "Work".into(),
            created_at: now,
            external_id: None,
        };
        assert!(!record.is_expired(Duration::from_secs(9_000_000_000_000), now));

        record.created_at = DateTime::<Utc>::MAX_UTC;
        assert!(!record.is_expired(DEFAULT_TTL, now));
    }
}
