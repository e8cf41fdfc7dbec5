//! Selective, age-filtered cache cleanup with preview mode.
//!
//! Directory categories (images, temp, generated) are walked on disk; the
//! task and image-hash categories are record sets and are cleaned through
//! their owners, so the task-cache file is only ever written by the
//! fingerprint store.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::cache::fingerprint::FingerprintStore;
use crate::cache::image_index::{ImageHashIndex, IMAGE_HASH_INDEX_FILE};
use crate::cache::layout::{walk_error, CacheLayout};
use crate::cache::types::{
    CacheCategory, CacheError, CacheResult, CleanCategory, CleanOptions, CleanResult,
    CleanSummary,
};

const AGE_FILTER_PATTERN: &str = r"^(\d+)([dhm])$";

/// Prefixes and substrings that mark a file as produced by the image
/// pipeline. Matching is by name only; contents are never inspected.
const GENERATED_PREFIXES: &[&str] = &["reminder_", "task_", "generated_"];
const GENERATED_SUBSTRINGS: &[&str] = &["_resized", "_processed"];
const GENERATED_SUFFIX: &str = ".png";

/// Parsed `--older-than` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgeFilter(Option<Duration>);

impl AgeFilter {
    /// `<integer><d|h|m>`; empty input means no age restriction.
    pub fn parse(input: &str) -> CacheResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self(None));
        }
        let invalid = || CacheError::InvalidAgeFilter(input.to_string());
        let re = Regex::new(AGE_FILTER_PATTERN).map_err(|_| invalid())?;
        let caps = re.captures(input).ok_or_else(invalid)?;
        let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit_secs = match &caps[2] {
            "d" => 24 * 60 * 60,
            "h" => 60 * 60,
            _ => 60,
        };
        let secs = amount.checked_mul(unit_secs).ok_or_else(invalid)?;
        Ok(Self(Some(Duration::from_secs(secs))))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    /// `now - duration`, or `None` when unrestricted.
    pub fn cutoff(&self, now: SystemTime) -> Option<SystemTime> {
        self.0
            .map(|d| now.checked_sub(d).unwrap_or(SystemTime::UNIX_EPOCH))
    }
}

/// Name-based detection of generated images.
pub fn is_generated_file(name: &str) -> bool {
    name.ends_with(GENERATED_SUFFIX)
        && (GENERATED_PREFIXES.iter().any(|p| name.starts_with(p))
            || GENERATED_SUBSTRINGS.iter().any(|s| name.contains(s)))
}

fn is_not_index_file(path: &Path) -> bool {
    path.file_name().map_or(true, |n| n != IMAGE_HASH_INDEX_FILE)
}

fn any_file(_: &Path) -> bool {
    true
}

fn generated_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_generated_file)
}

/// Delete the oldest files of `category` until it fits in `max_bytes`.
///
/// Only the images and temp categories hold evictable files; the image
/// hash index is never evicted.
pub fn evict_to_budget(
    layout: &CacheLayout,
    category: CacheCategory,
    max_bytes: u64,
    dry_run: bool,
    cancel: &CancellationToken,
) -> CacheResult<CleanResult> {
    let clean_category = match category {
        CacheCategory::Images => CleanCategory::Images,
        CacheCategory::Temp => CleanCategory::Temp,
        other => return Err(CacheError::UnknownCategory(other.to_string())),
    };
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }

    let started = Instant::now();
    let dir = layout.category_path(category);
    let mut result = CleanResult::new(clean_category);

    let mut files: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
    if dir.exists() {
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| walk_error(&dir, e))?;
            if !entry.file_type().is_file() || !is_not_index_file(entry.path()) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| walk_error(&dir, e))?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, meta.len(), entry.into_path()));
        }
    }

    let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
    files.sort_by_key(|(modified, _, _)| *modified);

    for (_, len, path) in files {
        if total <= max_bytes || cancel.is_cancelled() {
            break;
        }
        if !dry_run {
            if let Err(e) = fs::remove_file(&path) {
                result.error = Some(format!("failed to delete {}: {e}", path.display()));
                break;
            }
        }
        result.record(path.display().to_string(), len, dry_run);
        total = total.saturating_sub(len);
    }

    debug!(
        "{} budget {} bytes: evicted {} files ({} bytes)",
        category, max_bytes, result.files_count, result.size_bytes
    );
    result.duration = started.elapsed();
    Ok(result)
}

/// Result of walking one directory category.
struct Walk {
    result: CleanResult,
    cancelled: bool,
}

/// Age-filtered deletion across cache categories
#[derive(Debug, Clone)]
pub struct CleanupEngine {
    layout: CacheLayout,
    store: Arc<FingerprintStore>,
}

impl CleanupEngine {
    pub fn new(layout: CacheLayout, store: Arc<FingerprintStore>) -> Self {
        Self { layout, store }
    }

    /// Clean the selected categories.
    ///
    /// Entries whose modification (or creation) time is not after the cutoff
    /// are deleted, or only reported when `dry_run` is set. A deletion
    /// failure stops its own category; the others still run. `clear_all`
    /// additionally wipes the fingerprint store without any age filter.
    #[instrument(skip(self, options, cancel), fields(dry_run = options.dry_run))]
    pub async fn clean(
        &self,
        options: &CleanOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<CleanSummary> {
        let age = AgeFilter::parse(&options.older_than)?;
        let started = Instant::now();
        let cutoff = age.cutoff(SystemTime::now());
        let dry_run = options.dry_run;

        let mut summary = CleanSummary {
            dry_run,
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for category in options.categories.categories() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let walk = match category {
                CleanCategory::Tasks => self.clean_tasks(cutoff, dry_run).await,
                CleanCategory::ImageHashes => self.clean_image_hashes(cutoff, dry_run),
                CleanCategory::Images => self.clean_files(
                    category,
                    &[self.layout.category_path(CacheCategory::Images)],
                    is_not_index_file,
                    cutoff,
                    dry_run,
                    &mut seen,
                    cancel,
                ),
                CleanCategory::Temp => self.clean_files(
                    category,
                    &[self.layout.category_path(CacheCategory::Temp)],
                    any_file,
                    cutoff,
                    dry_run,
                    &mut seen,
                    cancel,
                ),
                CleanCategory::Generated => self.clean_files(
                    category,
                    &[
                        self.layout.category_path(CacheCategory::Images),
                        self.layout.category_path(CacheCategory::Temp),
                    ],
                    generated_file,
                    cutoff,
                    dry_run,
                    &mut seen,
                    cancel,
                ),
            };

            if let Some(error) = &walk.result.error {
                warn!("Cleanup of {} stopped: {}", category, error);
            }
            info!(
                "{} {}: {} entries, {} bytes",
                if dry_run { "Would clean" } else { "Cleaned" },
                category,
                walk.result.files_count,
                walk.result.size_bytes
            );
            summary.push(walk.result);
            if walk.cancelled {
                summary.cancelled = true;
                break;
            }
        }

        if options.clear_all && !summary.cancelled {
            let cleared = if dry_run {
                self.store.len()
            } else {
                self.store.clear().await?
            };
            summary.cleared_records = Some(cleared);
        }

        summary.total_duration = started.elapsed();
        Ok(summary)
    }

    /// See [`evict_to_budget`].
    pub fn evict_to_budget(
        &self,
        category: CacheCategory,
        max_bytes: u64,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<CleanResult> {
        evict_to_budget(&self.layout, category, max_bytes, dry_run, cancel)
    }

    async fn clean_tasks(&self, cutoff: Option<SystemTime>, dry_run: bool) -> Walk {
        let started = Instant::now();
        let mut result = CleanResult::new(CleanCategory::Tasks);
        let cutoff = cutoff.map(DateTime::<Utc>::from);

        for record in self.store.remove_older_than(cutoff, dry_run) {
            let size = serde_json::to_vec(&record).map_or(0, |b| b.len() as u64);
            result.record(record.fingerprint.to_string(), size, dry_run);
        }
        if !dry_run && result.files_count > 0 {
            if let Err(e) = self.store.flush().await {
                result.error = Some(format!("failed to persist task cache: {e}"));
            }
        }

        result.duration = started.elapsed();
        Walk {
            result,
            cancelled: false,
        }
    }

    fn clean_image_hashes(&self, cutoff: Option<SystemTime>, dry_run: bool) -> Walk {
        let started = Instant::now();
        let mut result = CleanResult::new(CleanCategory::ImageHashes);
        let path = self
            .layout
            .category_path(CacheCategory::Images)
            .join(IMAGE_HASH_INDEX_FILE);

        match ImageHashIndex::load(&path) {
            Ok(mut index) => {
                let cutoff = cutoff.map(DateTime::<Utc>::from);
                let matched = index.older_than(cutoff);
                for (hash, entry) in &matched {
                    let size = serde_json::to_vec(entry).map_or(0, |b| b.len() as u64);
                    result.record(hash.clone(), size, dry_run);
                    if !dry_run {
                        index.remove(hash);
                    }
                }
                if !dry_run && !matched.is_empty() {
                    if let Err(e) = index.save() {
                        result.error = Some(e.to_string());
                    }
                }
            }
            Err(e) => result.error = Some(e.to_string()),
        }

        result.duration = started.elapsed();
        Walk {
            result,
            cancelled: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn clean_files(
        &self,
        category: CleanCategory,
        roots: &[PathBuf],
        matches: fn(&Path) -> bool,
        cutoff: Option<SystemTime>,
        dry_run: bool,
        seen: &mut HashSet<PathBuf>,
        cancel: &CancellationToken,
    ) -> Walk {
        let started = Instant::now();
        let mut result = CleanResult::new(category);
        let mut cancelled = false;

        'walk: for root in roots {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).sort_by_file_name() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'walk;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        result.error = Some(walk_error(root, e).to_string());
                        break 'walk;
                    }
                };
                if !entry.file_type().is_file() || !matches(entry.path()) {
                    continue;
                }
                if seen.contains(entry.path()) {
                    continue;
                }

                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("Skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };
                let modified = match meta.modified() {
                    Ok(modified) => modified,
                    Err(e) => {
                        warn!("Skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };
                if cutoff.is_some_and(|c| modified > c) {
                    continue;
                }

                if !dry_run {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        result.error =
                            Some(format!("failed to delete {}: {e}", entry.path().display()));
                        break 'walk;
                    }
                }
                result.record(entry.path().display().to_string(), meta.len(), dry_run);
                seen.insert(entry.into_path());
            }
        }

        result.duration = started.elapsed();
        Walk { result, cancelled }
    }
}
