//! Moves data from the legacy cache locations into the unified layout.
//!
//! Runs before the fingerprint store is opened: it only needs the layout and
//! may replace `tasks/task_cache.json` wholesale.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::cache::layout::{dir_stats, paths_overlap, walk_error, CacheLayout};
use crate::cache::types::{
    CacheCategory, CacheError, CacheResult, MigrationFailure, MigrationItem, MigrationOptions,
    MigrationPlan, MigrationResult,
};

#[derive(Debug, Clone)]
pub struct MigrationEngine {
    layout: CacheLayout,
}

impl MigrationEngine {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// One item per legacy location present on disk. Does not create any
    /// directories.
    pub fn build_plan(&self) -> CacheResult<MigrationPlan> {
        let mut items = Vec::new();
        for (location, source) in self.layout.legacy_locations() {
            let size_bytes = dir_stats(&source)?.total_bytes;
            let category_dir = self.layout.category_path(location.category);
            let destination_path = match location.destination_name {
                Some(name) => category_dir.join(name),
                None => category_dir,
            };
            if paths_overlap(&source, &destination_path) {
                warn!(
                    "Skipping legacy {} data at {}: overlaps destination {}",
                    location.category,
                    source.display(),
                    destination_path.display()
                );
                continue;
            }
            debug!(
                "Legacy {} data at {} ({} bytes)",
                location.category,
                source.display(),
                size_bytes
            );
            items.push(MigrationItem {
                category: location.category,
                source_path: source,
                destination_path,
                size_bytes,
            });
        }

        let total_size = items.iter().map(|i| i.size_bytes).sum();
        Ok(MigrationPlan {
            migration_required: !items.is_empty(),
            items,
            total_size,
        })
    }

    /// Build the plan and execute it.
    pub fn migrate(
        &self,
        options: MigrationOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<MigrationResult> {
        let plan = self.build_plan()?;
        self.execute(&plan, options, cancel)
    }

    /// Execute `plan`. Per item, in order: dry-run records "would migrate";
    /// an occupied destination with `skip_existing` (and no
    /// `force_overwrite`) is skipped; otherwise the destination is optionally
    /// backed up, the source copied, and with `delete_source` the source
    /// removed once the copy is verified.
    ///
    /// Item failures are collected in the result and do not stop the plan.
    #[instrument(skip(self, plan, cancel), fields(items = plan.items.len()))]
    pub fn execute(
        &self,
        plan: &MigrationPlan,
        options: MigrationOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<MigrationResult> {
        if options.skip_existing && options.force_overwrite {
            warn!("Both skip_existing and force_overwrite set; force_overwrite takes precedence");
        }

        let backup_root = self
            .layout
            .category_path(CacheCategory::LegacyRoot)
            .join("backups")
            .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());

        let mut result = MigrationResult::default();
        for item in &plan.items {
            if cancel.is_cancelled() {
                warn!("Migration cancelled; remaining items left in place");
                result.cancelled = true;
                break;
            }

            if options.dry_run {
                info!(
                    "Would migrate {} -> {}",
                    item.source_path.display(),
                    item.destination_path.display()
                );
                result.would_migrate.push(item.clone());
                continue;
            }

            if paths_overlap(&item.source_path, &item.destination_path) {
                warn!(
                    "Refusing to migrate {} onto overlapping {}",
                    item.source_path.display(),
                    item.destination_path.display()
                );
                result.failed.push(MigrationFailure {
                    item: item.clone(),
                    error: "source and destination overlap".to_string(),
                    bytes_copied: 0,
                });
                continue;
            }

            let occupied = destination_occupied(&item.destination_path);
            if occupied && options.skips_occupied() {
                info!(
                    "Skipping {}: destination {} already exists",
                    item.source_path.display(),
                    item.destination_path.display()
                );
                result.skipped.push(item.clone());
                continue;
            }

            let mut stop = || cancel.is_cancelled();
            match migrate_item(item, options, occupied, &backup_root, &mut stop) {
                Ok(ItemOutcome::Migrated { bytes, backup }) => {
                    result.total_bytes_moved += bytes;
                    result.backups.extend(backup);
                    result.migrated.push(item.clone());
                }
                Ok(ItemOutcome::Cancelled { bytes }) => {
                    warn!(
                        "Migration cancelled during {} after {} bytes; source left in place",
                        item.source_path.display(),
                        bytes
                    );
                    result.failed.push(MigrationFailure {
                        item: item.clone(),
                        error: CacheError::Cancelled.to_string(),
                        bytes_copied: bytes,
                    });
                    result.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!("Failed to migrate {}: {}", item.source_path.display(), e);
                    result.failed.push(MigrationFailure {
                        item: item.clone(),
                        error: e.to_string(),
                        bytes_copied: 0,
                    });
                }
            }
        }

        info!(
            "Migration finished: {} migrated, {} skipped, {} failed, {} bytes moved",
            result.migrated.len(),
            result.skipped.len(),
            result.failed.len(),
            result.total_bytes_moved
        );
        Ok(result)
    }
}

enum ItemOutcome {
    Migrated { bytes: u64, backup: Option<PathBuf> },
    /// Stopped before completion; the source was not removed.
    Cancelled { bytes: u64 },
}

enum CopyOutcome {
    Complete(u64),
    Stopped(u64),
}

/// `stop` is polled before every file operation.
fn migrate_item(
    item: &MigrationItem,
    options: MigrationOptions,
    occupied: bool,
    backup_root: &Path,
    stop: &mut impl FnMut() -> bool,
) -> CacheResult<ItemOutcome> {
    let mut backup = None;
    if options.backup && occupied {
        let name = item
            .destination_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(item.category.dir_name()));
        let backup_path = backup_root.join(item.category.dir_name()).join(name);
        if let CopyOutcome::Stopped(_) = copy_path(&item.destination_path, &backup_path, stop)? {
            return Ok(ItemOutcome::Cancelled { bytes: 0 });
        }
        debug!("Backed up {} to {}", item.destination_path.display(), backup_path.display());
        backup = Some(backup_path);
    }

    let copied = match copy_path(&item.source_path, &item.destination_path, stop)? {
        CopyOutcome::Complete(bytes) => bytes,
        CopyOutcome::Stopped(bytes) => return Ok(ItemOutcome::Cancelled { bytes }),
    };

    if options.delete_source {
        match copy_verified(&item.source_path, &item.destination_path, stop)? {
            Some(true) => {}
            Some(false) => {
                return Err(CacheError::io(
                    &item.destination_path,
                    std::io::Error::other("destination does not match source after copy"),
                ))
            }
            None => return Ok(ItemOutcome::Cancelled { bytes: copied }),
        }
        remove_path(&item.source_path)?;
        debug!("Removed legacy source {}", item.source_path.display());
    }

    Ok(ItemOutcome::Migrated {
        bytes: copied,
        backup,
    })
}

/// A file that exists, or a directory with at least one entry.
fn destination_occupied(path: &Path) -> bool {
    if path.is_dir() {
        fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    } else {
        path.exists()
    }
}

/// Copy a file, or merge a directory tree into `dst`.
fn copy_path(
    src: &Path,
    dst: &Path,
    stop: &mut impl FnMut() -> bool,
) -> CacheResult<CopyOutcome> {
    if !src.is_dir() {
        if stop() {
            return Ok(CopyOutcome::Stopped(0));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let copied = fs::copy(src, dst).map_err(|e| CacheError::io(dst, e))?;
        return Ok(CopyOutcome::Complete(copied));
    }

    let mut copied = 0u64;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| CacheError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            if stop() {
                return Ok(CopyOutcome::Stopped(copied));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            copied += fs::copy(entry.path(), &target).map_err(|e| CacheError::io(&target, e))?;
        }
    }
    Ok(CopyOutcome::Complete(copied))
}

/// Every file under `src` has a same-sized counterpart under `dst`.
/// `None` when `stop` fired first.
fn copy_verified(
    src: &Path,
    dst: &Path,
    stop: &mut impl FnMut() -> bool,
) -> CacheResult<Option<bool>> {
    if !src.is_dir() {
        let src_len = fs::metadata(src).map_err(|e| CacheError::io(src, e))?.len();
        return Ok(Some(
            fs::metadata(dst).map(|m| m.len() == src_len).unwrap_or(false),
        ));
    }
    for entry in WalkDir::new(src) {
        if stop() {
            return Ok(None);
        }
        let entry = entry.map_err(|e| walk_error(src, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let src_len = entry.metadata().map_err(|e| walk_error(src, e))?.len();
        let matches = fs::metadata(dst.join(relative))
            .map(|m| m.len() == src_len)
            .unwrap_or(false);
        if !matches {
            return Ok(Some(false));
        }
    }
    Ok(Some(true))
}

fn remove_path(path: &Path) -> CacheResult<()> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| CacheError::io(path, e))
}
