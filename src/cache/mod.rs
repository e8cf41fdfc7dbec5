//! Reminder cache: dedup store, unified directory layout, legacy migration
//! and cleanup.

pub mod cleanup;
pub mod fingerprint;
mod flush;
pub mod image_index;
pub mod layout;
pub mod migration;
pub mod persist;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use cleanup::{is_generated_file, AgeFilter, CleanupEngine};
pub use fingerprint::{fingerprint, FingerprintStore};
pub use image_index::{ImageHashEntry, ImageHashIndex, IMAGE_HASH_INDEX_FILE};
pub use layout::{
    resolve_cache_root, CacheLayout, LegacyKind, LegacyLocation, CACHE_DIR_ENV, LEGACY_LOCATIONS,
    TASK_CACHE_FILE, TEMP_DIR_ENV,
};
pub use migration::MigrationEngine;
pub use types::*;

/// Entry point for the cache subsystem.
///
/// Migration runs against the layout alone and must happen before
/// [`CacheManager::open`]; once the store is open, the task-cache file is
/// owned by it and every change to task records goes through its lock.
#[derive(Debug)]
pub struct CacheManager {
    layout: CacheLayout,
    store: Option<Arc<FingerprintStore>>,
}

impl CacheManager {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            store: None,
        }
    }

    /// Manager over the layout resolved from `explicit_root` and the
    /// environment.
    pub fn from_env(explicit_root: Option<&Path>) -> Self {
        Self::new(CacheLayout::from_env(explicit_root))
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn migration_engine(&self) -> MigrationEngine {
        MigrationEngine::new(self.layout.clone())
    }

    /// Migrate legacy data into the unified layout.
    ///
    /// Refused once the store is open, since the task-cache file may be
    /// replaced.
    pub fn migrate(
        &self,
        options: MigrationOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<MigrationResult> {
        if self.store.is_some() && !options.dry_run {
            return Err(CacheError::StoreOpen);
        }
        self.migration_engine().migrate(options, cancel)
    }

    /// Open the fingerprint store at `tasks/task_cache.json`. Idempotent.
    #[instrument(skip(self, config), fields(root = %self.layout.root().display()))]
    pub async fn open(&mut self, config: StoreConfig) -> CacheResult<Arc<FingerprintStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        if self.layout.legacy_cache_exists() {
            warn!(
                "Legacy cache data found ({} locations); run migration to move it",
                self.layout.legacy_locations().len()
            );
        }
        let path = self.layout.task_cache_path()?;
        let store = Arc::new(FingerprintStore::open_with_config(path, config).await?);
        info!("Opened fingerprint store with {} records", store.len());
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// The open store, if any.
    pub fn store(&self) -> Option<&Arc<FingerprintStore>> {
        self.store.as_ref()
    }

    pub fn cleanup_engine(&self) -> CacheResult<CleanupEngine> {
        let store = self.store.as_ref().ok_or(CacheError::StoreClosed)?;
        Ok(CleanupEngine::new(self.layout.clone(), Arc::clone(store)))
    }

    pub async fn clean(
        &self,
        options: &CleanOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<CleanSummary> {
        self.cleanup_engine()?.clean(options, cancel).await
    }

    /// Size-budget eviction for a file category. Does not need the store.
    pub fn evict_to_budget(
        &self,
        category: CacheCategory,
        max_bytes: u64,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<CleanResult> {
        cleanup::evict_to_budget(&self.layout, category, max_bytes, dry_run, cancel)
    }

    /// Flush pending store writes and stop the flush task.
    pub async fn shutdown(&mut self) -> CacheResult<()> {
        match self.store.take() {
            Some(store) => store.shutdown().await,
            None => Ok(()),
        }
    }
}
