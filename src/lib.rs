//! Reminder Cache Library
//!
//! Local caching layer for a reminder-creation tool: a fingerprint store that
//! keeps the same reminder from being submitted twice, a unified cache
//! directory with per-category subdirectories, migration of pre-unification
//! cache locations, and age-filtered cleanup with a preview mode.

pub mod cache;

pub use crate::cache::{
    fingerprint, CacheCategory, CacheError, CacheLayout, CacheManager, CacheRecord, CacheResult,
    CleanCategory, CleanOptions, CleanSelection, CleanSummary, CleanupEngine, FingerprintStore,
    MigrationEngine, MigrationOptions, MigrationResult, ParsedReminder, Reminder, StoreConfig,
    TaskFingerprint,
};

// Re-export commonly used dependencies for tests
pub use serde_json;
pub use tokio_util::sync::CancellationToken;
