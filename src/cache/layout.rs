//! Unified cache directory layout.
//!
//! One root directory with a subdirectory per [`CacheCategory`]. Older
//! releases kept their caches at fixed locations under the home directory;
//! those are described by [`LEGACY_LOCATIONS`] and picked up by the migration
//! engine.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::image_index::IMAGE_HASH_INDEX_FILE;
use crate::cache::types::{CacheCategory, CacheError, CacheResult, CategoryStats};

/// Overrides the cache root.
pub const CACHE_DIR_ENV: &str = "REMINDER_CACHE_DIR";
/// Overrides the temp category directory.
pub const TEMP_DIR_ENV: &str = "REMINDER_TEMP_DIR";

pub const DEFAULT_DIR_NAME: &str = ".reminder-cache";
pub const TASK_CACHE_FILE: &str = "task_cache.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKind {
    File,
    Dir,
}

/// A pre-unification cache location, relative to the legacy base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyLocation {
    pub category: CacheCategory,
    pub relative_path: &'static str,
    pub kind: LegacyKind,
    /// File name inside the category directory; `None` merges a directory
    /// into the category directory itself.
    pub destination_name: Option<&'static str>,
}

pub const LEGACY_LOCATIONS: &[LegacyLocation] = &[
    LegacyLocation {
        category: CacheCategory::Tasks,
        relative_path: ".reminder_cache/task_cache.json",
        kind: LegacyKind::File,
        destination_name: Some(TASK_CACHE_FILE),
    },
    LegacyLocation {
        category: CacheCategory::Images,
        relative_path: ".reminder_cache/images",
        kind: LegacyKind::Dir,
        destination_name: None,
    },
    LegacyLocation {
        category: CacheCategory::Images,
        relative_path: ".reminder_cache/image_hashes.json",
        kind: LegacyKind::File,
        destination_name: Some(IMAGE_HASH_INDEX_FILE),
    },
    LegacyLocation {
        category: CacheCategory::Config,
        relative_path: ".reminder_cache/config.json",
        kind: LegacyKind::File,
        destination_name: Some("config.json"),
    },
    LegacyLocation {
        category: CacheCategory::Temp,
        relative_path: ".reminder_temp",
        kind: LegacyKind::Dir,
        destination_name: None,
    },
];

/// Resolve the cache root with precedence: explicit path, `REMINDER_CACHE_DIR`,
/// `~/.reminder-cache`, then `./.reminder-cache`.
pub fn resolve_cache_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(env_dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(env_dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(DEFAULT_DIR_NAME);
    }
    PathBuf::from(".").join(DEFAULT_DIR_NAME)
}

/// Owns the cache root and maps categories to directories
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    temp_dir: Option<PathBuf>,
    legacy_base: Option<PathBuf>,
}

impl CacheLayout {
    /// Layout rooted at `root`, without temp override. Legacy data is looked
    /// up under the home directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            temp_dir: None,
            legacy_base: dirs::home_dir(),
        }
    }

    /// Layout honouring `REMINDER_CACHE_DIR` and `REMINDER_TEMP_DIR`.
    pub fn from_env(explicit_root: Option<&Path>) -> Self {
        let mut layout = Self::new(resolve_cache_root(explicit_root));
        if let Some(temp) = std::env::var_os(TEMP_DIR_ENV).filter(|v| !v.is_empty()) {
            layout.temp_dir = Some(PathBuf::from(temp));
        }
        layout
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn with_legacy_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.legacy_base = Some(base.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn categories(&self) -> &'static [CacheCategory] {
        &CacheCategory::ALL
    }

    /// Directory of `category` without touching the filesystem.
    pub fn category_path(&self, category: CacheCategory) -> PathBuf {
        match (category, &self.temp_dir) {
            (CacheCategory::Temp, Some(temp)) => temp.clone(),
            _ => self.root.join(category.dir_name()),
        }
    }

    /// Directory of `category`, created if absent.
    pub fn resolve_dir(&self, category: CacheCategory) -> CacheResult<PathBuf> {
        let dir = self.category_path(category);
        if !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
            debug!("Created {} cache directory {}", category, dir.display());
        }
        Ok(dir)
    }

    /// Join `filename` onto the category directory. The name is not checked.
    pub fn resolve_file_path(&self, category: CacheCategory, filename: &str) -> CacheResult<PathBuf> {
        Ok(self.resolve_dir(category)?.join(filename))
    }

    pub fn task_cache_path(&self) -> CacheResult<PathBuf> {
        self.resolve_file_path(CacheCategory::Tasks, TASK_CACHE_FILE)
    }

    pub fn image_hash_index_path(&self) -> CacheResult<PathBuf> {
        self.resolve_file_path(CacheCategory::Images, IMAGE_HASH_INDEX_FILE)
    }

    /// Create every category directory.
    pub fn ensure_all(&self) -> CacheResult<()> {
        for category in CacheCategory::ALL {
            self.resolve_dir(category)?;
        }
        Ok(())
    }

    /// File count and size per category. Missing directories report zeros.
    pub fn stats(&self) -> CacheResult<BTreeMap<CacheCategory, CategoryStats>> {
        let mut stats = BTreeMap::new();
        for category in CacheCategory::ALL {
            stats.insert(category, dir_stats(&self.category_path(category))?);
        }
        Ok(stats)
    }

    /// Delete everything under the category directory, then recreate it empty.
    pub fn clear(&self, category: CacheCategory) -> CacheResult<CategoryStats> {
        let dir = self.category_path(category);
        let removed = dir_stats(&dir)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&dir, e)),
        }
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        info!(
            "Cleared {} cache: {} files, {} bytes",
            category, removed.file_count, removed.total_bytes
        );
        Ok(removed)
    }

    /// Legacy locations that currently exist, with their absolute paths.
    /// Locations inside the cache root (or containing it) are live data, not
    /// legacy data, and are left out.
    pub fn legacy_locations(&self) -> Vec<(LegacyLocation, PathBuf)> {
        let Some(base) = &self.legacy_base else {
            return Vec::new();
        };
        LEGACY_LOCATIONS
            .iter()
            .filter_map(|loc| {
                let path = base.join(loc.relative_path);
                let present = match loc.kind {
                    LegacyKind::File => path.is_file(),
                    LegacyKind::Dir => path.is_dir(),
                };
                if present && paths_overlap(&path, &self.root) {
                    debug!("Ignoring {}: inside the cache root", path.display());
                    return None;
                }
                present.then_some((*loc, path))
            })
            .collect()
    }

    pub fn legacy_paths(&self) -> Vec<PathBuf> {
        self.legacy_locations().into_iter().map(|(_, p)| p).collect()
    }

    pub fn legacy_cache_exists(&self) -> bool {
        !self.legacy_locations().is_empty()
    }
}

/// Recursive file count and byte total under `path` (a file counts as one).
pub(crate) fn dir_stats(path: &Path) -> CacheResult<CategoryStats> {
    let mut stats = CategoryStats::default();
    if !path.exists() {
        return Ok(stats);
    }
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| walk_error(path, e))?;
        if entry.file_type().is_file() {
            let len = entry
                .metadata()
                .map_err(|e| walk_error(path, e))?
                .len();
            stats.file_count += 1;
            stats.total_bytes += len;
        }
    }
    Ok(stats)
}

/// `path` with symlinks and `..` resolved as far as it exists; the missing
/// tail is appended unchanged.
pub(crate) fn resolve_lenient(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return tail
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// True when `a` and `b` are the same path or one contains the other.
pub(crate) fn paths_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (resolve_lenient(a), resolve_lenient(b));
    a.starts_with(&b) || b.starts_with(&a)
}

pub(crate) fn walk_error(root: &Path, err: walkdir::Error) -> CacheError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    CacheError::io(path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_dir_creates_category() {
        let root = tempdir().unwrap();
        let layout = CacheLayout::new(root.path());

        let images = layout.resolve_dir(CacheCategory::Images).unwrap();
        assert_eq!(images, root.path().join("images"));
        assert!(images.is_dir());

        let legacy = layout.category_path(CacheCategory::LegacyRoot);
        assert_eq!(legacy, root.path().join("legacy"));
        assert!(!legacy.exists());
    }

    #[test]
    fn test_temp_override() {
        let root = tempdir().unwrap();
        let temp = tempdir().unwrap();
        let layout = CacheLayout::new(root.path()).with_temp_dir(temp.path());
        assert_eq!(
            layout.resolve_dir(CacheCategory::Temp).unwrap(),
            temp.path().to_path_buf()
        );
    }

    #[test]
    fn test_resolve_file_path_joins() {
        let root = tempdir().unwrap();
        let layout = CacheLayout::new(root.path());
        let path = layout
            .resolve_file_path(CacheCategory::Config, "settings.json")
            .unwrap();
        assert_eq!(path, root.path().join("config").join("settings.json"));
    }

    #[test]
    fn test_stats_and_clear() {
        let root = tempdir().unwrap();
        let layout = CacheLayout::new(root.path());
        let images = layout.resolve_dir(CacheCategory::Images).unwrap();
        fs::write(images.join("a.png"), vec![0u8; 100]).unwrap();
        fs::create_dir_all(images.join("nested")).unwrap();
        fs::write(images.join("nested").join("b.png"), vec![0u8; 50]).unwrap();

        let stats = layout.stats().unwrap();
        assert_eq!(stats[&CacheCategory::Images].file_count, 2);
        assert_eq!(stats[&CacheCategory::Images].total_bytes, 150);
        assert_eq!(stats[&CacheCategory::Tasks], CategoryStats::default());

        let removed = layout.clear(CacheCategory::Images).unwrap();
        assert_eq!(removed.file_count, 2);
        assert!(images.is_dir());
        assert_eq!(fs::read_dir(&images).unwrap().count(), 0);
    }

    #[test]
    fn test_legacy_detection() {
        let root = tempdir().unwrap();
        let home = tempdir().unwrap();
        let layout = CacheLayout::new(root.path()).with_legacy_base(home.path());
        assert!(!layout.legacy_cache_exists());

        let legacy_dir = home.path().join(".reminder_cache");
        fs::create_dir_all(&legacy_dir).unwrap();
        fs::write(legacy_dir.join("task_cache.json"), b"[]").unwrap();

        let paths = layout.legacy_paths();
        assert_eq!(paths, vec![legacy_dir.join("task_cache.json")]);
        assert!(layout.legacy_cache_exists());
    }

    #[test]
    fn test_legacy_inside_root_is_ignored() {
        let home = tempdir().unwrap();
        let legacy_dir = home.path().join(".reminder_cache");
        fs::create_dir_all(legacy_dir.join("images")).unwrap();
        fs::write(legacy_dir.join("task_cache.json"), b"[]").unwrap();

        let layout = CacheLayout::new(&legacy_dir).with_legacy_base(home.path());
        assert!(!layout.legacy_cache_exists());
    }

    #[test]
    fn test_paths_overlap() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(&a).unwrap();
        assert!(paths_overlap(&a, &a));
        assert!(paths_overlap(&a, &a.join("missing").join("x")));
        assert!(paths_overlap(&a.join("..").join("a"), &a));
        assert!(!paths_overlap(&a, &dir.path().join("ab")));
    }

    #[test]
    fn test_explicit_root_wins() {
        let root = resolve_cache_root(Some(Path::new("/tmp/explicit")));
        assert_eq!(root, PathBuf::from("/tmp/explicit"));
    }
}
