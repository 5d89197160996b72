//! On-disk cache of field trees.
//!
//! Discovering a database schema takes many round trips, so trees are kept as
//! JSON files in `~/.cache/ems/`, one per (server, EMS system, database).

use crate::schema::FieldTree;
use crate::types::{EmsError, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const CACHE_DIR_NAME: &str = "ems";

/// Get the cache directory path.
pub fn cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join(CACHE_DIR_NAME))
}

fn require_cache_dir() -> Result<PathBuf> {
    cache_dir().ok_or_else(|| EmsError::Config("Could not determine cache directory".to_string()))
}

/// Cache file name for a database schema.
pub fn cache_key(uri_root: &str, ems_id: u32, database_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    uri_root.trim_end_matches('/').hash(&mut hasher);
    ems_id.hash(&mut hasher);
    database_id.hash(&mut hasher);
    format!("{:016x}.json", hasher.finish())
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
}

/// Load a cached tree, ignoring entries older than `max_age`.
pub fn get_cached(uri_root: &str, ems_id: u32, database_id: &str, max_age: Option<Duration>) -> Option<FieldTree> {
    get_cached_in(&cache_dir()?, &cache_key(uri_root, ems_id, database_id), max_age)
}

fn get_cached_in(dir: &Path, key: &str, max_age: Option<Duration>) -> Option<FieldTree> {
    let path = dir.join(key);
    if !path.exists() {
        return None;
    }

    if let Some(max_age) = max_age {
        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) {
            debug!("Cached schema {} expired", path.display());
            let _ = fs::remove_file(&path);
            return None;
        }
    }

    match FieldTree::load(&path) {
        Ok(tree) => Some(tree),
        Err(e) => {
            warn!("Ignoring unreadable schema cache {}: {}", path.display(), e);
            None
        }
    }
}

/// Save a tree, returning the file it was written to.
pub fn save_to_cache(uri_root: &str, ems_id: u32, tree: &FieldTree) -> Result<PathBuf> {
    let dir = require_cache_dir()?;
    save_in(&dir, &cache_key(uri_root, ems_id, tree.database_id()), tree)
}

fn save_in(dir: &Path, key: &str, tree: &FieldTree) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(key);
    tree.save(&path)?;
    Ok(path)
}

/// Remove a specific cache entry.
pub fn remove_cached(uri_root: &str, ems_id: u32, database_id: &str) -> Result<()> {
    if let Some(dir) = cache_dir() {
        let path = dir.join(cache_key(uri_root, ems_id, database_id));
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Clear all cached trees, returning how many files were removed.
pub fn clear_cache() -> Result<usize> {
    match cache_dir() {
        Some(dir) if dir.exists() => clear_in(&dir),
        _ => Ok(0),
    }
}

fn clear_in(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if is_cache_file(&path) && fs::remove_file(&path).is_ok() {
            count += 1;
        }
    }
    Ok(count)
}

/// Get cache statistics.
pub fn cache_stats() -> Result<CacheStats> {
    match cache_dir() {
        Some(dir) if dir.exists() => stats_in(&dir),
        _ => Ok(CacheStats::default()),
    }
}

fn stats_in(dir: &Path) -> Result<CacheStats> {
    let mut stats = CacheStats {
        directory: dir.to_path_buf(),
        ..Default::default()
    };
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if is_cache_file(&path) {
            stats.file_count += 1;
            if let Ok(metadata) = fs::metadata(&path) {
                stats.total_size += metadata.len();
            }
        }
    }
    Ok(stats)
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub directory: PathBuf,
    pub file_count: usize,
    pub total_size: u64,
}

impl CacheStats {
    /// Get total size as a human-readable string.
    pub fn size_human(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.total_size >= GB {
            format!("{:.2} GB", self.total_size as f64 / GB as f64)
        } else if self.total_size >= MB {
            format!("{:.2} MB", self.total_size as f64 / MB as f64)
        } else if self.total_size >= KB {
            format!("{:.2} KB", self.total_size as f64 / KB as f64)
        } else {
            format!("{} B", self.total_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::flight_tree;

    const ROOT: &str = "https://ems.efoqa.com/api";
    const FLIGHTS: &str = "[ems-core][entity-type][foqa-flights]";

    #[test]
    fn test_cache_key_deterministic() {
        let key = cache_key(ROOT, 3, FLIGHTS);
        assert_eq!(key, cache_key("https://ems.efoqa.com/api/", 3, FLIGHTS));
        assert!(key.ends_with(".json"));
        assert_eq!(key.len(), 21);
    }

    #[test]
    fn test_cache_key_different_params() {
        let key = cache_key(ROOT, 3, FLIGHTS);
        assert_ne!(key, cache_key(ROOT, 4, FLIGHTS));
        assert_ne!(key, cache_key("https://emsapibeta.ausdig.com/api", 3, FLIGHTS));
        assert_ne!(key, cache_key(ROOT, 3, "[ems-core][entity-type][foqa-events]"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let tree = flight_tree();
        let key = cache_key(ROOT, 3, tree.database_id());

        assert!(get_cached_in(dir.path(), &key, None).is_none());
        let path = save_in(dir.path(), &key, &tree).unwrap();
        assert!(path.exists());

        let cached = get_cached_in(dir.path(), &key, Some(Duration::from_secs(3600))).unwrap();
        assert_eq!(cached, tree);
    }

    #[test]
    fn test_expired_entry_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_in(dir.path(), "old.json", &flight_tree()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(get_cached_in(dir.path(), "old.json", Some(Duration::from_millis(1))).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_entry_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(get_cached_in(dir.path(), "bad.json", None).is_none());
    }

    #[test]
    fn test_stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let tree = flight_tree();
        save_in(dir.path(), "a.json", &tree).unwrap();
        save_in(dir.path(), "b.json", &tree).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let stats = stats_in(dir.path()).unwrap();
        assert_eq!(stats.file_count, 2);
        assert!(stats.total_size > 0);

        assert_eq!(clear_in(dir.path()).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(stats_in(dir.path()).unwrap().file_count, 0);
    }

    #[test]
    fn test_size_human() {
        let stats = |total_size| CacheStats {
            total_size,
            ..Default::default()
        };
        assert_eq!(stats(512).size_human(), "512 B");
        assert_eq!(stats(2048).size_human(), "2.00 KB");
        assert_eq!(stats(3 * 1024 * 1024).size_human(), "3.00 MB");
    }
}
