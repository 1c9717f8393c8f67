use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

const CACHE_FILENAME: &str = "markers.json";

/// Input fingerprints of setup commands that already ran successfully.
pub type Cache = HashSet<String>;

pub fn cache_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(CACHE_FILENAME)
}

pub fn load_cache(cache_dir: &Path) -> Cache {
    let cache_path = cache_path(cache_dir);

    let file = match File::open(&cache_path) {
        Ok(file) => file,
        Err(_) => return Cache::default(),
    };

    let reader = BufReader::new(file);
    match serde_json::from_reader(reader) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(
                "Ignoring unreadable marker cache '{}': {}",
                cache_path.display(),
                e
            );
            Cache::default()
        }
    }
}

pub fn save_cache(cache: &Cache, cache_dir: &Path) {
    let cache_path = cache_path(cache_dir);

    if let Err(e) = fs::create_dir_all(cache_dir) {
        warn!("Failed to create cache directory: {}", e);
        return;
    }

    match File::create(&cache_path) {
        Ok(file) => {
            let writer = BufWriter::new(file);
            let mut entries: Vec<&String> = cache.iter().collect();
            entries.sort();
            if let Err(e) = serde_json::to_writer_pretty(writer, &entries) {
                warn!("Failed to write cache file: {}", e);
            } else {
                debug!("Saved {} markers to '{}'", entries.len(), cache_path.display());
            }
        }
        Err(e) => {
            warn!("Failed to open cache file for writing: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join(".stackup");
        assert!(load_cache(&cache_dir).is_empty());

        let mut cache = Cache::default();
        cache.insert("af1349b9".to_string());
        save_cache(&cache, &cache_dir);

        assert_eq!(load_cache(&cache_dir), cache);
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(cache_path(dir.path()), "{not json").unwrap();
        assert!(load_cache(dir.path()).is_empty());
    }
}
