use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::{CacheKey, PersistedIndex};

const PART_EXTENSION: &str = "part";
const TEMP_EXTENSION: &str = "tmp";

/// File layout of the cache directory: one file per entry named after its
/// key, plus the persisted index.
#[derive(Debug, Clone)]
pub struct DiskCache {
    cache_dir: PathBuf,
    index_path: PathBuf,
}

impl DiskCache {
    pub async fn new(cache_dir: PathBuf, index_file_name: &str) -> io::Result<Self> {
        if !fs::try_exists(&cache_dir).await? {
            fs::create_dir_all(&cache_dir).await?;
        }
        let index_path = cache_dir.join(index_file_name);
        Ok(Self {
            cache_dir,
            index_path,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn entry_path(&self, key: &CacheKey, extension: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.{extension}"))
    }

    /// Where a download is written before it is renamed into place.
    pub fn part_path(&self, key: &CacheKey, extension: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{key}.{extension}.{PART_EXTENSION}"))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Delete a file; a file that is already gone is not an error.
    pub async fn remove_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `Ok(None)` when no index has been written yet.
    pub async fn load_index(&self) -> io::Result<Option<PersistedIndex>> {
        let raw = match fs::read(&self.index_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write the index to a temporary file and rename it over the old one.
    pub async fn save_index(&self, record: &PersistedIndex) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.index_path.with_extension(TEMP_EXTENSION);
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, &self.index_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// True for names this layout produces: `<key>.<ext>`,
    /// `<key>.<ext>.part` and the temporary index file.
    fn is_owned(&self, path: &Path) -> bool {
        if path == self.index_path.with_extension(TEMP_EXTENSION) {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name
            .strip_suffix(PART_EXTENSION)
            .and_then(|n| n.strip_suffix('.'))
            .unwrap_or(name);
        match name.split_once('.') {
            Some((key, ext)) => {
                CacheKey::is_valid(key) && !ext.is_empty() && !ext.contains('.')
            }
            None => false,
        }
    }

    /// Remove files in the cache directory that look like cache files but
    /// are not listed in `keep`. Anything else in the directory is left
    /// alone. Returns how many files were removed.
    pub async fn remove_unreferenced(&self, keep: &HashSet<PathBuf>) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == self.index_path || keep.contains(&path) || !self.is_owned(&path) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed unreferenced cache file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache file"),
            }
        }

        Ok(removed)
    }
}
