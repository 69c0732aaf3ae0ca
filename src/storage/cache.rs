use crate::core::config::{CacheSettings, Config};
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

const CACHE_VERSION: &str = "1.0";

/// Open metadata attached to cache entries and chunks
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Size of one chunk produced for a file, without its text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_id: String,
    pub content_length: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Cached fingerprint and indexing outcome for one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalized absolute path
    pub file_path: String,
    /// SHA256 hash of file contents
    pub file_hash: String,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: u64,
    pub size: u64,
    /// Milliseconds since the Unix epoch
    pub indexed_at: u64,
    /// Milliseconds since the Unix epoch
    pub last_checked: u64,
    pub chunks_count: usize,
    pub index_success: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_content: Option<String>,
    #[serde(default)]
    pub chunks_info: Vec<ChunkSummary>,
}

/// What happened to a file the caller is recording
#[derive(Debug, Clone)]
pub struct IndexRecord<'a> {
    pub success: bool,
    pub chunks: &'a [ChunkSummary],
    pub metadata: Metadata,
    pub content: Option<&'a str>,
    /// File state the chunks were produced from. `None` captures it now.
    pub observed: Option<FileState>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub missing_entries: usize,
    pub total_cached_file_size: u64,
    pub cache_file_size: u64,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: String,
    created_at: String,
    ttl: u64,
    max_entries: usize,
    total_entries: usize,
    entries: BTreeMap<String, CacheEntry>,
}

/// Size and modification time of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime_ns: u64,
    pub size: u64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            mtime_ns: get_file_modified_time(path)?,
            size: metadata.len(),
        })
    }
}

/// Fingerprint plus content hash, taken together before a file is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub fingerprint: Fingerprint,
    pub hash: String,
}

impl FileState {
    /// Stat before hashing so a concurrent write can only make the stat look older
    pub fn capture(path: &Path) -> Result<Self> {
        let fingerprint = Fingerprint::of(path)?;
        let hash = calculate_file_hash(path)?;
        Ok(Self { fingerprint, hash })
    }
}

/// Persistent map from file path to fingerprint, used to skip unchanged files
pub struct FileIndexCache {
    cache_file: PathBuf,
    settings: CacheSettings,
    entries: BTreeMap<String, CacheEntry>,
}

impl FileIndexCache {
    /// Open the cache at the configured location
    pub fn open(config: &Config) -> Self {
        Self::open_at(config.cache_path(), config.cache.clone())
    }

    /// Open or create a cache file. An unreadable file starts an empty cache.
    pub fn open_at(cache_file: PathBuf, settings: CacheSettings) -> Self {
        let entries = match load_entries(&cache_file) {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(entries = entries.len(), "Loaded file index cache");
                }
                entries
            }
            Err(e) => {
                warn!(path = %cache_file.display(), error = %e, "Failed to load file index cache, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            cache_file,
            settings,
            entries,
        }
    }

    /// Check whether a cached entry still describes the file on disk.
    ///
    /// Missing files and expired entries are purged. A changed mtime or size
    /// falls back to the content hash, so touching a file keeps it valid.
    /// Any error counts as invalid.
    pub fn is_valid(&mut self, path: &Path) -> bool {
        let key = match path_key(path) {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to normalize path");
                return false;
            }
        };

        match self.check_entry(&key) {
            Ok(valid) => valid,
            Err(e) => {
                warn!(path = %key, error = %e, "Failed to check file cache");
                false
            }
        }
    }

    fn check_entry(&mut self, key: &str) -> Result<bool> {
        let path = Path::new(key);
        if !path.exists() {
            if self.entries.remove(key).is_some() {
                self.save();
            }
            return Ok(false);
        }

        let now = now_millis();
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };

        if is_expired(entry, self.settings.ttl_secs, now) {
            debug!(path = %key, "Cache entry expired");
            self.entries.remove(key);
            self.save();
            return Ok(false);
        }

        let current = Fingerprint::of(path)?;
        if current.mtime_ns != entry.mtime_ns || current.size != entry.size {
            let current_hash = calculate_file_hash(path)?;
            if current_hash != entry.file_hash {
                debug!(path = %key, "File content changed");
                self.entries.remove(key);
                self.save();
                return Ok(false);
            }

            // Same bytes, new stat (touch or copy)
            entry.mtime_ns = current.mtime_ns;
            entry.size = current.size;
            entry.last_checked = now;
            self.save();
            return Ok(true);
        }

        entry.last_checked = now;
        Ok(true)
    }

    /// Store a fresh fingerprint for a file together with its indexing outcome
    pub fn record(&mut self, path: &Path, outcome: IndexRecord<'_>) -> Result<()> {
        let key = path_key(path)?;
        let normalized = Path::new(&key);
        if !normalized.exists() {
            return Err(Error::InvalidInput(format!(
                "Cannot cache missing file: {}",
                key
            )));
        }

        let FileState {
            fingerprint,
            hash: file_hash,
        } = match outcome.observed {
            Some(observed) => observed,
            None => FileState::capture(normalized)?,
        };
        let now = now_millis();

        let parse_content = outcome
            .content
            .filter(|c| c.chars().count() < self.settings.max_cached_content)
            .map(str::to_string);

        let entry = CacheEntry {
            file_path: key.clone(),
            file_hash,
            mtime_ns: fingerprint.mtime_ns,
            size: fingerprint.size,
            indexed_at: now,
            last_checked: now,
            chunks_count: outcome.chunks.len(),
            index_success: outcome.success,
            metadata: outcome.metadata,
            parse_content,
            chunks_info: outcome.chunks.to_vec(),
        };

        self.entries.insert(key.clone(), entry);
        self.evict_oldest();
        self.save();

        debug!(path = %key, chunks = outcome.chunks.len(), "Cached file index");
        Ok(())
    }

    /// Get the cached entry for a file
    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        let key = path_key(path).ok()?;
        self.entries.get(&key)
    }

    /// Drop the entry for a file
    pub fn invalidate(&mut self, path: &Path) {
        if let Ok(key) = path_key(path) {
            if self.entries.remove(&key).is_some() {
                self.save();
                debug!(path = %key, "Invalidated file cache");
            }
        }
    }

    /// Drop every entry
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.save();
        info!("Invalidated all file cache entries");
    }

    /// Existing files whose entries no longer validate
    pub fn find_stale(&mut self) -> Vec<PathBuf> {
        let candidates: Vec<String> = self
            .entries
            .keys()
            .filter(|k| Path::new(k.as_str()).exists())
            .cloned()
            .collect();

        candidates
            .into_iter()
            .filter(|k| !self.is_valid(Path::new(k)))
            .map(PathBuf::from)
            .collect()
    }

    /// Remove entries for missing files and expired entries
    pub fn cleanup_invalid(&mut self) -> usize {
        let now = now_millis();
        let ttl = self.settings.ttl_secs;
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| Path::new(key).exists() && !is_expired(entry, ttl, now));

        let removed = before - self.entries.len();
        if removed > 0 {
            self.save();
            info!(removed, "Cleaned up invalid cache entries");
        }
        removed
    }

    pub fn statistics(&self) -> CacheStatistics {
        let now = now_millis();
        let mut stats = CacheStatistics {
            total_entries: self.entries.len(),
            valid_entries: 0,
            expired_entries: 0,
            missing_entries: 0,
            total_cached_file_size: 0,
            cache_file_size: std::fs::metadata(&self.cache_file)
                .map(|m| m.len())
                .unwrap_or(0),
            ttl_secs: self.settings.ttl_secs,
            max_entries: self.settings.max_entries,
        };

        for (key, entry) in &self.entries {
            if !Path::new(key).exists() {
                stats.missing_entries += 1;
                continue;
            }
            if is_expired(entry, self.settings.ttl_secs, now) {
                stats.expired_entries += 1;
            } else {
                stats.valid_entries += 1;
            }
            stats.total_cached_file_size += entry.size;
        }

        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let max = self.settings.max_entries;
        if self.entries.len() <= max {
            return;
        }

        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_checked, k.clone()))
            .collect();
        by_age.sort();

        let excess = self.entries.len() - max;
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        info!(removed = excess, "Evicted oldest cache entries");
    }

    /// Rewrite the cache file atomically. Failures are logged, never returned.
    fn save(&self) {
        if let Err(e) = self.write_file() {
            error!(path = %self.cache_file.display(), error = %e, "Failed to save file index cache");
        }
    }

    fn write_file(&self) -> Result<()> {
        if let Some(parent) = self.cache_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = CacheFile {
            version: CACHE_VERSION.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            ttl: self.settings.ttl_secs,
            max_entries: self.settings.max_entries,
            total_entries: self.entries.len(),
            entries: self.entries.clone(),
        };
        write_json_atomic(&self.cache_file, &file)
    }
}

fn load_entries(cache_file: &Path) -> Result<BTreeMap<String, CacheEntry>> {
    if !cache_file.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(cache_file)?;
    let file: CacheFile = serde_json::from_str(&raw)?;
    Ok(file.entries)
}

fn is_expired(entry: &CacheEntry, ttl_secs: u64, now_ms: u64) -> bool {
    if ttl_secs == 0 {
        return false;
    }
    now_ms.saturating_sub(entry.indexed_at) > ttl_secs.saturating_mul(1000)
}

/// Serialize `value` to `<path>.tmp` and rename it over `path`
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Make a path absolute and resolve `.` and `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Normalized path as the string key used by the cache and the index
pub fn path_key(path: &Path) -> Result<String> {
    let normalized = normalize_path(path)?;
    normalized
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("Path is not valid UTF-8: {}", path.display())))
}

/// Calculate SHA256 hash of file contents
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Get file modification time in nanoseconds since the Unix epoch
pub fn get_file_modified_time(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    let duration = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to get modification time: {}", e),
            ))
        })?;
    Ok(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
}
