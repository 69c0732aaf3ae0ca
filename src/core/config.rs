use super::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// File extensions scanned when the caller does not name any.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "doc", "txt", "md", "markdown", "py", "js", "ts", "java", "c", "cpp", "h",
    "css", "html", "xml", "json", "yaml", "yml", "csv", "log",
];

/// Settings for the file fingerprint cache
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Entry lifetime in seconds; 0 disables expiry
    pub ttl_secs: u64,
    /// Maximum number of entries before the oldest-checked ones are evicted
    pub max_entries: usize,
    /// Extracted text longer than this is not kept in the cache
    pub max_cached_content: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3600,
            max_entries: 10_000,
            max_cached_content: 50_000,
        }
    }
}

/// Settings for scanning and parsing
#[derive(Debug, Clone)]
pub struct IndexingSettings {
    /// Size of the parse worker pool
    pub max_workers: usize,
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks
    pub chunk_overlap: usize,
    /// Extensions scanned by default (lowercase, no dot)
    pub extensions: Vec<String>,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            chunk_size: 1000,
            chunk_overlap: 200,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Settings for the search engine
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Cap on results coming from the same source document
    pub max_results_per_document: usize,
    /// Minimum combined score a fuzzy candidate needs
    pub fuzzy_threshold: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            max_results_per_document: 3,
            fuzzy_threshold: 0.8,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

/// Configuration for docindex
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for docindex data
    pub base_dir: PathBuf,
    /// Directory holding the vector index, records and metadata
    pub index_dir: PathBuf,
    /// Directory holding the file fingerprint cache
    pub cache_dir: PathBuf,
    pub cache: CacheSettings,
    pub indexing: IndexingSettings,
    pub search: SearchSettings,
}

impl Config {
    /// Get the default configuration directory
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|home| home.join(".docindex"))
    }

    /// Create a new configuration with default settings
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.unwrap_or_else(|| {
            Self::default_base_dir().unwrap_or_else(|_| PathBuf::from(".docindex"))
        });
        let index_dir = base_dir.join("index");

        Ok(Self {
            cache_dir: index_dir.join("cache"),
            index_dir,
            base_dir,
            cache: CacheSettings::default(),
            indexing: IndexingSettings::default(),
            search: SearchSettings::default(),
        })
    }

    /// Create a configuration and overlay `DOCINDEX_*` environment variables
    pub fn from_env(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => Some(dir),
            None => std::env::var_os("DOCINDEX_HOME").map(PathBuf::from),
        };
        let mut config = Self::new(base_dir)?;

        if let Some(ttl) = env_value("DOCINDEX_CACHE_TTL")? {
            config.cache.ttl_secs = ttl;
        }
        if let Some(max) = env_value("DOCINDEX_MAX_CACHE_ENTRIES")? {
            config.cache.max_entries = max;
        }
        if let Some(workers) = env_value("DOCINDEX_MAX_WORKERS")? {
            config.indexing.max_workers = workers;
        }
        if let Some(size) = env_value("DOCINDEX_CHUNK_SIZE")? {
            config.indexing.chunk_size = size;
        }
        if let Some(overlap) = env_value("DOCINDEX_CHUNK_OVERLAP")? {
            config.indexing.chunk_overlap = overlap;
        }
        if let Some(top_k) = env_value("DOCINDEX_DEFAULT_TOP_K")? {
            config.search.default_top_k = top_k;
        }
        if let Some(max_top_k) = env_value("DOCINDEX_MAX_TOP_K")? {
            config.search.max_top_k = max_top_k;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.indexing.max_workers == 0 {
            problems.push("max_workers must be at least 1".to_string());
        }
        if self.indexing.chunk_size == 0 {
            problems.push("chunk_size must be at least 1".to_string());
        }
        if self.indexing.chunk_overlap >= self.indexing.chunk_size {
            problems.push(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.indexing.chunk_overlap, self.indexing.chunk_size
            ));
        }
        if self.search.default_top_k == 0 || self.search.max_top_k == 0 {
            problems.push("top_k limits must be at least 1".to_string());
        }
        if self.search.default_top_k > self.search.max_top_k {
            problems.push("default_top_k exceeds max_top_k".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Initialize the configuration directories
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    /// Check if the configuration is already initialized
    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.index_dir.exists()
    }

    /// Path of the persisted fingerprint cache
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join("file_index_cache.json")
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
