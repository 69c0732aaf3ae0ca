use crate::core::config::{Config, IndexingSettings};
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{scan_directory, ExtensionFilter};
use crate::indexing::parser::{Parser, TextChunk};
use crate::search::model::Embedder;
use crate::storage::cache::{
    calculate_file_hash, normalize_path, path_key, write_json_atomic, CacheEntry, CacheStatistics,
    ChunkSummary, FileIndexCache, FileState, IndexRecord, Metadata,
};
use crate::storage::vectors::{IndexState, StoreStatistics, VectorStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const METADATA_VERSION: &str = "1.0";

/// Lifecycle of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    NotBuilt,
    Building,
    Ready,
    Updating,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Idle,
    Scanning,
    Parsing,
    Embedding,
    Completed,
    Error,
}

/// Progress of the running (or last) batch, 0 to 100
#[derive(Debug, Clone, Serialize)]
pub struct BuildProgress {
    pub stage: ProgressStage,
    pub progress: f32,
    pub processed_files: usize,
    pub total_files: usize,
    pub cached_files: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildProgress {
    fn idle() -> Self {
        Self::at(ProgressStage::Idle, 0.0)
    }

    fn at(stage: ProgressStage, progress: f32) -> Self {
        Self {
            stage,
            progress,
            processed_files: 0,
            total_files: 0,
            cached_files: 0,
            error: None,
        }
    }
}

/// A document the manager believes is represented in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedDocument {
    /// SHA256 of the bytes that were indexed; empty when unknown
    pub content_hash: String,
    pub chunk_count: usize,
    pub indexed_at: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStatistics {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub last_updated: Option<String>,
    pub build_count: u64,
    pub total_build_time: f64,
}

/// What happened to one file in a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Already represented and unchanged on disk
    Unchanged,
    /// Re-added from the fingerprint cache without parsing
    CacheHit { chunks: usize },
    /// Parsed and embedded
    Fresh { chunks: usize },
    /// Parsed, but produced no chunks
    Empty,
    /// Changed on disk, left alone because updates were not requested
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Summary of a build or add batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total_files: usize,
    pub processed_files: usize,
    pub cached_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub new_chunks: usize,
    pub removed_chunks: usize,
    pub total_chunks: usize,
    pub total_documents: usize,
    pub elapsed: f64,
    pub cache_hit_rate: f64,
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn outcome(&self, path: &str) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.path == path).map(|f| &f.outcome)
    }
}

pub type BuildReport = BatchReport;
pub type AddReport = BatchReport;

#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub requested: usize,
    pub removed_documents: usize,
    pub removed_chunks: usize,
    pub remaining_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub outdated: Vec<String>,
    pub updated_documents: usize,
    pub deleted_documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: IndexStatus,
    pub last_build_time: Option<String>,
    pub progress: BuildProgress,
    pub statistics: ManagerStatistics,
    pub average_build_time: Option<f64>,
    pub indexed_documents: usize,
    pub store: StoreStatistics,
    pub cache: CacheStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub path: String,
    #[serde(flatten)]
    pub document: TrackedDocument,
    pub exists: bool,
}

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Health,
    pub issues: Vec<String>,
}

/// Options for a directory build; unset fields fall back to the configuration
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub extensions: Option<Vec<String>>,
    pub recursive: bool,
    pub max_workers: Option<usize>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            extensions: None,
            recursive: true,
            max_workers: None,
        }
    }
}

struct ManagerState {
    status: IndexStatus,
    progress: BuildProgress,
    documents: BTreeMap<String, TrackedDocument>,
    last_build_time: Option<String>,
    stats: ManagerStatistics,
}

#[derive(Serialize, Deserialize)]
struct ManagerMetadataFile {
    version: String,
    documents: BTreeMap<String, TrackedDocument>,
    last_build_time: Option<String>,
    statistics: ManagerStatistics,
}

/// Per-file decision taken before any parsing
enum Plan {
    Unchanged { hash: String, size: u64 },
    FromCache { chunks: Vec<TextChunk>, hash: String, size: u64 },
    Parse { replace: bool },
    Skipped,
    Failed(String),
}

struct ParsedFile {
    chunks: Vec<TextChunk>,
    observed: FileState,
}

struct CacheWrite {
    path: PathBuf,
    summaries: Vec<ChunkSummary>,
    content: String,
    observed: FileState,
}

/// Orchestrates scanning, cache-aware skipping, parallel parsing and
/// incremental updates of the vector store.
///
/// `writer` admits one mutating operation at a time. `state` is the coarse
/// lock over bookkeeping and is never held across parsing, embedding or disk I/O.
pub struct IndexManager {
    index_dir: PathBuf,
    settings: IndexingSettings,
    store: Arc<VectorStore>,
    cache: Mutex<FileIndexCache>,
    parser: Arc<dyn Parser>,
    state: Mutex<ManagerState>,
    writer: Mutex<()>,
}

impl IndexManager {
    /// Open the manager, its store and cache, and reconcile tracking with the store
    pub fn open(config: &Config, parser: Arc<dyn Parser>, embedder: Arc<dyn Embedder>) -> Self {
        let store = Arc::new(VectorStore::open(config, embedder));
        let cache = FileIndexCache::open(config);
        Self::with_parts(config, store, cache, parser)
    }

    pub fn with_parts(
        config: &Config,
        store: Arc<VectorStore>,
        cache: FileIndexCache,
        parser: Arc<dyn Parser>,
    ) -> Self {
        let manager = Self {
            index_dir: config.index_dir.clone(),
            settings: config.indexing.clone(),
            store,
            cache: Mutex::new(cache),
            parser,
            state: Mutex::new(ManagerState {
                status: IndexStatus::NotBuilt,
                progress: BuildProgress::idle(),
                documents: BTreeMap::new(),
                last_build_time: None,
                stats: ManagerStatistics::default(),
            }),
            writer: Mutex::new(()),
        };
        manager.load_metadata();
        manager.reconcile();
        manager
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.index_dir.join("index_metadata.json")
    }

    /// Current index snapshot for lexical strategies
    pub fn snapshot(&self) -> Result<Option<Arc<IndexState>>> {
        self.store.snapshot()
    }

    /// Index every matching file under `directory`
    pub fn build_from_directory(&self, directory: &Path, options: &BuildOptions) -> Result<BuildReport> {
        let _writer = self.writer.lock();
        self.begin(IndexStatus::Building, ProgressStage::Scanning);

        let result = self.build_from_directory_locked(directory, options);
        self.finish(result)
    }

    fn build_from_directory_locked(&self, directory: &Path, options: &BuildOptions) -> Result<BuildReport> {
        let started = Instant::now();
        let filter = match &options.extensions {
            Some(extensions) => ExtensionFilter::new(extensions),
            None => ExtensionFilter::new(&self.settings.extensions),
        };

        info!(directory = %directory.display(), recursive = options.recursive, "Building index from directory");
        let files = scan_directory(directory, &filter, options.recursive)?;
        if files.is_empty() {
            return Err(Error::InvalidInput(format!(
                "No supported files found in {}",
                directory.display()
            )));
        }
        info!(files = files.len(), "Found files to process");

        let workers = options.max_workers.unwrap_or(self.settings.max_workers);
        let report = self.run_batch(files, true, workers, started)?;

        let mut state = self.state.lock();
        state.stats.build_count += 1;
        state.stats.total_build_time += report.elapsed;
        state.last_build_time = Some(chrono::Utc::now().to_rfc3339());
        drop(state);
        self.save_metadata();

        Ok(report)
    }

    /// Add files to the index. Changed files are replaced unless `update_existing` is false.
    pub fn add_documents(&self, paths: &[PathBuf], update_existing: bool) -> Result<AddReport> {
        let _writer = self.writer.lock();
        let status = if self.status() == IndexStatus::Ready {
            IndexStatus::Updating
        } else {
            IndexStatus::Building
        };
        self.begin(status, ProgressStage::Parsing);

        info!(files = paths.len(), "Adding documents to index");
        let result = self.run_batch(paths.to_vec(), update_existing, self.settings.max_workers, Instant::now());
        self.finish(result)
    }

    /// Remove files from the index and the cache
    pub fn remove_documents(&self, paths: &[PathBuf]) -> Result<RemoveReport> {
        let _writer = self.writer.lock();
        let keys = paths
            .iter()
            .map(|p| path_key(p))
            .collect::<Result<Vec<_>>>()?;
        let result = self.remove_locked(&keys);
        self.save_metadata();
        result
    }

    fn remove_locked(&self, keys: &[String]) -> Result<RemoveReport> {
        let present = self.store.source_counts()?;
        let removed_documents = keys.iter().filter(|k| present.contains_key(*k)).count();

        info!(documents = keys.len(), "Removing documents from index");
        let outcome = self.store.remove(keys)?;

        {
            let mut cache = self.cache.lock();
            for key in keys {
                cache.invalidate(Path::new(key));
            }
        }

        let mut state = self.state.lock();
        for key in keys {
            state.documents.remove(key);
        }
        self.refresh_stats(&mut state, outcome.remaining_chunks);
        if outcome.remaining_chunks == 0 {
            state.status = IndexStatus::NotBuilt;
        }

        Ok(RemoveReport {
            requested: keys.len(),
            removed_documents,
            removed_chunks: outcome.removed_chunks,
            remaining_chunks: outcome.remaining_chunks,
        })
    }

    /// Reprocess tracked documents whose content changed and drop the ones that vanished
    pub fn refresh(&self) -> Result<RefreshReport> {
        let _writer = self.writer.lock();
        let outdated = self.find_outdated();
        if outdated.is_empty() {
            info!("Index is up to date");
            return Ok(RefreshReport {
                outdated,
                updated_documents: 0,
                deleted_documents: 0,
                batch: None,
            });
        }

        info!(documents = outdated.len(), "Refreshing outdated documents");
        let (existing, missing): (Vec<String>, Vec<String>) =
            outdated.iter().cloned().partition(|p| Path::new(p).is_file());

        if !missing.is_empty() {
            if let Err(e) = self.remove_locked(&missing) {
                self.fail(&e);
                return Err(e);
            }
        }

        let batch = if existing.is_empty() {
            self.save_metadata();
            None
        } else {
            self.begin(IndexStatus::Updating, ProgressStage::Parsing);
            let files = existing.iter().map(PathBuf::from).collect();
            let result = self.run_batch(files, true, self.settings.max_workers, Instant::now());
            Some(self.finish(result)?)
        };

        Ok(RefreshReport {
            updated_documents: existing.len(),
            deleted_documents: missing.len(),
            outdated,
            batch,
        })
    }

    /// Drop everything and index again, from `directory` or from the previously tracked files
    pub fn rebuild(&self, directory: Option<&Path>, options: &BuildOptions) -> Result<BuildReport> {
        let _writer = self.writer.lock();
        info!("Rebuilding index");

        let tracked: Vec<String> = self.state.lock().documents.keys().cloned().collect();
        if directory.is_none() && tracked.is_empty() {
            return Err(Error::InvalidInput(
                "Nothing to rebuild: no directory given and no documents tracked".to_string(),
            ));
        }
        if let Err(e) = self.clear_locked() {
            self.fail(&e);
            return Err(e);
        }
        {
            let mut cache = self.cache.lock();
            for key in &tracked {
                cache.invalidate(Path::new(key));
            }
        }

        self.begin(IndexStatus::Building, ProgressStage::Scanning);
        let result = match directory {
            Some(directory) => self.build_from_directory_locked(directory, options),
            None => {
                let files = tracked.iter().map(PathBuf::from).collect();
                let workers = options.max_workers.unwrap_or(self.settings.max_workers);
                self.run_batch(files, true, workers, Instant::now())
            }
        };
        self.finish(result)
    }

    /// Remove the vector index, document tracking and manager metadata
    pub fn clear(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.clear_locked()
    }

    fn clear_locked(&self) -> Result<()> {
        info!("Clearing index");
        {
            let mut state = self.state.lock();
            state.status = IndexStatus::NotBuilt;
            state.progress = BuildProgress::idle();
            state.documents.clear();
            state.last_build_time = None;
            state.stats.total_documents = 0;
            state.stats.total_chunks = 0;
            state.stats.last_updated = None;
        }

        self.store.clear()?;
        let metadata_path = self.metadata_path();
        if metadata_path.exists() {
            std::fs::remove_file(metadata_path)?;
        }
        Ok(())
    }

    pub fn status(&self) -> IndexStatus {
        self.state.lock().status
    }

    pub fn get_status(&self) -> StatusReport {
        let store = self.store.statistics();
        let cache = self.cache.lock().statistics();
        let state = self.state.lock();

        StatusReport {
            status: state.status,
            last_build_time: state.last_build_time.clone(),
            progress: state.progress.clone(),
            statistics: state.stats.clone(),
            average_build_time: (state.stats.build_count > 0)
                .then(|| state.stats.total_build_time / state.stats.build_count as f64),
            indexed_documents: state.documents.len(),
            store,
            cache,
        }
    }

    pub fn list_documents(&self) -> Vec<DocumentInfo> {
        self.state
            .lock()
            .documents
            .iter()
            .map(|(path, document)| DocumentInfo {
                path: path.clone(),
                document: document.clone(),
                exists: Path::new(path).exists(),
            })
            .collect()
    }

    pub fn get_document_info(&self, path: &Path) -> Option<TrackedDocument> {
        let key = path_key(path).ok()?;
        self.state.lock().documents.get(&key).cloned()
    }

    /// Tracked documents whose bytes no longer match the indexed hash, or that vanished
    pub fn find_outdated(&self) -> Vec<String> {
        let tracked: Vec<(String, String)> = self
            .state
            .lock()
            .documents
            .iter()
            .map(|(path, doc)| (path.clone(), doc.content_hash.clone()))
            .collect();

        tracked
            .into_iter()
            .filter(|(path, stored_hash)| {
                let path_ref = Path::new(path);
                if !path_ref.exists() {
                    return true;
                }
                match calculate_file_hash(path_ref) {
                    Ok(current) => &current != stored_hash,
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to hash document");
                        true
                    }
                }
            })
            .map(|(path, _)| path)
            .collect()
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let mut status = Health::Healthy;

        if let Err(e) = self.store.snapshot() {
            status = Health::Unhealthy;
            issues.push(e.to_string());
        }

        let missing = self
            .list_documents()
            .iter()
            .filter(|d| !d.exists)
            .count();
        if missing > 0 {
            status = status.max(Health::Degraded);
            issues.push(format!("{} indexed files no longer exist", missing));
        }

        if !self.index_dir.exists() {
            status = status.max(Health::Degraded);
            issues.push("Index directory does not exist".to_string());
        }

        if self.status() == IndexStatus::Error {
            status = status.max(Health::Degraded);
            if let Some(error) = self.state.lock().progress.error.clone() {
                issues.push(format!("Last operation failed: {}", error));
            }
        }

        HealthReport { status, issues }
    }

    fn begin(&self, status: IndexStatus, stage: ProgressStage) {
        let mut state = self.state.lock();
        state.status = status;
        state.progress = BuildProgress::at(stage, 0.0);
    }

    fn finish(&self, result: Result<BatchReport>) -> Result<BatchReport> {
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn fail(&self, e: &Error) {
        let mut state = self.state.lock();
        state.status = IndexStatus::Error;
        state.progress.stage = ProgressStage::Error;
        state.progress.error = Some(e.to_string());
        drop(state);
        warn!(error = %e, "Index operation failed");
    }

    /// Plan, parse, embed and record one batch of files. Caller holds `writer`.
    fn run_batch(
        &self,
        files: Vec<PathBuf>,
        update_existing: bool,
        workers: usize,
        started: Instant,
    ) -> Result<BatchReport> {
        // Deduplicate while keeping enumeration order
        let mut seen = HashSet::new();
        let mut entries: Vec<(PathBuf, Option<String>)> = Vec::new();
        for file in files {
            let key = path_key(&file).ok();
            if let Some(key) = &key {
                if !seen.insert(key.clone()) {
                    continue;
                }
            }
            let path = normalize_path(&file).unwrap_or(file);
            entries.push((path, key));
        }
        let total = entries.len();

        let store_counts = self.store.source_counts()?;
        let tracked = self.state.lock().documents.clone();

        let plans: Vec<Plan> = {
            let mut cache = self.cache.lock();
            entries
                .iter()
                .map(|(path, key)| match key {
                    Some(key) => plan_file(
                        &mut cache,
                        path,
                        key,
                        store_counts.contains_key(key),
                        tracked.get(key),
                        update_existing,
                    ),
                    None => Plan::Failed("path is not valid UTF-8".to_string()),
                })
                .collect()
        };

        let jobs: Vec<(usize, PathBuf)> = plans
            .iter()
            .enumerate()
            .filter(|(_, plan)| matches!(plan, Plan::Parse { .. }))
            .map(|(slot, _)| (slot, entries[slot].0.clone()))
            .collect();
        let cached = plans
            .iter()
            .filter(|p| matches!(p, Plan::Unchanged { .. } | Plan::FromCache { .. }))
            .count();

        {
            let mut state = self.state.lock();
            state.progress = BuildProgress {
                stage: ProgressStage::Parsing,
                progress: 0.0,
                processed_files: total - jobs.len(),
                total_files: total,
                cached_files: cached,
                error: None,
            };
        }
        debug!(total, parse = jobs.len(), cached, "Planned batch");

        let mut parsed = self.parse_parallel(jobs, workers, total)?;

        // Assemble in enumeration order
        let mut files = Vec::with_capacity(total);
        let mut new_chunks: Vec<TextChunk> = Vec::new();
        let mut to_remove: Vec<String> = Vec::new();
        let mut cache_writes: Vec<CacheWrite> = Vec::new();
        let mut invalidations: Vec<PathBuf> = Vec::new();
        let mut tracking: Vec<(String, Option<TrackedDocument>)> = Vec::new();
        let now = chrono::Utc::now().to_rfc3339();

        for (slot, plan) in plans.into_iter().enumerate() {
            let (path, key) = &entries[slot];
            let key = key.clone().unwrap_or_else(|| path.to_string_lossy().into_owned());

            let outcome = match plan {
                Plan::Unchanged { hash, size } => {
                    let chunk_count = store_counts.get(&key).copied().unwrap_or(0);
                    let document = match tracked.get(&key) {
                        Some(existing) if !existing.content_hash.is_empty() => existing.clone(),
                        _ => TrackedDocument {
                            content_hash: hash,
                            chunk_count,
                            indexed_at: now.clone(),
                            file_size: size,
                        },
                    };
                    tracking.push((key.clone(), Some(document)));
                    FileOutcome::Unchanged
                }
                Plan::FromCache { chunks, hash, size } => {
                    let count = chunks.len();
                    if count > 0 {
                        tracking.push((
                            key.clone(),
                            Some(TrackedDocument {
                                content_hash: hash,
                                chunk_count: count,
                                indexed_at: now.clone(),
                                file_size: size,
                            }),
                        ));
                    }
                    new_chunks.extend(chunks);
                    FileOutcome::CacheHit { chunks: count }
                }
                Plan::Parse { replace } => {
                    if replace {
                        to_remove.push(key.clone());
                    }
                    match parsed.remove(&slot) {
                        Some(Ok(file)) => {
                            let mut chunks = file.chunks;
                            for (i, chunk) in chunks.iter_mut().enumerate() {
                                chunk.source = key.clone();
                                if chunk.chunk_id.is_empty() {
                                    chunk.chunk_id = i.to_string();
                                }
                            }
                            cache_writes.push(CacheWrite {
                                path: path.clone(),
                                summaries: chunks
                                    .iter()
                                    .map(|c| ChunkSummary {
                                        chunk_id: c.chunk_id.clone(),
                                        content_length: c.content.chars().count(),
                                        metadata: c.metadata.clone(),
                                    })
                                    .collect(),
                                content: chunks.iter().map(|c| c.content.as_str()).collect(),
                                observed: file.observed.clone(),
                            });

                            if chunks.is_empty() {
                                tracking.push((key.clone(), None));
                                FileOutcome::Empty
                            } else {
                                let count = chunks.len();
                                tracking.push((
                                    key.clone(),
                                    Some(TrackedDocument {
                                        content_hash: file.observed.hash,
                                        chunk_count: count,
                                        indexed_at: now.clone(),
                                        file_size: file.observed.fingerprint.size,
                                    }),
                                ));
                                new_chunks.extend(chunks);
                                FileOutcome::Fresh { chunks: count }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(path = %key, error = %e, "Failed to parse file, skipping");
                            invalidations.push(path.clone());
                            tracking.push((key.clone(), None));
                            FileOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                        None => FileOutcome::Failed {
                            reason: "parse worker produced no result".to_string(),
                        },
                    }
                }
                Plan::Skipped => FileOutcome::Skipped,
                Plan::Failed(reason) => {
                    warn!(path = %key, reason = %reason, "Skipping file");
                    FileOutcome::Failed { reason }
                }
            };
            files.push(FileReport { path: key, outcome });
        }

        // Store writes: stale records first, then the new chunks
        {
            let mut state = self.state.lock();
            state.progress.stage = ProgressStage::Embedding;
            state.progress.progress = 50.0;
        }

        let mut removed_chunks = 0;
        if !to_remove.is_empty() && self.store.snapshot()?.is_some() {
            removed_chunks = self.store.remove(&to_remove)?.removed_chunks;
            // Tracking follows the store even if the add below fails
            let mut state = self.state.lock();
            for key in &to_remove {
                state.documents.remove(key);
            }
        }
        let added = new_chunks.len();
        if added > 0 {
            self.store.add(new_chunks)?;
        } else if !self.store.is_loaded() && !self.store.load()? {
            debug!("No chunks to add and no existing index on disk");
        }

        // Bookkeeping only after the store accepted the batch
        {
            let mut cache = self.cache.lock();
            for write in &cache_writes {
                let mut metadata = Metadata::new();
                metadata.insert(
                    "file_size".to_string(),
                    serde_json::Value::from(write.observed.fingerprint.size),
                );
                let record = IndexRecord {
                    success: true,
                    chunks: &write.summaries,
                    metadata,
                    content: Some(&write.content),
                    observed: Some(write.observed.clone()),
                };
                if let Err(e) = cache.record(&write.path, record) {
                    warn!(path = %write.path.display(), error = %e, "Failed to cache file index");
                }
            }
            for path in &invalidations {
                cache.invalidate(path);
            }
        }

        let total_chunks = self.store.record_count();
        let report = {
            let mut state = self.state.lock();
            for (key, document) in tracking {
                match document {
                    Some(document) => {
                        state.documents.insert(key, document);
                    }
                    None => {
                        state.documents.remove(&key);
                    }
                }
            }
            self.refresh_stats(&mut state, total_chunks);
            state.status = if total_chunks > 0 {
                IndexStatus::Ready
            } else {
                IndexStatus::NotBuilt
            };

            let count = |pred: fn(&FileOutcome) -> bool| files.iter().filter(|f| pred(&f.outcome)).count();
            let report = BatchReport {
                total_files: total,
                processed_files: count(|o| matches!(o, FileOutcome::Fresh { .. } | FileOutcome::Empty)),
                cached_files: cached,
                skipped_files: count(|o| matches!(o, FileOutcome::Skipped)),
                failed_files: count(|o| matches!(o, FileOutcome::Failed { .. })),
                new_chunks: added,
                removed_chunks,
                total_chunks,
                total_documents: state.documents.len(),
                elapsed: started.elapsed().as_secs_f64(),
                cache_hit_rate: if total > 0 {
                    cached as f64 / total as f64
                } else {
                    0.0
                },
                files,
            };

            state.progress = BuildProgress {
                stage: ProgressStage::Completed,
                progress: 100.0,
                processed_files: total,
                total_files: total,
                cached_files: cached,
                error: None,
            };
            report
        };
        self.save_metadata();

        info!(
            files = report.total_files,
            new_chunks = report.new_chunks,
            cached = report.cached_files,
            failed = report.failed_files,
            elapsed = report.elapsed,
            "Index batch complete"
        );
        Ok(report)
    }

    /// Parse files on a bounded pool. Workers only read files; results come
    /// back over a channel to this thread.
    fn parse_parallel(
        &self,
        jobs: Vec<(usize, PathBuf)>,
        workers: usize,
        total: usize,
    ) -> Result<BTreeMap<usize, Result<ParsedFile>>> {
        let mut results = BTreeMap::new();
        if jobs.is_empty() {
            return Ok(results);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("docindex-parse-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to start parse workers: {}", e)))?;

        pool.in_place_scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for (slot, path) in jobs {
                let tx = tx.clone();
                let parser = Arc::clone(&self.parser);
                scope.spawn(move |_| {
                    let result = parse_file(parser.as_ref(), &path);
                    // The receiver outlives the scope
                    let _ = tx.send((slot, result));
                });
            }
            drop(tx);

            for (slot, result) in rx {
                results.insert(slot, result);
                let mut state = self.state.lock();
                state.progress.processed_files += 1;
                state.progress.progress =
                    state.progress.processed_files as f32 / total.max(1) as f32 * 50.0;
            }
        });

        Ok(results)
    }

    fn refresh_stats(&self, state: &mut ManagerState, total_chunks: usize) {
        state.stats.total_documents = state.documents.len();
        state.stats.total_chunks = total_chunks;
        state.stats.last_updated = Some(chrono::Utc::now().to_rfc3339());
    }

    fn load_metadata(&self) {
        let path = self.metadata_path();
        if !path.exists() {
            return;
        }
        let loaded = std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| serde_json::from_str::<ManagerMetadataFile>(&raw).map_err(Error::from));

        match loaded {
            Ok(file) => {
                let mut state = self.state.lock();
                info!(documents = file.documents.len(), "Loaded index metadata");
                state.documents = file.documents;
                state.last_build_time = file.last_build_time;
                state.stats = file.statistics;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to load index metadata"),
        }
    }

    /// Write tracking to disk. Failures are logged, not returned.
    fn save_metadata(&self) {
        let file = {
            let state = self.state.lock();
            ManagerMetadataFile {
                version: METADATA_VERSION.to_string(),
                documents: state.documents.clone(),
                last_build_time: state.last_build_time.clone(),
                statistics: state.stats.clone(),
            }
        };

        let result = std::fs::create_dir_all(&self.index_dir)
            .map_err(Error::from)
            .and_then(|_| write_json_atomic(&self.metadata_path(), &file));
        if let Err(e) = result {
            warn!(error = %e, "Failed to save index metadata");
        }
    }

    /// Make tracking agree with what the store actually holds
    fn reconcile(&self) {
        let counts = match self.store.source_counts() {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "Vector index could not be loaded");
                let mut state = self.state.lock();
                state.status = IndexStatus::Error;
                state.progress = BuildProgress::at(ProgressStage::Error, 0.0);
                state.progress.error = Some(e.to_string());
                return;
            }
        };

        let mut cache = self.cache.lock();
        let mut state = self.state.lock();
        let before = state.documents.len();
        state.documents.retain(|path, _| counts.contains_key(path));
        let dropped = before - state.documents.len();

        let mut adopted = 0;
        for (source, &chunk_count) in &counts {
            match state.documents.get_mut(source) {
                Some(document) => document.chunk_count = chunk_count,
                None => {
                    let path = Path::new(source);
                    let (content_hash, file_size) = if cache.is_valid(path) {
                        cache
                            .get(path)
                            .map(|e| (e.file_hash.clone(), e.size))
                            .unwrap_or_default()
                    } else {
                        (String::new(), 0)
                    };
                    state.documents.insert(
                        source.clone(),
                        TrackedDocument {
                            content_hash,
                            chunk_count,
                            indexed_at: chrono::Utc::now().to_rfc3339(),
                            file_size,
                        },
                    );
                    adopted += 1;
                }
            }
        }

        let total_chunks = counts.values().sum();
        self.refresh_stats(&mut state, total_chunks);
        state.status = if counts.is_empty() {
            IndexStatus::NotBuilt
        } else {
            IndexStatus::Ready
        };
        drop(state);
        drop(cache);

        if dropped > 0 || adopted > 0 {
            info!(dropped, adopted, "Reconciled document tracking with vector index");
            self.save_metadata();
        }
    }
}

fn plan_file(
    cache: &mut FileIndexCache,
    path: &Path,
    key: &str,
    in_store: bool,
    tracked: Option<&TrackedDocument>,
    update_existing: bool,
) -> Plan {
    if !path.is_file() {
        return Plan::Failed("file not found".to_string());
    }

    let cache_valid = cache.is_valid(path);
    let cached = if cache_valid { cache.get(path).cloned() } else { None };
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    if in_store {
        let reference = tracked
            .map(|t| t.content_hash.as_str())
            .filter(|h| !h.is_empty());
        let cached_hash = cached.as_ref().map(|e| e.file_hash.as_str());

        let current = match (reference, cached_hash) {
            (Some(r), Some(c)) if r == c => Some(c.to_string()),
            (None, Some(c)) => Some(c.to_string()),
            _ => calculate_file_hash(path).ok(),
        };
        let unchanged = match (reference, &current) {
            (Some(r), Some(c)) => r == c,
            (None, Some(_)) => cached_hash.is_some(),
            _ => false,
        };

        if unchanged {
            if let Some(hash) = current {
                debug!(path = %key, "Unchanged, already indexed");
                return Plan::Unchanged { hash, size };
            }
        }
        if !update_existing && tracked.is_some() {
            debug!(path = %key, "Changed, updates disabled");
            return Plan::Skipped;
        }
        return Plan::Parse { replace: true };
    }

    if let Some(entry) = cached {
        if let Some(chunks) = chunks_from_cache(&entry, key) {
            debug!(path = %key, chunks = chunks.len(), "Restoring chunks from cache");
            return Plan::FromCache {
                chunks,
                hash: entry.file_hash,
                size: entry.size,
            };
        }
    }
    Plan::Parse { replace: false }
}

/// Rebuild chunks from cached text, cut by the recorded chunk lengths
fn chunks_from_cache(entry: &CacheEntry, key: &str) -> Option<Vec<TextChunk>> {
    if !entry.index_success {
        return None;
    }
    if entry.chunks_info.is_empty() {
        return (entry.chunks_count == 0).then(Vec::new);
    }

    let content = entry.parse_content.as_deref()?;
    let mut chars = content.chars();
    let mut chunks = Vec::with_capacity(entry.chunks_info.len());
    for summary in &entry.chunks_info {
        let text: String = chars.by_ref().take(summary.content_length).collect();
        if text.chars().count() != summary.content_length {
            return None;
        }
        chunks.push(TextChunk {
            content: text,
            chunk_id: summary.chunk_id.clone(),
            source: key.to_string(),
            metadata: summary.metadata.clone(),
        });
    }

    // Leftover text means the cached content does not match the summaries
    if chars.next().is_some() {
        return None;
    }
    Some(chunks)
}

/// The file state is captured before the parser reads, so an edit made
/// while parsing leaves the cache and tracking pointing at older bytes.
fn parse_file(parser: &dyn Parser, path: &Path) -> Result<ParsedFile> {
    let observed = FileState::capture(path)?;
    let chunks = parser.parse(path)?;
    Ok(ParsedFile { chunks, observed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::parser::DocumentParser;
    use crate::search::model::HashingEmbedder;
    use std::fs;
    use tempfile::TempDir;

    fn test_manager(base: &Path) -> IndexManager {
        let config = Config::new(Some(base.join("data"))).unwrap();
        config.init().unwrap();
        IndexManager::open(
            &config,
            Arc::new(DocumentParser::default()),
            Arc::new(HashingEmbedder::new(64)),
        )
    }

    #[test]
    fn test_build_tracks_documents() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();
        fs::write(docs.join("b.txt"), "lorem ipsum dolor").unwrap();

        let manager = test_manager(temp_dir.path());
        assert_eq!(manager.status(), IndexStatus::NotBuilt);

        let report = manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap();
        assert_eq!(report.total_files, 2);
        assert_eq!(report.new_chunks, 2);
        assert_eq!(manager.status(), IndexStatus::Ready);
        assert_eq!(manager.list_documents().len(), 2);

        let info = manager.get_document_info(&docs.join("a.txt")).unwrap();
        assert_eq!(info.chunk_count, 1);
        assert_eq!(info.content_hash.len(), 64);

        let status = manager.get_status();
        assert_eq!(status.progress.stage, ProgressStage::Completed);
        assert_eq!(status.statistics.build_count, 1);
    }

    #[test]
    fn test_empty_directory_sets_error_status() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("empty");
        fs::create_dir_all(&docs).unwrap();

        let manager = test_manager(temp_dir.path());
        let err = manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(manager.status(), IndexStatus::Error);
        assert!(manager.get_status().progress.error.is_some());
    }

    #[test]
    fn test_chunks_restored_from_cache_after_clear() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();

        let manager = test_manager(temp_dir.path());
        manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap();
        manager.clear().unwrap();
        assert_eq!(manager.status(), IndexStatus::NotBuilt);

        let report = manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap();
        let key = path_key(&docs.join("a.txt")).unwrap();
        assert_eq!(report.outcome(&key), Some(&FileOutcome::CacheHit { chunks: 1 }));
        assert_eq!(report.total_chunks, 1);
        assert_eq!(manager.store().get_document_by_source(&key).unwrap()[0].content, "the quick brown fox");
    }

    #[test]
    fn test_reconcile_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();

        {
            let manager = test_manager(temp_dir.path());
            manager
                .build_from_directory(&docs, &BuildOptions::default())
                .unwrap();
            fs::remove_file(manager.metadata_path()).unwrap();
        }

        let manager = test_manager(temp_dir.path());
        assert_eq!(manager.status(), IndexStatus::Ready);
        let documents = manager.list_documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].document.chunk_count, 1);
        assert!(!documents[0].document.content_hash.is_empty());
    }

    #[test]
    fn test_chunks_from_cache_rejects_mismatch() {
        let entry = CacheEntry {
            file_path: "/x.txt".to_string(),
            file_hash: "h".to_string(),
            mtime_ns: 0,
            size: 0,
            indexed_at: 0,
            last_checked: 0,
            chunks_count: 2,
            index_success: true,
            metadata: Metadata::new(),
            parse_content: Some("abcdef".to_string()),
            chunks_info: vec![
                ChunkSummary {
                    chunk_id: "0".to_string(),
                    content_length: 2,
                    metadata: Metadata::new(),
                },
                ChunkSummary {
                    chunk_id: "1".to_string(),
                    content_length: 4,
                    metadata: Metadata::new(),
                },
            ],
        };
        let chunks = chunks_from_cache(&entry, "/x.txt").unwrap();
        assert_eq!(chunks[0].content, "ab");
        assert_eq!(chunks[1].content, "cdef");

        let mut short = entry.clone();
        short.parse_content = Some("abc".to_string());
        assert!(chunks_from_cache(&short, "/x.txt").is_none());

        let mut uncached = entry;
        uncached.parse_content = None;
        assert!(chunks_from_cache(&uncached, "/x.txt").is_none());
    }

    /// Hashing embedder that can be switched to fail
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        failing: std::sync::atomic::AtomicBool,
    }

    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Model("embedding backend unavailable".to_string()));
            }
            self.inner.embed(texts)
        }
    }

    #[test]
    fn test_failed_add_drops_tracking_of_removed_sources() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();
        fs::write(docs.join("b.txt"), "lorem ipsum dolor").unwrap();

        let config = Config::new(Some(temp_dir.path().join("data"))).unwrap();
        config.init().unwrap();
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashingEmbedder::new(64),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        let manager = IndexManager::open(
            &config,
            Arc::new(DocumentParser::default()),
            Arc::clone(&embedder) as Arc<dyn Embedder>,
        );
        manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap();

        fs::write(docs.join("a.txt"), "the slow green turtle").unwrap();
        embedder
            .failing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = manager
            .add_documents(&[docs.join("a.txt")], true)
            .unwrap_err();
        assert!(matches!(err, Error::Model(_)));
        assert_eq!(manager.status(), IndexStatus::Error);

        let a = path_key(&docs.join("a.txt")).unwrap();
        assert!(!manager.store().has_document(&a).unwrap());
        assert!(manager.get_document_info(&docs.join("a.txt")).is_none());
        assert_eq!(manager.list_documents().len(), 1);
    }

    #[test]
    fn test_failed_clear_during_rebuild_sets_error_status() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();

        let manager = test_manager(temp_dir.path());
        manager
            .build_from_directory(&docs, &BuildOptions::default())
            .unwrap();

        // A directory where the metadata file belongs cannot be removed as a file
        let metadata_path = manager.metadata_path();
        fs::remove_file(&metadata_path).unwrap();
        fs::create_dir_all(&metadata_path).unwrap();

        assert!(manager.rebuild(Some(&docs), &BuildOptions::default()).is_err());
        assert_eq!(manager.status(), IndexStatus::Error);
        assert!(manager.get_status().progress.error.is_some());
    }

    #[test]
    fn test_health_check() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "the quick brown fox").unwrap();
        fs::write(docs.join("b.txt"), "lorem ipsum dolor").unwrap();

        let db_path = {
            let manager = test_manager(temp_dir.path());
            manager
                .build_from_directory(&docs, &BuildOptions::default())
                .unwrap();
            let report = manager.health_check();
            assert_eq!(report.status, Health::Healthy);
            assert!(report.issues.is_empty());

            fs::remove_file(docs.join("b.txt")).unwrap();
            let report = manager.health_check();
            assert_eq!(report.status, Health::Degraded);
            assert_eq!(report.issues, vec!["1 indexed files no longer exist".to_string()]);

            manager.store().db_path()
        };

        fs::write(&db_path, b"definitely not a database").unwrap();
        let manager = test_manager(temp_dir.path());
        let report = manager.health_check();
        assert_eq!(report.status, Health::Unhealthy);
        assert!(!report.issues.is_empty());
    }
}
