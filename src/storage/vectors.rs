use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::indexing::parser::TextChunk;
use crate::search::model::Embedder;
use crate::storage::cache::{write_json_atomic, Metadata};
use crate::storage::flat::{distance_to_similarity, FlatIndex};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Table holding the serialized exact-search index under a single key
const INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vector_index");

/// Table holding chunk records keyed by their position in the index.
/// Value: JSON serialized ChunkRecord
const RECORDS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("chunk_records");

const INDEX_KEY: &str = "flat_l2";
const INDEX_VERSION: &str = "1.0";

/// One embedded chunk; `id` is its row in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    pub content: String,
    pub source: String,
    pub chunk_id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChunkRecord {
    /// Serialize to JSON
    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Database(format!("Failed to serialize chunk record: {}", e)))
    }
}

/// Metadata describing a persisted index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub dimension: usize,
    pub model_name: String,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub created_at: String,
    /// Seconds spent embedding during the last build or add
    #[serde(default)]
    pub embedding_time: f64,
    pub index_version: String,
}

/// Immutable view of the index, its records and metadata
#[derive(Debug, Clone)]
pub struct IndexState {
    pub index: FlatIndex,
    pub records: Vec<ChunkRecord>,
    pub metadata: IndexMetadata,
}

impl IndexState {
    /// Vectors and records must line up one to one, with ids equal to positions
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        if self.index.len() != self.records.len() {
            return Err(format!(
                "index holds {} vectors but {} chunk records",
                self.index.len(),
                self.records.len()
            ));
        }
        if let Some((pos, record)) = self
            .records
            .iter()
            .enumerate()
            .find(|(pos, r)| r.id != *pos as u64)
        {
            return Err(format!(
                "chunk record at position {} has id {}",
                pos, record.id
            ));
        }
        Ok(())
    }

    pub fn vector_count(&self) -> usize {
        self.index.len()
    }

    /// Chunk count per source path
    pub fn source_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.source.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Summary of a build or add
#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub added_chunks: usize,
    pub total_chunks: usize,
    pub total_documents: usize,
    pub dimension: usize,
    pub embedding_time: f64,
}

/// Summary of a removal
#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    pub removed_chunks: usize,
    pub remaining_chunks: usize,
}

/// A record matched by a vector search
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub record: ChunkRecord,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    pub index_loaded: bool,
    pub vector_count: usize,
    pub record_count: usize,
    pub total_documents: usize,
    pub dimension: usize,
    pub model_name: String,
    pub created_at: Option<String>,
    pub embedding_time: f64,
    pub index_size_bytes: u64,
    pub search_count: u64,
    pub average_search_time: f64,
}

#[derive(Default)]
struct SearchCounters {
    count: u64,
    total_time: f64,
}

/// Owner of the embedding index and its parallel chunk-record sequence.
///
/// `writer` serializes mutations and is also held while reading the database
/// from disk, so a load never observes a write half done. `loader` keeps
/// concurrent readers from racing each other through that first load.
pub struct VectorStore {
    index_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    db: Mutex<Option<Arc<Database>>>,
    state: RwLock<Option<Arc<IndexState>>>,
    writer: Mutex<()>,
    loader: Mutex<()>,
    counters: Mutex<SearchCounters>,
}

impl VectorStore {
    /// Create a store over the configured index directory. Nothing is read until first use.
    pub fn open(config: &Config, embedder: Arc<dyn Embedder>) -> Self {
        Self::open_at(config.index_dir.clone(), embedder)
    }

    pub fn open_at(index_dir: PathBuf, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index_dir,
            embedder,
            db: Mutex::new(None),
            state: RwLock::new(None),
            writer: Mutex::new(()),
            loader: Mutex::new(()),
            counters: Mutex::new(SearchCounters::default()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.index_dir.join("vectors.redb")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.index_dir.join("metadata.json")
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed every chunk and replace the whole index with the result
    pub fn build(&self, chunks: Vec<TextChunk>) -> Result<StoreReport> {
        let _guard = self.writer.lock();
        self.build_locked(chunks)
    }

    fn build_locked(&self, chunks: Vec<TextChunk>) -> Result<StoreReport> {
        if chunks.is_empty() {
            return Err(Error::InvalidInput(
                "Cannot build an index from zero chunks".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let started = Instant::now();
        let embeddings = self.embed_checked(&texts, None)?;
        let embedding_time = started.elapsed().as_secs_f64();
        let dimension = embeddings[0].len();

        let mut index = FlatIndex::new(dimension);
        index.add(&embeddings)?;
        let records = into_records(chunks, 0);
        let state = self.new_state(index, records, embedding_time);

        let report = StoreReport {
            added_chunks: state.records.len(),
            total_chunks: state.records.len(),
            total_documents: state.metadata.total_documents,
            dimension,
            embedding_time,
        };

        self.commit(state)?;
        info!(
            chunks = report.total_chunks,
            documents = report.total_documents,
            dimension,
            "Built vector index"
        );
        Ok(report)
    }

    /// Embed only the new chunks and append them. Builds when no index exists.
    pub fn add(&self, chunks: Vec<TextChunk>) -> Result<StoreReport> {
        let _guard = self.writer.lock();

        let Some(current) = self.current_or_load_locked()? else {
            return self.build_locked(chunks);
        };

        if chunks.is_empty() {
            return Ok(StoreReport {
                added_chunks: 0,
                total_chunks: current.records.len(),
                total_documents: current.metadata.total_documents,
                dimension: current.index.dimension(),
                embedding_time: 0.0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let started = Instant::now();
        let embeddings = self.embed_checked(&texts, Some(current.index.dimension()))?;
        let embedding_time = started.elapsed().as_secs_f64();

        let mut index = current.index.clone();
        index.add(&embeddings)?;
        let mut records = current.records.clone();
        let added = chunks.len();
        records.extend(into_records(chunks, records.len() as u64));

        let mut state = self.new_state(index, records, embedding_time);
        state.metadata.created_at = current.metadata.created_at.clone();

        let report = StoreReport {
            added_chunks: added,
            total_chunks: state.records.len(),
            total_documents: state.metadata.total_documents,
            dimension: state.index.dimension(),
            embedding_time,
        };

        self.commit(state)?;
        info!(added, total = report.total_chunks, "Added chunks to vector index");
        Ok(report)
    }

    /// Drop every record whose source is listed. The index is rebuilt from the
    /// surviving rows, or cleared when nothing survives.
    pub fn remove(&self, sources: &[String]) -> Result<RemoveOutcome> {
        let _guard = self.writer.lock();

        let Some(current) = self.current_or_load_locked()? else {
            return Err(Error::IndexNotFound {
                path: self.index_dir.clone(),
            });
        };

        let doomed: HashSet<&str> = sources.iter().map(String::as_str).collect();
        let survivors: Vec<usize> = current
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| !doomed.contains(r.source.as_str()))
            .map(|(pos, _)| pos)
            .collect();

        let removed = current.records.len() - survivors.len();
        if removed == 0 {
            return Ok(RemoveOutcome {
                removed_chunks: 0,
                remaining_chunks: current.records.len(),
            });
        }

        if survivors.is_empty() {
            self.clear_locked()?;
            info!(removed, "Removed every chunk, vector index cleared");
            return Ok(RemoveOutcome {
                removed_chunks: removed,
                remaining_chunks: 0,
            });
        }

        let mut index = FlatIndex::new(current.index.dimension());
        let mut vectors = Vec::with_capacity(survivors.len());
        let mut records = Vec::with_capacity(survivors.len());
        for (new_id, &pos) in survivors.iter().enumerate() {
            let vector = current.index.vector(pos).ok_or_else(|| Error::IndexCorrupted {
                path: self.index_dir.clone(),
                details: format!("missing vector for record {}", pos),
            })?;
            vectors.push(vector.to_vec());
            let mut record = current.records[pos].clone();
            record.id = new_id as u64;
            records.push(record);
        }
        index.add(&vectors)?;

        let mut state = self.new_state(index, records, current.metadata.embedding_time);
        state.metadata.created_at = current.metadata.created_at.clone();
        let remaining = state.records.len();

        self.commit(state)?;
        info!(removed, remaining, "Removed chunks from vector index");
        Ok(RemoveOutcome {
            removed_chunks: removed,
            remaining_chunks: remaining,
        })
    }

    /// Nearest chunks to `query`, most similar first
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<VectorHit>> {
        let started = Instant::now();
        let Some(state) = self.current_or_load()? else {
            return Err(Error::IndexNotFound {
                path: self.index_dir.clone(),
            });
        };

        let embedding = self.embedder.embed_query(query)?;
        if embedding.len() != state.index.dimension() {
            return Err(Error::Model(format!(
                "Query embedding has dimension {}, index expects {}",
                embedding.len(),
                state.index.dimension()
            )));
        }

        let hits = state
            .index
            .search(&embedding, top_k)?
            .into_iter()
            .filter_map(|(row, distance)| {
                state.records.get(row).map(|record| VectorHit {
                    record: record.clone(),
                    distance,
                    similarity: distance_to_similarity(distance),
                })
            })
            .collect::<Vec<_>>();

        let mut counters = self.counters.lock();
        counters.count += 1;
        counters.total_time += started.elapsed().as_secs_f64();
        drop(counters);

        debug!(top_k, hits = hits.len(), "Vector search");
        Ok(hits)
    }

    /// Load persisted artifacts. Returns false when there is no index on disk.
    pub fn load(&self) -> Result<bool> {
        let _loading = self.loader.lock();
        let _guard = self.writer.lock();
        Ok(self.load_locked()?.is_some())
    }

    /// Caller holds `writer`
    fn load_locked(&self) -> Result<Option<Arc<IndexState>>> {
        match self.read_state()? {
            Some(state) => {
                info!(
                    chunks = state.records.len(),
                    dimension = state.index.dimension(),
                    "Loaded vector index"
                );
                let state = Arc::new(state);
                *self.state.write() = Some(Arc::clone(&state));
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Drop the in-memory index and every persisted artifact
    pub fn clear(&self) -> Result<()> {
        let _guard = self.writer.lock();
        self.clear_locked()
    }

    fn clear_locked(&self) -> Result<()> {
        *self.state.write() = None;
        *self.db.lock() = None;
        for path in [self.db_path(), self.metadata_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        info!(path = %self.index_dir.display(), "Cleared vector index");
        Ok(())
    }

    /// Current snapshot, loading from disk on first use
    pub fn snapshot(&self) -> Result<Option<Arc<IndexState>>> {
        self.current_or_load()
    }

    /// Current snapshot, or `IndexNotFound` when nothing has been built
    pub fn require_snapshot(&self) -> Result<Arc<IndexState>> {
        self.current_or_load()?.ok_or_else(|| Error::IndexNotFound {
            path: self.index_dir.clone(),
        })
    }

    /// Records belonging to one source, in id order
    pub fn get_document_by_source(&self, source: &str) -> Result<Vec<ChunkRecord>> {
        Ok(self
            .current_or_load()?
            .map(|state| {
                state
                    .records
                    .iter()
                    .filter(|r| r.source == source)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Chunk count per source actually present in the index
    pub fn source_counts(&self) -> Result<BTreeMap<String, usize>> {
        Ok(self
            .current_or_load()?
            .map(|state| state.source_counts())
            .unwrap_or_default())
    }

    pub fn sources(&self) -> Result<Vec<String>> {
        Ok(self.source_counts()?.into_keys().collect())
    }

    pub fn has_document(&self, source: &str) -> Result<bool> {
        Ok(self
            .current_or_load()?
            .map(|state| state.records.iter().any(|r| r.source == source))
            .unwrap_or(false))
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn vector_count(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|s| s.vector_count())
            .unwrap_or(0)
    }

    pub fn record_count(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|s| s.records.len())
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> StoreStatistics {
        let state = self.state.read().clone();
        let counters = self.counters.lock();
        let index_size_bytes = [self.db_path(), self.metadata_path()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        StoreStatistics {
            index_loaded: state.is_some(),
            vector_count: state.as_ref().map(|s| s.vector_count()).unwrap_or(0),
            record_count: state.as_ref().map(|s| s.records.len()).unwrap_or(0),
            total_documents: state
                .as_ref()
                .map(|s| s.metadata.total_documents)
                .unwrap_or(0),
            dimension: state.as_ref().map(|s| s.index.dimension()).unwrap_or(0),
            model_name: self.embedder.model_name().to_string(),
            created_at: state.as_ref().map(|s| s.metadata.created_at.clone()),
            embedding_time: state
                .as_ref()
                .map(|s| s.metadata.embedding_time)
                .unwrap_or(0.0),
            index_size_bytes,
            search_count: counters.count,
            average_search_time: if counters.count > 0 {
                counters.total_time / counters.count as f64
            } else {
                0.0
            },
        }
    }

    fn current_or_load(&self) -> Result<Option<Arc<IndexState>>> {
        if let Some(state) = self.state.read().clone() {
            return Ok(Some(state));
        }

        let _loading = self.loader.lock();
        if let Some(state) = self.state.read().clone() {
            return Ok(Some(state));
        }
        // A write in flight publishes its state on commit; until then there is nothing to serve
        let Some(_guard) = self.writer.try_lock() else {
            debug!("Vector index is being written, not loading");
            return Ok(None);
        };
        self.load_locked()
    }

    fn current_or_load_locked(&self) -> Result<Option<Arc<IndexState>>> {
        if let Some(state) = self.state.read().clone() {
            return Ok(Some(state));
        }
        self.load_locked()
    }

    /// The one open handle on `vectors.redb`. Returns `None` when the file
    /// does not exist and `create` is false.
    fn database(&self, create: bool) -> Result<Option<Arc<Database>>> {
        let mut handle = self.db.lock();
        if let Some(db) = handle.as_ref() {
            return Ok(Some(Arc::clone(db)));
        }

        let db_path = self.db_path();
        let db = if db_path.exists() {
            Database::open(&db_path).map_err(|e| {
                let msg = e.to_string().to_lowercase();
                if msg.contains("lock") || msg.contains("already open") {
                    open_error(&e)
                } else {
                    self.corrupted(format!("cannot open vector database: {}", e))
                }
            })?
        } else if create {
            std::fs::create_dir_all(&self.index_dir)?;
            Database::create(&db_path).map_err(|e| open_error(&e))?
        } else {
            return Ok(None);
        };

        let db = Arc::new(db);
        *handle = Some(Arc::clone(&db));
        Ok(Some(db))
    }

    fn embed_checked(&self, texts: &[String], expected_dim: Option<usize>) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.embedder.embed(texts)?;
        if embeddings.len() != texts.len() {
            return Err(Error::Model(format!(
                "Embedder returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }

        let dimension = expected_dim.unwrap_or_else(|| embeddings.first().map_or(0, Vec::len));
        if dimension == 0 {
            return Err(Error::Model("Embedder returned empty vectors".to_string()));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(Error::Model(format!(
                "Embedder returned a vector of dimension {}, expected {}",
                bad.len(),
                dimension
            )));
        }
        Ok(embeddings)
    }

    fn new_state(&self, index: FlatIndex, records: Vec<ChunkRecord>, embedding_time: f64) -> IndexState {
        let total_documents = records
            .iter()
            .map(|r| r.source.as_str())
            .collect::<HashSet<_>>()
            .len();
        let metadata = IndexMetadata {
            dimension: index.dimension(),
            model_name: self.embedder.model_name().to_string(),
            total_documents,
            total_chunks: records.len(),
            created_at: chrono::Utc::now().to_rfc3339(),
            embedding_time,
            index_version: INDEX_VERSION.to_string(),
        };
        IndexState {
            index,
            records,
            metadata,
        }
    }

    /// Persist a fresh state, then make it visible to readers
    fn commit(&self, state: IndexState) -> Result<()> {
        state.check_consistency().map_err(|details| Error::IndexCorrupted {
            path: self.index_dir.clone(),
            details,
        })?;
        self.persist(&state)?;
        *self.state.write() = Some(Arc::new(state));
        Ok(())
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        let Some(db) = self.database(true)? else {
            return Err(Error::Database("Vector database could not be created".to_string()));
        };
        let write_txn = db
            .begin_write()
            .map_err(db_error("begin write transaction"))?;
        {
            write_txn
                .delete_table(RECORDS_TABLE)
                .map_err(db_error("reset chunk records"))?;

            let mut index_table = write_txn
                .open_table(INDEX_TABLE)
                .map_err(db_error("open index table"))?;
            let blob = state.index.to_bytes();
            index_table
                .insert(INDEX_KEY, blob.as_slice())
                .map_err(db_error("store index"))?;

            let mut records_table = write_txn
                .open_table(RECORDS_TABLE)
                .map_err(db_error("open records table"))?;
            for record in &state.records {
                let json = record.to_json()?;
                records_table
                    .insert(record.id, json.as_str())
                    .map_err(db_error("insert chunk record"))?;
            }
        }
        write_txn.commit().map_err(db_error("commit transaction"))?;

        if let Err(e) = write_json_atomic(&self.metadata_path(), &state.metadata) {
            // Load synthesizes metadata when the file is missing
            warn!(error = %e, "Failed to write index metadata");
        }
        Ok(())
    }

    fn read_state(&self) -> Result<Option<IndexState>> {
        let Some(db) = self.database(false)? else {
            return Ok(None);
        };
        let read_txn = db.begin_read().map_err(db_error("begin read transaction"))?;

        let index_table = match read_txn.open_table(INDEX_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(self.corrupted(format!("cannot open index table: {}", e))),
        };
        let blob = match index_table.get(INDEX_KEY).map_err(db_error("read index"))? {
            Some(guard) => guard.value().to_vec(),
            None => return Ok(None),
        };
        let index = FlatIndex::from_bytes(&blob).map_err(|details| self.corrupted(details))?;

        let records_table = match read_txn.open_table(RECORDS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(self.corrupted(format!("cannot open records table: {}", e))),
        };

        let mut records = Vec::new();
        for item in records_table.iter().map_err(db_error("iterate chunk records"))? {
            let (_key, value) = item.map_err(db_error("read chunk record"))?;
            let record: ChunkRecord = serde_json::from_str(value.value())
                .map_err(|e| self.corrupted(format!("unreadable chunk record: {}", e)))?;
            records.push(record);
        }

        let metadata = match read_metadata(&self.metadata_path()) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                warn!("Index metadata missing, synthesizing it from the index");
                self.new_state(index.clone(), records.clone(), 0.0).metadata
            }
            Err(e) => {
                warn!(error = %e, "Index metadata unreadable, synthesizing it from the index");
                self.new_state(index.clone(), records.clone(), 0.0).metadata
            }
        };

        let state = IndexState {
            index,
            records,
            metadata,
        };
        state
            .check_consistency()
            .map_err(|details| self.corrupted(details))?;
        Ok(Some(state))
    }

    fn corrupted(&self, details: String) -> Error {
        Error::IndexCorrupted {
            path: self.index_dir.clone(),
            details,
        }
    }
}

fn into_records(chunks: Vec<TextChunk>, first_id: u64) -> Vec<ChunkRecord> {
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| ChunkRecord {
            id: first_id + i as u64,
            content: chunk.content,
            source: chunk.source,
            chunk_id: chunk.chunk_id,
            metadata: chunk.metadata,
        })
        .collect()
}

fn read_metadata(path: &Path) -> Result<Option<IndexMetadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

fn open_error(e: &impl std::fmt::Display) -> Error {
    let msg = e.to_string();
    if msg.to_lowercase().contains("lock") || msg.to_lowercase().contains("already open") {
        Error::Database(
            "Vector database is locked. Another docindex process may be running. Close other instances and try again."
                .to_string(),
        )
    } else {
        Error::Database(format!("Failed to open vector database: {}", msg))
    }
}

fn db_error<E: std::fmt::Display>(action: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Database(format!("Failed to {}: {}", action, e))
}
