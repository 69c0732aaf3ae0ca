use crate::core::config::SearchSettings;
use crate::core::error::{Error, Result};
use crate::search::scoring::{
    dedup_key, extract_keywords, fuzzy_score, head, highlight, keyword_highlight, keyword_score,
    merge_highlights, preprocess_query, HIGHLIGHT_LENGTH,
};
use crate::storage::cache::Metadata;
use crate::storage::vectors::{ChunkRecord, IndexState, VectorStore};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Vector similarity
    Semantic,
    /// Keyword occurrence
    Keyword,
    /// Weighted mix of semantic and keyword
    Hybrid,
    /// Approximate string matching
    Fuzzy,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Semantic => "semantic",
            SearchType::Keyword => "keyword",
            SearchType::Hybrid => "hybrid",
            SearchType::Fuzzy => "fuzzy",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "semantic" => Ok(SearchType::Semantic),
            "keyword" => Ok(SearchType::Keyword),
            "hybrid" => Ok(SearchType::Hybrid),
            "fuzzy" => Ok(SearchType::Fuzzy),
            other => Err(Error::InvalidInput(format!(
                "Unknown search type '{}'; expected semantic, keyword, hybrid or fuzzy",
                other
            ))),
        }
    }
}

/// Restrictions applied to results after scoring
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Regular expression matched anywhere in the source path
    pub source_pattern: Option<String>,
    /// Allowed file extensions, with or without the leading dot
    pub file_types: Option<Vec<String>>,
    /// Exact key/value pairs the chunk metadata must contain
    pub metadata: Metadata,
}

impl SearchFilters {
    fn is_empty(&self) -> bool {
        self.source_pattern.is_none() && self.file_types.is_none() && self.metadata.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub search_type: SearchType,
    /// Falls back to the configured default
    pub top_k: Option<usize>,
    pub min_score: f32,
    pub filters: SearchFilters,
    pub semantic_weight: Option<f32>,
    pub keyword_weight: Option<f32>,
    pub include_metadata: bool,
    pub deduplicate: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            search_type: SearchType::Semantic,
            top_k: None,
            min_score: 0.0,
            filters: SearchFilters::default(),
            semantic_weight: None,
            keyword_weight: None,
            include_metadata: true,
            deduplicate: true,
        }
    }

    pub fn with_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_weights(mut self, semantic: f32, keyword: f32) -> Self {
        self.semantic_weight = Some(semantic);
        self.keyword_weight = Some(keyword);
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.include_metadata = false;
        self
    }

    pub fn keep_duplicates(mut self) -> Self {
        self.deduplicate = false;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// 1-based position in the final list
    pub rank: usize,
    pub score: f32,
    pub content: String,
    pub source: String,
    pub chunk_id: String,
    pub search_type: SearchType,
    pub highlight: String,
    pub metadata: Metadata,
}

impl SearchResult {
    fn candidate(record: &ChunkRecord, score: f32, search_type: SearchType, highlight: String) -> Self {
        Self {
            rank: 0,
            score,
            content: record.content.clone(),
            source: record.source.clone(),
            chunk_id: record.chunk_id.clone(),
            search_type,
            highlight,
            metadata: record.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStatistics {
    pub total_searches: u64,
    pub semantic_searches: u64,
    pub keyword_searches: u64,
    pub hybrid_searches: u64,
    pub fuzzy_searches: u64,
    pub total_search_time: f64,
    pub average_search_time: f64,
}

/// A query after its contract checks
struct Validated {
    top_k: usize,
    semantic_weight: f32,
    keyword_weight: f32,
    source_pattern: Option<Regex>,
    file_types: Option<HashSet<String>>,
}

/// Runs the four retrieval strategies over a vector store and shapes their results
pub struct SearchEngine {
    store: Arc<VectorStore>,
    settings: SearchSettings,
    stats: Mutex<SearchStatistics>,
}

impl SearchEngine {
    pub fn new(store: Arc<VectorStore>, settings: SearchSettings) -> Self {
        Self {
            store,
            settings,
            stats: Mutex::new(SearchStatistics::default()),
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Run a query. Fails with `IndexNotFound` when nothing has been indexed;
    /// an index without matches yields an empty list.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let started = Instant::now();
        let validated = self.validate(query)?;
        let state = self.store.require_snapshot()?;

        info!(search_type = %query.search_type, query = %query.text, "Searching");
        let processed = preprocess_query(&query.text);
        // Vector candidates get headroom for post-filtering; lexical scans keep every match
        let limit = validated.top_k * 2;
        let everything = state.records.len();

        let candidates = match query.search_type {
            SearchType::Semantic => self.semantic(&processed, limit)?,
            SearchType::Keyword => keyword(&state, &processed, everything),
            SearchType::Hybrid => self.hybrid(&state, &processed, limit, &validated)?,
            SearchType::Fuzzy => fuzzy(&state, &processed, everything, self.settings.fuzzy_threshold),
        };
        debug!(candidates = candidates.len(), "Scored candidates");

        let results = self.post_process(candidates, query, &validated);

        let elapsed = started.elapsed().as_secs_f64();
        self.record(query.search_type, elapsed);
        info!(results = results.len(), elapsed, "Search complete");
        Ok(results)
    }

    pub fn semantic_search(&self, text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        self.search(&SearchQuery::new(text).with_type(SearchType::Semantic).with_top_k(top_k))
    }

    pub fn keyword_search(&self, text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        self.search(&SearchQuery::new(text).with_type(SearchType::Keyword).with_top_k(top_k))
    }

    pub fn hybrid_search(
        &self,
        text: &str,
        top_k: usize,
        semantic_weight: f32,
        keyword_weight: f32,
    ) -> Result<Vec<SearchResult>> {
        self.search(
            &SearchQuery::new(text)
                .with_type(SearchType::Hybrid)
                .with_top_k(top_k)
                .with_weights(semantic_weight, keyword_weight),
        )
    }

    pub fn fuzzy_search(&self, text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        self.search(&SearchQuery::new(text).with_type(SearchType::Fuzzy).with_top_k(top_k))
    }

    pub fn statistics(&self) -> SearchStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = SearchStatistics::default();
    }

    fn validate(&self, query: &SearchQuery) -> Result<Validated> {
        if query.text.trim().is_empty() {
            return Err(Error::InvalidInput("Search query must not be empty".to_string()));
        }

        let top_k = query.top_k.unwrap_or(self.settings.default_top_k);
        if top_k == 0 || top_k > self.settings.max_top_k {
            return Err(Error::InvalidInput(format!(
                "top_k must be between 1 and {}, got {}",
                self.settings.max_top_k, top_k
            )));
        }

        if !query.min_score.is_finite() {
            return Err(Error::InvalidInput("min_score must be a finite number".to_string()));
        }

        let semantic_weight = query.semantic_weight.unwrap_or(self.settings.semantic_weight);
        let keyword_weight = query.keyword_weight.unwrap_or(self.settings.keyword_weight);
        let weights_ok = [semantic_weight, keyword_weight]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0);
        if !weights_ok || semantic_weight + keyword_weight <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "Search weights must be non-negative and not both zero (semantic {}, keyword {})",
                semantic_weight, keyword_weight
            )));
        }

        let source_pattern = query
            .filters
            .source_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    Error::InvalidInput(format!("Invalid source pattern '{}': {}", pattern, e))
                })
            })
            .transpose()?;

        let file_types = match &query.filters.file_types {
            Some(types) if types.is_empty() => {
                return Err(Error::InvalidInput(
                    "File type filter must name at least one extension".to_string(),
                ));
            }
            Some(types) => Some(
                types
                    .iter()
                    .map(|t| t.trim().trim_start_matches('.').to_lowercase())
                    .collect(),
            ),
            None => None,
        };

        Ok(Validated {
            top_k,
            semantic_weight,
            keyword_weight,
            source_pattern,
            file_types,
        })
    }

    fn semantic(&self, processed: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let hits = self.store.search(processed, limit)?;
        Ok(hits
            .iter()
            .map(|hit| {
                SearchResult::candidate(
                    &hit.record,
                    hit.similarity,
                    SearchType::Semantic,
                    highlight(&hit.record.content, processed.trim(), HIGHLIGHT_LENGTH),
                )
            })
            .collect())
    }

    fn hybrid(
        &self,
        state: &IndexState,
        processed: &str,
        limit: usize,
        validated: &Validated,
    ) -> Result<Vec<SearchResult>> {
        let total = validated.semantic_weight + validated.keyword_weight;
        let semantic_weight = validated.semantic_weight / total;
        let keyword_weight = validated.keyword_weight / total;

        let semantic = self.semantic(processed, limit)?;
        let keyword = keyword(state, processed, limit);

        // Merge by content, keeping first-seen order
        let mut merged: Vec<(SearchResult, f32, f32)> = Vec::new();
        let mut by_content: HashMap<String, usize> = HashMap::new();
        for result in semantic {
            if by_content.contains_key(&result.content) {
                continue;
            }
            by_content.insert(result.content.clone(), merged.len());
            let score = result.score;
            merged.push((result, score, 0.0));
        }
        for result in keyword {
            match by_content.get(&result.content) {
                Some(&slot) => {
                    let entry = &mut merged[slot];
                    entry.2 = result.score;
                    let semantic_highlight = std::mem::take(&mut entry.0.highlight);
                    entry.0.highlight = merge_highlights(semantic_highlight, result.highlight);
                }
                None => {
                    by_content.insert(result.content.clone(), merged.len());
                    let score = result.score;
                    merged.push((result, 0.0, score));
                }
            }
        }

        let mut results: Vec<SearchResult> = merged
            .into_iter()
            .map(|(mut result, semantic_score, keyword_score)| {
                result.score = semantic_score * semantic_weight + keyword_score * keyword_weight;
                result.search_type = SearchType::Hybrid;
                result
                    .metadata
                    .insert("semantic_score".to_string(), serde_json::Value::from(semantic_score));
                result
                    .metadata
                    .insert("keyword_score".to_string(), serde_json::Value::from(keyword_score));
                result
            })
            .collect();
        sort_by_score(&mut results);
        Ok(results)
    }

    fn post_process(
        &self,
        candidates: Vec<SearchResult>,
        query: &SearchQuery,
        validated: &Validated,
    ) -> Vec<SearchResult> {
        let mut seen = HashSet::new();
        let mut per_source: HashMap<String, usize> = HashMap::new();

        candidates
            .into_iter()
            .filter(|r| r.score >= query.min_score)
            .filter(|r| !query.deduplicate || seen.insert(dedup_key(&r.content)))
            .filter(|r| {
                let count = per_source.entry(r.source.clone()).or_insert(0);
                *count += 1;
                *count <= self.settings.max_results_per_document
            })
            .filter(|r| query.filters.is_empty() || passes_filters(r, query, validated))
            .take(validated.top_k)
            .enumerate()
            .map(|(i, mut r)| {
                r.rank = i + 1;
                if !query.include_metadata {
                    r.metadata.clear();
                }
                r
            })
            .collect()
    }

    fn record(&self, search_type: SearchType, elapsed: f64) {
        let mut stats = self.stats.lock();
        stats.total_searches += 1;
        stats.total_search_time += elapsed;
        match search_type {
            SearchType::Semantic => stats.semantic_searches += 1,
            SearchType::Keyword => stats.keyword_searches += 1,
            SearchType::Hybrid => stats.hybrid_searches += 1,
            SearchType::Fuzzy => stats.fuzzy_searches += 1,
        }
        stats.average_search_time = stats.total_search_time / stats.total_searches as f64;
    }
}

fn keyword(state: &IndexState, processed: &str, limit: usize) -> Vec<SearchResult> {
    let keywords = extract_keywords(processed);
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut results: Vec<SearchResult> = state
        .records
        .iter()
        .filter_map(|record| {
            let score = keyword_score(&record.content, &keywords);
            (score > 0.0).then(|| {
                SearchResult::candidate(
                    record,
                    score,
                    SearchType::Keyword,
                    keyword_highlight(&record.content, &keywords, HIGHLIGHT_LENGTH),
                )
            })
        })
        .collect();
    sort_by_score(&mut results);
    results.truncate(limit);
    results
}

fn fuzzy(state: &IndexState, processed: &str, limit: usize, threshold: f32) -> Vec<SearchResult> {
    let query = processed.trim();
    let mut results: Vec<SearchResult> = state
        .records
        .iter()
        .filter_map(|record| {
            let score = fuzzy_score(&record.content, query);
            (score >= threshold).then(|| {
                SearchResult::candidate(
                    record,
                    score,
                    SearchType::Fuzzy,
                    head(&record.content, HIGHLIGHT_LENGTH),
                )
            })
        })
        .collect();
    sort_by_score(&mut results);
    results.truncate(limit);
    results
}

/// Highest score first; ties keep index order
fn sort_by_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn passes_filters(result: &SearchResult, query: &SearchQuery, validated: &Validated) -> bool {
    if let Some(pattern) = &validated.source_pattern {
        if !pattern.is_match(&result.source) {
            return false;
        }
    }

    if let Some(types) = &validated.file_types {
        let extension = Path::new(&result.source)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !types.contains(&extension) {
            return false;
        }
    }

    query
        .filters
        .metadata
        .iter()
        .all(|(key, value)| result.metadata.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::parser::TextChunk;
    use crate::search::model::HashingEmbedder;
    use tempfile::TempDir;

    fn chunk(source: &str, id: usize, content: &str) -> TextChunk {
        let mut metadata = Metadata::new();
        metadata.insert("position".to_string(), serde_json::Value::from(id));
        TextChunk {
            content: content.to_string(),
            chunk_id: id.to_string(),
            source: source.to_string(),
            metadata,
        }
    }

    fn engine(temp_dir: &TempDir, chunks: Vec<TextChunk>) -> SearchEngine {
        let store = Arc::new(VectorStore::open_at(
            temp_dir.path().to_path_buf(),
            Arc::new(HashingEmbedder::new(64)),
        ));
        if !chunks.is_empty() {
            store.build(chunks).unwrap();
        }
        SearchEngine::new(store, SearchSettings::default())
    }

    #[test]
    fn test_search_type_from_str() {
        assert_eq!("Hybrid".parse::<SearchType>().unwrap(), SearchType::Hybrid);
        assert_eq!(" fuzzy ".parse::<SearchType>().unwrap(), SearchType::Fuzzy);
        let err = "regex".parse::<SearchType>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_no_index_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, vec![]);
        let err = engine.keyword_search("anything", 5).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_keyword_ranking_and_highlight() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            vec![
                chunk("/docs/a.txt", 0, "the quick brown fox"),
                chunk("/docs/b.txt", 0, "lorem ipsum dolor"),
            ],
        );

        let results = engine.keyword_search("Quick fox!", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "/docs/a.txt");
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].search_type, SearchType::Keyword);
        assert!(results[0].highlight.contains("quick"));

        assert!(engine.keyword_search("nowhere tokens", 5).unwrap().is_empty());
        // Only stop words and short words
        assert!(engine.keyword_search("the of it", 5).unwrap().is_empty());
    }

    #[test]
    fn test_contract_errors() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, vec![chunk("/docs/a.txt", 0, "the quick brown fox")]);

        let cases = vec![
            SearchQuery::new("   "),
            SearchQuery::new("fox").with_top_k(0),
            SearchQuery::new("fox").with_top_k(51),
            SearchQuery::new("fox").with_weights(-1.0, 1.0),
            SearchQuery::new("fox").with_weights(0.0, 0.0),
            SearchQuery::new("fox").with_filters(SearchFilters {
                source_pattern: Some("([unclosed".to_string()),
                ..Default::default()
            }),
            SearchQuery::new("fox").with_filters(SearchFilters {
                file_types: Some(vec![]),
                ..Default::default()
            }),
        ];
        for query in cases {
            let err = engine.search(&query).unwrap_err();
            assert_eq!(err.kind(), crate::core::error::ErrorKind::Contract, "{:?}", query);
        }
    }

    #[test]
    fn test_hybrid_scores_in_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            vec![
                chunk("/docs/a.txt", 0, "the quick brown fox"),
                chunk("/docs/b.txt", 0, "lorem ipsum dolor"),
            ],
        );

        let results = engine.hybrid_search("quick fox", 5, 7.0, 3.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source, "/docs/a.txt");
        assert_eq!(results[0].search_type, SearchType::Hybrid);

        let semantic = results[0].metadata["semantic_score"].as_f64().unwrap() as f32;
        let keyword = results[0].metadata["keyword_score"].as_f64().unwrap() as f32;
        assert!(keyword > 0.0);
        assert!((results[0].score - (0.7 * semantic + 0.3 * keyword)).abs() < 1e-4);
        assert_eq!(results[1].metadata["keyword_score"].as_f64(), Some(0.0));
    }

    #[test]
    fn test_filters_and_metadata_toggle() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            vec![
                chunk("/docs/notes.md", 0, "rust ownership rules"),
                chunk("/docs/code.py", 0, "rust bindings for python"),
            ],
        );

        let md_only = SearchQuery::new("rust")
            .with_type(SearchType::Keyword)
            .with_filters(SearchFilters {
                file_types: Some(vec![".MD".to_string()]),
                ..Default::default()
            });
        let results = engine.search(&md_only).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "/docs/notes.md");

        let by_pattern = SearchQuery::new("rust")
            .with_type(SearchType::Keyword)
            .with_filters(SearchFilters {
                source_pattern: Some(r"code\.py$".to_string()),
                ..Default::default()
            });
        let results = engine.search(&by_pattern).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "/docs/code.py");

        let bare = SearchQuery::new("rust")
            .with_type(SearchType::Keyword)
            .without_metadata();
        assert!(engine.search(&bare).unwrap().iter().all(|r| r.metadata.is_empty()));
    }

    #[test]
    fn test_deduplicate_identical_content() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            vec![
                chunk("/docs/a.txt", 0, "shared paragraph about compilers"),
                chunk("/docs/b.txt", 0, "shared paragraph about compilers"),
            ],
        );

        let deduped = SearchQuery::new("compilers").with_type(SearchType::Keyword);
        assert_eq!(engine.search(&deduped).unwrap().len(), 1);

        let all = deduped.keep_duplicates();
        assert_eq!(engine.search(&all).unwrap().len(), 2);
    }

    #[test]
    fn test_fuzzy_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            vec![
                chunk("/docs/a.txt", 0, "the quick brown fox"),
                chunk("/docs/b.txt", 0, "lorem ipsum dolor"),
            ],
        );

        let results = engine.fuzzy_search("The quick brown fox", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "/docs/a.txt");
        assert!(results[0].score >= 0.8);
    }

    #[test]
    fn test_statistics() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, vec![chunk("/docs/a.txt", 0, "the quick brown fox")]);

        engine.semantic_search("fox", 3).unwrap();
        engine.keyword_search("fox", 3).unwrap();
        engine.keyword_search("fox", 3).unwrap();

        let stats = engine.statistics();
        assert_eq!(stats.total_searches, 3);
        assert_eq!(stats.semantic_searches, 1);
        assert_eq!(stats.keyword_searches, 2);

        engine.reset_statistics();
        assert_eq!(engine.statistics().total_searches, 0);
    }
}
