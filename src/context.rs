use crate::core::config::Config;
use crate::core::error::Result;
use crate::indexing::manager::{
    AddReport, BuildOptions, BuildReport, HealthReport, IndexManager, RefreshReport, RemoveReport,
    StatusReport,
};
use crate::indexing::parser::{DocumentParser, Parser};
use crate::search::engine::{SearchEngine, SearchQuery, SearchResult, SearchStatistics};
use crate::search::model::{Embedder, HashingEmbedder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Status of the manager together with search statistics
#[derive(Debug, Clone, Serialize)]
pub struct ContextStatus {
    #[serde(flatten)]
    pub index: StatusReport,
    pub search: SearchStatistics,
    pub health: HealthReport,
}

/// One index: its configuration, manager and search engine.
///
/// Several contexts over different base directories can live in one process.
pub struct IndexContext {
    config: Config,
    manager: Arc<IndexManager>,
    search: SearchEngine,
}

impl IndexContext {
    pub fn open(config: Config, parser: Arc<dyn Parser>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        config.init()?;

        let manager = Arc::new(IndexManager::open(&config, parser, embedder));
        let search = SearchEngine::new(Arc::clone(manager.store()), config.search.clone());
        Ok(Self {
            config,
            manager,
            search,
        })
    }

    /// Open with the built-in parser and hashing embedder
    pub fn with_defaults(config: Config) -> Result<Self> {
        let parser = Arc::new(DocumentParser::from_settings(&config.indexing));
        Self::open(config, parser, Arc::new(HashingEmbedder::default()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn engine(&self) -> &SearchEngine {
        &self.search
    }

    pub fn build(&self, directory: &Path, options: &BuildOptions) -> Result<BuildReport> {
        self.manager.build_from_directory(directory, options)
    }

    pub fn add(&self, paths: &[PathBuf], update_existing: bool) -> Result<AddReport> {
        self.manager.add_documents(paths, update_existing)
    }

    pub fn remove(&self, paths: &[PathBuf]) -> Result<RemoveReport> {
        self.manager.remove_documents(paths)
    }

    pub fn refresh(&self) -> Result<RefreshReport> {
        self.manager.refresh()
    }

    pub fn rebuild(&self, directory: Option<&Path>, options: &BuildOptions) -> Result<BuildReport> {
        self.manager.rebuild(directory, options)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        self.search.search(query)
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            index: self.manager.get_status(),
            search: self.search.statistics(),
            health: self.manager.health_check(),
        }
    }
}
