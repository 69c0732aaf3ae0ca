// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
}

// Persistence: fingerprint cache and vector index
pub mod storage {
    pub mod cache;
    pub mod flat;
    pub mod vectors;
}

// Indexing pipeline
pub mod indexing {
    pub mod discovery;
    pub mod manager;
    pub mod parser;
    pub mod splitter;
}

// Search & embeddings
pub mod search {
    pub mod engine;
    pub mod model;
    pub mod scoring;
}

// User interfaces
pub mod ui {
    pub mod cli;
}

pub mod context;

// Re-export commonly used types
pub use core::config::Config;
pub use core::error::{Error, ErrorKind, Result};
pub use context::IndexContext;
pub use indexing::{manager, parser};
pub use indexing::manager::{BuildOptions, FileOutcome, IndexManager, IndexStatus};
pub use indexing::parser::{DocumentParser, Parser, TextChunk};
pub use search::engine;
pub use search::engine::{SearchEngine, SearchFilters, SearchQuery, SearchResult, SearchType};
pub use search::model::{Embedder, HashingEmbedder};
pub use storage::cache::{calculate_file_hash, get_file_modified_time, FileIndexCache};
pub use storage::vectors::VectorStore;
pub use ui::cli;
