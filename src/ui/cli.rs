use clap::{Parser, Subcommand};

/// docindex - Local document indexing and retrieval
#[derive(Parser, Debug)]
#[command(name = "docindex")]
#[command(about = "Incremental document indexing with semantic, keyword, hybrid and fuzzy search", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Custom base directory (default: ~/.docindex)
    #[arg(long, global = true)]
    pub base_dir: Option<String>,

    /// Print structured JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the index and cache directories
    Init,
    /// Index every supported file in a directory
    Index {
        /// Directory to index
        path: String,
        /// Only index these extensions (repeatable, e.g. --ext md --ext txt)
        #[arg(long = "ext")]
        extensions: Vec<String>,
        /// Do not descend into subdirectories
        #[arg(long)]
        no_recursive: bool,
        /// Number of parse workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Add files to the index
    Add {
        /// Files to add
        #[arg(required = true)]
        paths: Vec<String>,
        /// Keep existing entries for files that changed
        #[arg(long)]
        no_update: bool,
    },
    /// Remove files from the index
    Remove {
        /// Files to remove
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Reindex changed files and drop deleted ones
    Refresh,
    /// Clear the index and build it again
    Rebuild {
        /// Directory to index (default: the files already indexed)
        path: Option<String>,
    },
    /// Search the index
    Search {
        /// Search query
        query: String,
        /// semantic, keyword, hybrid or fuzzy
        #[arg(short = 't', long = "type", default_value = "semantic")]
        search_type: String,
        /// Maximum number of results to return
        #[arg(short, long)]
        limit: Option<usize>,
        /// Drop results scoring below this
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
        /// Regular expression the source path must match
        #[arg(long)]
        source_pattern: Option<String>,
        /// Allowed file extensions (repeatable)
        #[arg(long = "file-type")]
        file_types: Vec<String>,
    },
    /// Show index status and statistics
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_command() {
        let cli = Cli::try_parse_from([
            "docindex",
            "--json",
            "search",
            "quick fox",
            "--type",
            "keyword",
            "--limit",
            "3",
            "--file-type",
            "md",
            "--file-type",
            "txt",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Search {
                query,
                search_type,
                limit,
                file_types,
                ..
            } => {
                assert_eq!(query, "quick fox");
                assert_eq!(search_type, "keyword");
                assert_eq!(limit, Some(3));
                assert_eq!(file_types, vec!["md", "txt"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_command() {
        let cli = Cli::try_parse_from([
            "docindex",
            "index",
            "/notes",
            "--ext",
            "md",
            "--no-recursive",
            "--base-dir",
            "/tmp/di",
        ])
        .unwrap();

        assert_eq!(cli.base_dir.as_deref(), Some("/tmp/di"));
        match cli.command {
            Commands::Index {
                path,
                extensions,
                no_recursive,
                workers,
            } => {
                assert_eq!(path, "/notes");
                assert_eq!(extensions, vec!["md"]);
                assert!(no_recursive);
                assert_eq!(workers, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_add_requires_paths() {
        assert!(Cli::try_parse_from(["docindex", "add"]).is_err());
    }
}
