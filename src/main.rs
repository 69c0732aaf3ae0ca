use clap::Parser;
use docindex::cli::{Cli, Commands};
use docindex::context::IndexContext;
use docindex::engine::{SearchFilters, SearchQuery, SearchResult, SearchType};
use docindex::manager::{BatchReport, BuildOptions, FileOutcome};
use docindex::{Config, Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docindex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::from_env(cli.base_dir.as_deref().map(PathBuf::from))?;

    if let Commands::Init = cli.command {
        return handle_init(&config);
    }

    if !config.is_initialized() {
        return Err(Error::Config(
            "docindex is not initialized. Run 'docindex init' first.".to_string(),
        ));
    }
    let context = IndexContext::with_defaults(config)?;

    match &cli.command {
        Commands::Init => Ok(()),
        Commands::Index {
            path,
            extensions,
            no_recursive,
            workers,
        } => {
            let options = BuildOptions {
                extensions: (!extensions.is_empty()).then(|| extensions.clone()),
                recursive: !no_recursive,
                max_workers: *workers,
            };
            if !cli.json {
                println!("Indexing documents from: {}", path);
            }
            let report = context.build(Path::new(path), &options)?;
            print_batch(&report, cli.json)
        }
        Commands::Add { paths, no_update } => {
            let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
            let report = context.add(&paths, !no_update)?;
            print_batch(&report, cli.json)
        }
        Commands::Remove { paths } => {
            let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
            let report = context.remove(&paths)?;
            if cli.json {
                return print_json(&report);
            }
            println!("✓ Removed {} documents ({} chunks)", report.removed_documents, report.removed_chunks);
            println!("  Remaining chunks: {}", report.remaining_chunks);
            Ok(())
        }
        Commands::Refresh => {
            let report = context.refresh()?;
            if cli.json {
                return print_json(&report);
            }
            if report.outdated.is_empty() {
                println!("Index is up to date.");
                return Ok(());
            }
            println!("✓ Updated {} documents", report.updated_documents);
            println!("✓ Deleted {} documents", report.deleted_documents);
            Ok(())
        }
        Commands::Rebuild { path } => {
            let report = context.rebuild(path.as_deref().map(Path::new), &BuildOptions::default())?;
            print_batch(&report, cli.json)
        }
        Commands::Search {
            query,
            search_type,
            limit,
            min_score,
            source_pattern,
            file_types,
        } => {
            let search_type: SearchType = search_type.parse()?;
            let mut search = SearchQuery::new(query.as_str())
                .with_type(search_type)
                .with_min_score(*min_score)
                .with_filters(SearchFilters {
                    source_pattern: source_pattern.clone(),
                    file_types: (!file_types.is_empty()).then(|| file_types.clone()),
                    ..Default::default()
                });
            if let Some(limit) = limit {
                search = search.with_top_k(*limit);
            }

            let results = context.search(&search)?;
            if cli.json {
                return print_json(&results);
            }
            print_results(query, &results);
            Ok(())
        }
        Commands::Status => {
            let status = context.status();
            if cli.json {
                return print_json(&status);
            }
            let index = &status.index;
            println!("Status: {:?}", index.status);
            println!("  Documents: {}", index.indexed_documents);
            println!("  Chunks: {}", index.store.record_count);
            println!("  Model: {} (dimension {})", index.store.model_name, index.store.dimension);
            if let Some(last) = &index.last_build_time {
                println!("  Last build: {}", last);
            }
            println!(
                "  Cache: {} entries ({} valid)",
                index.cache.total_entries, index.cache.valid_entries
            );
            println!("  Searches: {}", status.search.total_searches);
            println!("  Health: {:?}", status.health.status);
            for issue in &status.health.issues {
                println!("    ✗ {}", issue);
            }
            Ok(())
        }
    }
}

fn handle_init(config: &Config) -> Result<()> {
    if config.is_initialized() {
        println!("docindex is already initialized at: {:?}", config.base_dir);
        return Ok(());
    }

    config.init()?;
    println!("✓ Created configuration directory: {:?}", config.base_dir);
    println!("✓ Created index directory: {:?}", config.index_dir);
    println!("✓ Created cache directory: {:?}", config.cache_dir);
    println!("\nNext: docindex index /path/to/documents");
    Ok(())
}

fn print_batch(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    for file in &report.files {
        match &file.outcome {
            FileOutcome::Fresh { chunks } => println!("  ✓ {} ({} chunks)", file.path, chunks),
            FileOutcome::CacheHit { chunks } => {
                println!("  ✓ {} ({} chunks, from cache)", file.path, chunks)
            }
            FileOutcome::Failed { reason } => eprintln!("  ✗ {}: {}", file.path, reason),
            FileOutcome::Unchanged | FileOutcome::Empty | FileOutcome::Skipped => {}
        }
    }

    println!("\nIndexing complete!");
    println!("  Files: {}", report.total_files);
    println!("  Processed: {}", report.processed_files);
    println!("  Cached: {} ({:.0}% hit rate)", report.cached_files, report.cache_hit_rate * 100.0);
    println!("  New chunks: {}", report.new_chunks);
    println!("  Total chunks: {}", report.total_chunks);
    if report.failed_files > 0 {
        println!("  Errors: {} files", report.failed_files);
    }
    Ok(())
}

fn print_results(query: &str, results: &[SearchResult]) {
    println!("Searching for: \"{}\"", query);
    if results.is_empty() {
        println!("\nNo results found.");
        return;
    }

    println!("\nFound {} results:", results.len());
    for result in results {
        println!("\n{}. {} (score: {:.3})", result.rank, result.source, result.score);
        if let Some(section) = result.metadata.get("section").and_then(|v| v.as_str()) {
            println!("   Context: {}", section);
        }
        println!("   {}", result.highlight.replace('\n', " "));
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
