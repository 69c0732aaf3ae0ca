use docindex::manager::{BuildOptions, FileOutcome, IndexStatus};
use docindex::storage::cache::path_key;
use docindex::{Config, DocumentParser, HashingEmbedder, IndexContext, Parser, Result, TextChunk};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn open_with(temp_dir: &TempDir, parser: Arc<dyn Parser>) -> Result<IndexContext> {
    let config = Config::new(Some(temp_dir.path().join("docindex")))?;
    IndexContext::open(config, parser, Arc::new(HashingEmbedder::new(64)))
}

fn open_context(temp_dir: &TempDir) -> Result<IndexContext> {
    open_with(temp_dir, Arc::new(DocumentParser::default()))
}

/// Reads the whole file as one chunk, and the first time around saves
/// new content right after reading, like an editor racing the indexer
struct EditDuringParse {
    edited: AtomicBool,
    replacement: &'static str,
}

impl Parser for EditDuringParse {
    fn parse(&self, path: &Path) -> Result<Vec<TextChunk>> {
        let content = fs::read_to_string(path)?;
        if !self.edited.swap(true, Ordering::SeqCst) {
            fs::write(path, self.replacement)?;
        }
        Ok(vec![TextChunk {
            content,
            chunk_id: "0".to_string(),
            source: path.to_string_lossy().into_owned(),
            metadata: Default::default(),
        }])
    }
}

fn write_corpus(temp_dir: &TempDir) -> Result<PathBuf> {
    let docs = temp_dir.path().join("docs");
    fs::create_dir_all(&docs)?;
    fs::write(docs.join("a.txt"), "the quick brown fox")?;
    fs::write(docs.join("b.txt"), "lorem ipsum dolor")?;
    Ok(docs)
}

fn key(path: &Path) -> String {
    path_key(path).unwrap()
}

fn assert_aligned(context: &IndexContext) {
    let store = context.manager().store();
    assert_eq!(store.vector_count(), store.record_count());
    if let Some(state) = store.snapshot().unwrap() {
        assert_eq!(state.records.len(), state.vector_count());
        assert!(state.records.iter().enumerate().all(|(i, r)| r.id == i as u64));
    }
}

#[test]
fn test_build_then_keyword_search() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;

    let report = context.build(&docs, &BuildOptions::default())?;
    assert_eq!(report.total_files, 2);
    assert_eq!(report.processed_files, 2);
    assert_eq!(report.total_chunks, 2);
    assert_aligned(&context);

    let results = context.engine().keyword_search("quick fox", 5)?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, key(&docs.join("a.txt")));

    let results = context.engine().keyword_search("lorem", 5)?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, key(&docs.join("b.txt")));

    Ok(())
}

#[test]
fn test_remove_document() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    let b_chunks = context
        .manager()
        .store()
        .get_document_by_source(&key(&docs.join("b.txt")))?
        .len();

    let report = context.remove(&[docs.join("a.txt")])?;
    assert_eq!(report.removed_documents, 1);
    assert_eq!(report.removed_chunks, 1);
    assert_eq!(report.remaining_chunks, b_chunks);
    assert_aligned(&context);

    assert!(context.engine().keyword_search("quick fox", 5)?.is_empty());
    assert_eq!(context.manager().list_documents().len(), 1);
    assert!(context.manager().get_document_info(&docs.join("a.txt")).is_none());

    Ok(())
}

#[test]
fn test_re_adding_unchanged_files_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    let paths = vec![docs.join("a.txt"), docs.join("b.txt")];
    let report = context.add(&paths, true)?;
    assert_eq!(report.new_chunks, 0);
    assert_eq!(report.cached_files, 2);
    assert!((report.cache_hit_rate - 1.0).abs() < f64::EPSILON);
    assert!(report
        .files
        .iter()
        .all(|f| f.outcome == FileOutcome::Unchanged));
    assert_eq!(report.total_chunks, 2);

    Ok(())
}

#[test]
fn test_touch_does_not_reembed_but_edit_does() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    let a = docs.join("a.txt");
    let file = fs::File::options().write(true).open(&a)?;
    file.set_modified(SystemTime::now() + Duration::from_secs(120))?;
    drop(file);

    let report = context.add(&[a.clone()], true)?;
    assert_eq!(report.outcome(&key(&a)), Some(&FileOutcome::Unchanged));
    assert_eq!(report.new_chunks, 0);

    fs::write(&a, "the quick brown fix")?;
    let report = context.add(&[a.clone()], true)?;
    assert_eq!(report.outcome(&key(&a)), Some(&FileOutcome::Fresh { chunks: 1 }));
    assert_eq!(report.new_chunks, 1);
    assert_eq!(report.removed_chunks, 1);
    assert_eq!(report.total_chunks, 2);
    assert_aligned(&context);

    let chunks = context.manager().store().get_document_by_source(&key(&a))?;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content, "the quick brown fix");

    Ok(())
}

#[test]
fn test_changed_file_skipped_without_update() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    let a = docs.join("a.txt");
    fs::write(&a, "a completely different sentence")?;
    let report = context.add(&[a.clone()], false)?;
    assert_eq!(report.outcome(&key(&a)), Some(&FileOutcome::Skipped));
    assert_eq!(report.new_chunks, 0);

    let chunks = context.manager().store().get_document_by_source(&key(&a))?;
    assert_eq!(chunks[0].content, "the quick brown fox");

    Ok(())
}

#[test]
fn test_unreadable_file_is_skipped() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    fs::write(docs.join("c.txt"), [0xff, 0xfe, 0xfd, 0x00, 0x80, 0x81])?;
    let context = open_context(&temp_dir)?;

    let report = context.build(&docs, &BuildOptions::default())?;
    assert_eq!(report.total_files, 3);
    assert_eq!(report.failed_files, 1);
    assert!(matches!(
        report.outcome(&key(&docs.join("c.txt"))),
        Some(FileOutcome::Failed { .. })
    ));
    assert_eq!(report.total_chunks, 2);
    assert_eq!(context.manager().status(), IndexStatus::Ready);

    Ok(())
}

#[test]
fn test_missing_file_in_add_is_reported() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;

    let missing = docs.join("missing.txt");
    let report = context.add(&[docs.join("a.txt"), missing.clone()], true)?;
    assert_eq!(report.failed_files, 1);
    assert!(matches!(report.outcome(&key(&missing)), Some(FileOutcome::Failed { .. })));
    assert_eq!(report.total_chunks, 1);
    assert_eq!(context.manager().status(), IndexStatus::Ready);

    Ok(())
}

#[test]
fn test_status_transitions() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    assert_eq!(context.manager().status(), IndexStatus::NotBuilt);

    context.build(&docs, &BuildOptions::default())?;
    assert_eq!(context.manager().status(), IndexStatus::Ready);

    context.remove(&[docs.join("a.txt"), docs.join("b.txt")])?;
    assert_eq!(context.manager().status(), IndexStatus::NotBuilt);
    assert_eq!(context.manager().store().record_count(), 0);

    let status = context.status();
    assert_eq!(status.index.indexed_documents, 0);
    assert_eq!(status.index.statistics.build_count, 1);

    Ok(())
}

#[test]
fn test_refresh_updates_and_deletes() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    assert!(context.refresh()?.outdated.is_empty());

    fs::write(docs.join("a.txt"), "the slow green turtle")?;
    fs::remove_file(docs.join("b.txt"))?;

    let report = context.refresh()?;
    assert_eq!(report.outdated.len(), 2);
    assert_eq!(report.updated_documents, 1);
    assert_eq!(report.deleted_documents, 1);
    assert_aligned(&context);

    assert!(context.manager().find_outdated().is_empty());
    assert_eq!(context.engine().keyword_search("turtle", 5)?.len(), 1);
    assert!(context.engine().keyword_search("lorem", 5)?.is_empty());

    Ok(())
}

#[test]
fn test_rebuild_from_tracked_files() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    let context = open_context(&temp_dir)?;
    context.build(&docs, &BuildOptions::default())?;

    let report = context.rebuild(None, &BuildOptions::default())?;
    assert_eq!(report.processed_files, 2);
    assert_eq!(report.cached_files, 0);
    assert_eq!(report.total_chunks, 2);
    assert_eq!(context.manager().status(), IndexStatus::Ready);

    Ok(())
}

#[test]
fn test_rebuild_with_nothing_tracked_fails() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let context = open_context(&temp_dir)?;

    let err = context.rebuild(None, &BuildOptions::default()).unwrap_err();
    assert_eq!(err.kind(), docindex::ErrorKind::Contract);

    Ok(())
}

#[test]
fn test_parallel_build_keeps_enumeration_order() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = temp_dir.path().join("many");
    fs::create_dir_all(docs.join("nested"))?;
    for i in 0..24 {
        let dir = if i % 3 == 0 { docs.join("nested") } else { docs.clone() };
        fs::write(dir.join(format!("file_{:02}.txt", i)), format!("document number {} body text", i))?;
    }
    fs::write(docs.join("ignored.bin"), "binary")?;
    let context = open_context(&temp_dir)?;

    let options = BuildOptions {
        max_workers: Some(3),
        ..Default::default()
    };
    let report = context.build(&docs, &options)?;
    assert_eq!(report.total_files, 24);
    assert_eq!(report.total_chunks, 24);

    let state = context.manager().snapshot()?.unwrap();
    let sources: Vec<&str> = state.records.iter().map(|r| r.source.as_str()).collect();
    let expected: Vec<String> = report.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(sources, expected.iter().map(String::as_str).collect::<Vec<_>>());

    let flat = BuildOptions {
        recursive: false,
        ..Default::default()
    };
    let report = context.rebuild(Some(&docs), &flat)?;
    assert_eq!(report.total_files, 16);

    Ok(())
}

#[test]
fn test_tracking_survives_reopen() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = write_corpus(&temp_dir)?;
    {
        let context = open_context(&temp_dir)?;
        context.build(&docs, &BuildOptions::default())?;
    }

    let context = open_context(&temp_dir)?;
    assert_eq!(context.manager().status(), IndexStatus::Ready);
    assert_eq!(context.manager().list_documents().len(), 2);

    let report = context.add(&[docs.join("a.txt")], true)?;
    assert_eq!(report.new_chunks, 0);
    assert_eq!(report.outcome(&key(&docs.join("a.txt"))), Some(&FileOutcome::Unchanged));

    Ok(())
}

#[test]
fn test_edit_during_parse_is_not_trusted_later() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let docs = temp_dir.path().join("docs");
    fs::create_dir_all(&docs)?;
    let file = docs.join("animals.txt");
    fs::write(&file, "old text about giraffes")?;

    let context = open_with(
        &temp_dir,
        Arc::new(EditDuringParse {
            edited: AtomicBool::new(false),
            replacement: "completely new text about elephants",
        }),
    )?;
    context.build(&docs, &BuildOptions::default())?;

    // Tracking holds the hash of the bytes that were parsed
    assert_eq!(context.manager().find_outdated(), vec![key(&file)]);

    context.manager().clear()?;
    let report = context.build(&docs, &BuildOptions::default())?;
    assert_eq!(report.outcome(&key(&file)), Some(&FileOutcome::Fresh { chunks: 1 }));

    let chunks = context.manager().store().get_document_by_source(&key(&file))?;
    assert_eq!(chunks[0].content, "completely new text about elephants");
    assert!(context.manager().find_outdated().is_empty());

    Ok(())
}
