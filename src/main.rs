use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

use chrono::DateTime;
use clap::Parser;
use kdam::{Bar, BarExt, tqdm};
use maildex::{
    DataDir,
    DocumentStore,
    Error,
    HealthCheckMode,
    Indexer,
    MailParserExtractor,
    Result,
    indexer::{
        CancelToken,
        IndexingProgress,
        IndexingResult,
        NoProgress,
        ProgressSink,
    },
    query,
    search::{self, SearchQuery, SearchResult},
    store::meta_keys,
};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("MAILDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let store_dir = data_dir.store_dir();

    match &cli.command {
        Command::Index(args) => cmd_index(&store_dir, args, cli.quiet)?,
        Command::Rebuild(args) => cmd_rebuild(&store_dir, args, cli.quiet)?,
        Command::Search(args) => cmd_search(&store_dir, args)?,
        Command::Status(args) => cmd_status(&data_dir, &store_dir, args)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_index(
    store_dir: &Path,
    args: &cli::IndexArgs,
    quiet: bool,
) -> Result<()> {
    let store = if args.full {
        open_or_recreate(store_dir)?
    } else {
        DocumentStore::open(store_dir)?
    };
    let remembered = store.metadata_get(meta_keys::ARCHIVE_PATH)?;
    let archive = resolve_archive(args.archive.as_deref(), remembered)?;

    let result = run_indexer(&store, &archive, args.full, args.content, quiet)?;
    print_summary(&result);
    Ok(())
}

fn cmd_rebuild(
    store_dir: &Path,
    args: &cli::RebuildArgs,
    quiet: bool,
) -> Result<()> {
    // The archive location is read before the old store is deleted.
    let remembered = DocumentStore::open(store_dir)
        .ok()
        .and_then(|store| store.metadata_get(meta_keys::ARCHIVE_PATH).ok())
        .flatten();
    let archive = resolve_archive(args.archive.as_deref(), remembered)?;

    if !args.yes
        && !confirm(&format!(
            "Delete the index in {} and re-index {}?",
            store_dir.display(),
            archive.display()
        ))?
    {
        eprintln!("Aborted.");
        return Ok(());
    }

    let store = DocumentStore::create_fresh(store_dir)?;
    let result = run_indexer(&store, &archive, true, args.content, quiet)?;
    print_summary(&result);
    Ok(())
}

fn cmd_search(store_dir: &Path, args: &cli::SearchArgs) -> Result<()> {
    // Reject malformed queries before touching the store.
    query::parse(&args.query)?;

    let store = DocumentStore::open(store_dir)?;
    let search_query = SearchQuery::new(args.query.as_str())
        .take(args.take)
        .skip(args.skip);
    let results = search::execute_search(&search_query, &store)?;

    if args.json {
        format_json(&results, &args.query)?;
    } else {
        format_human(&results);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    data_dir: PathBuf,
    documents: u64,
    size_bytes: u64,
    archive_path: Option<String>,
    last_indexed_time: Option<i64>,
    last_run_mode: Option<String>,
    content_indexed: bool,
    /// Whether a store exists in the data directory at all.
    indexed: bool,
    check: &'static str,
    healthy: bool,
    error: Option<String>,
}

fn cmd_status(
    data_dir: &DataDir,
    store_dir: &Path,
    args: &cli::StatusArgs,
) -> Result<()> {
    let (mode, check) = if args.deep {
        (HealthCheckMode::Integrity, "integrity")
    } else {
        (HealthCheckMode::Connectivity, "connectivity")
    };

    let mut report = StatusReport {
        data_dir: data_dir.root().to_path_buf(),
        documents: 0,
        size_bytes: 0,
        archive_path: None,
        last_indexed_time: None,
        last_run_mode: None,
        content_indexed: false,
        indexed: store_dir.exists(),
        check,
        healthy: false,
        error: None,
    };

    // Opening would create an empty store as a side effect.
    match report.indexed.then(|| DocumentStore::open(store_dir)) {
        None => {}
        Some(Ok(store)) => {
            let metadata = store.metadata()?;
            report.documents = store.count()?;
            report.size_bytes = store.size_on_disk()?;
            report.archive_path =
                metadata.get(meta_keys::ARCHIVE_PATH).cloned();
            report.last_indexed_time = metadata
                .get(meta_keys::LAST_INDEXED_TIME)
                .and_then(|t| t.parse().ok());
            report.last_run_mode =
                metadata.get(meta_keys::LAST_RUN_MODE).cloned();
            report.content_indexed = metadata
                .get(meta_keys::CONTENT_INDEXED)
                .is_some_and(|v| v == "true");
            report.healthy = store.health_check(mode);
        }
        Some(Err(e)) if e.is_corrupt_index() => {
            warn!(error = %e, "store cannot be opened");
            report.error = Some(e.to_string());
        }
        Some(Err(e)) => return Err(e),
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !report.indexed {
        println!("Data directory: {}", report.data_dir.display());
        println!("Not indexed yet; run `maildex index --archive <dir>`.");
    } else {
        println!("Data directory: {}", report.data_dir.display());
        println!(
            "Archive: {}",
            report.archive_path.as_deref().unwrap_or("(not indexed yet)")
        );
        println!("Documents: {}", report.documents);
        println!("Index size: {}", format_bytes(report.size_bytes));
        println!(
            "Last indexed: {}",
            report
                .last_indexed_time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        if let Some(mode) = &report.last_run_mode {
            println!("Last run: {mode}");
        }
        println!(
            "Bodies indexed: {}",
            if report.content_indexed { "yes" } else { "no" }
        );
        println!(
            "Health ({}): {}",
            report.check,
            if report.healthy { "ok" } else { "FAILED" }
        );
        if let Some(error) = &report.error {
            println!("  {error}");
        }
    }
    Ok(())
}

/// Open the store, starting over when its contents are unreadable.
fn open_or_recreate(store_dir: &Path) -> Result<DocumentStore> {
    match DocumentStore::open(store_dir) {
        Err(e) if e.is_corrupt_index() => {
            warn!(error = %e, "store is unreadable, recreating it");
            DocumentStore::create_fresh(store_dir)
        }
        other => other,
    }
}

fn resolve_archive(
    explicit: Option<&Path>,
    remembered: Option<String>,
) -> Result<PathBuf> {
    let path = match (explicit, remembered) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => {
            return Err(Error::Config(
                "no archive directory known; pass --archive".into(),
            ));
        }
    };

    if !path.is_dir() {
        return Err(Error::Config(format!(
            "archive is not a directory: {}",
            path.display()
        )));
    }
    path.canonicalize().map_err(|e| {
        Error::Config(format!("cannot resolve path {}: {e}", path.display()))
    })
}

fn run_indexer(
    store: &DocumentStore,
    archive: &Path,
    full: bool,
    include_content: bool,
    quiet: bool,
) -> Result<IndexingResult> {
    let indexer = Indexer::new(store, &MailParserExtractor);
    let cancel = CancelToken::new();
    let mut bar = ProgressBar::default();
    let mut silent = NoProgress;
    let sink: &mut dyn ProgressSink = if quiet { &mut silent } else { &mut bar };

    let result = if full {
        indexer.index_full(archive, include_content, sink, &cancel)
    } else {
        indexer.index_incremental(archive, include_content, sink, &cancel)
    };
    bar.finish();
    result
}

/// Terminal progress bar, created on the first update once the total is
/// known.
#[derive(Default)]
struct ProgressBar {
    bar: Option<Bar>,
}

impl ProgressBar {
    fn finish(&mut self) {
        if self.bar.take().is_some() {
            eprintln!();
        }
    }
}

impl ProgressSink for ProgressBar {
    fn report(&mut self, progress: IndexingProgress) {
        if progress.total == 0 {
            return;
        }
        let bar = self
            .bar
            .get_or_insert_with(|| tqdm!(total = progress.total, desc = "Indexing"));
        let _ = bar.update_to(progress.processed);
    }
}

fn print_summary(result: &IndexingResult) {
    println!(
        "{} indexed, {} unchanged, {} failed, {} pruned in {:.1}s",
        result.indexed,
        result.skipped,
        result.errors,
        result.pruned,
        result.duration.as_secs_f64()
    );
    if result.errors > 0 {
        eprintln!("Some messages could not be read; rerun with -v for details.");
    }
}

/// Format results for human-readable terminal output.
fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for r in results {
        let doc = &r.document;
        let date = doc
            .date
            .and_then(|t| DateTime::from_timestamp(t, 0))
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "----------".to_string());
        let subject = if doc.subject.is_empty() {
            "(no subject)"
        } else {
            &doc.subject
        };
        println!("{:>3}. [{:.3}] {date} {subject}", r.rank, r.score);
        println!("     {} | {} | {}", doc.from, doc.folder, doc.file_path);
        if !r.snippet.is_empty() && r.snippet != doc.subject {
            println!("     {}", r.snippet);
        }
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchResult],
}

/// Format results as JSON output.
fn format_json(results: &[SearchResult], query: &str) -> Result<()> {
    let output = SearchOutput {
        query,
        result_count: results.len(),
        results,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
