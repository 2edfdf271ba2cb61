use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    document::EmailDocument,
    error::Result,
    extract::{ExtractError, MetadataExtractor},
    file_state::FileState,
    message_id::MessageId,
    store::{DocumentStore, StoreWriter, UpsertOutcome, meta_keys},
    walker::{self, ArchiveFile, CandidateFilter, DEFAULT_PATTERNS, Discovery},
};

/// Number of files extracted and committed together.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Snapshot of how far an indexing run has got.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndexingProgress {
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
}

impl IndexingProgress {
    pub fn new(processed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / total as f64
        };
        Self {
            processed,
            total,
            percentage,
        }
    }
}

/// Receives progress updates during a run.
pub trait ProgressSink {
    fn report(&mut self, progress: IndexingProgress);
}

impl<F: FnMut(IndexingProgress)> ProgressSink for F {
    fn report(&mut self, progress: IndexingProgress) {
        self(progress)
    }
}

/// A sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: IndexingProgress) {}
}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for a finished (or cancelled) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexingResult {
    pub indexed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub pruned: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub batch_size: usize,
    /// Glob patterns selecting message files by archive-relative path.
    pub patterns: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Incremental,
    Full,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Incremental => "incremental",
            Mode::Full => "full",
        }
    }
}

/// What to do with one file, decided before extraction.
enum Step {
    Skip(MessageId),
    Extracted(std::result::Result<EmailDocument, ExtractError>),
}

/// What the store looked like when the run started.
#[derive(Default)]
struct Baseline {
    states: HashMap<String, FileState>,
    /// Committed message ids and the file each was stored from.
    indexed: HashMap<MessageId, String>,
    /// Keys of every discovered file.
    discovered: HashSet<String>,
}

impl Baseline {
    /// A file is unchanged when its recorded revision matches, it was
    /// extracted with the same body setting, and its document is still
    /// stored under a path that exists.
    fn unchanged(
        &self,
        file: &ArchiveFile,
        include_content: bool,
    ) -> Option<&MessageId> {
        let state = self.states.get(&file.key())?;
        if !state.matches(file, include_content) {
            return None;
        }
        let stored_path = self.indexed.get(&state.message_id)?;
        self.discovered
            .contains(stored_path)
            .then_some(&state.message_id)
    }
}

/// Drives extraction of an archive into a [`DocumentStore`].
pub struct Indexer<'a, E: MetadataExtractor + ?Sized> {
    store: &'a DocumentStore,
    extractor: &'a E,
    config: IndexerConfig,
}

impl<'a, E: MetadataExtractor + ?Sized> Indexer<'a, E> {
    pub fn new(store: &'a DocumentStore, extractor: &'a E) -> Self {
        Self {
            store,
            extractor,
            config: IndexerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Index new and changed files, skip unchanged ones, and prune
    /// documents whose files left the archive.
    pub fn index_incremental(
        &self,
        archive: &Path,
        include_content: bool,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<IndexingResult> {
        self.run(archive, Mode::Incremental, include_content, progress, cancel)
    }

    /// Empty the store, then extract every candidate file.
    pub fn index_full(
        &self,
        archive: &Path,
        include_content: bool,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<IndexingResult> {
        self.run(archive, Mode::Full, include_content, progress, cancel)
    }

    fn run(
        &self,
        archive: &Path,
        mode: Mode,
        include_content: bool,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<IndexingResult> {
        let started = Instant::now();
        let filter = CandidateFilter::new(&self.config.patterns)?;
        let discovery = walker::discover_files(archive, &filter)?;
        let files = &discovery.files;
        let total = files.len();
        info!(
            archive = %archive.display(),
            files = total,
            unreadable = discovery.unreadable.len(),
            mode = mode.as_str(),
            "indexing archive"
        );

        let mut writer = self.store.writer()?;
        let mut baseline = Baseline::default();
        match mode {
            Mode::Full => {
                writer.reset()?;
                writer.commit()?;
            }
            Mode::Incremental => {
                baseline.states = self.store.file_states()?.list()?;
                baseline.indexed = self.store.indexed_files()?;
            }
        }
        baseline.discovered = files.iter().map(ArchiveFile::key).collect();

        let mut result = IndexingResult {
            errors: discovery.unreadable.len(),
            ..IndexingResult::default()
        };
        // Ids backed by a discovered file; everything else gets pruned.
        let mut claimed: HashSet<MessageId> = HashSet::new();
        let mut processed = 0;
        let indexed_at = unix_now();
        let extractor = self.extractor;

        for batch in files.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let steps: Vec<Step> = batch
                .par_iter()
                .map(|file| match baseline.unchanged(file, include_content) {
                    Some(id) => Step::Skip(id.clone()),
                    None => {
                        Step::Extracted(extractor.extract(file, include_content))
                    }
                })
                .collect();

            for (file, step) in batch.iter().zip(steps) {
                match step {
                    Step::Skip(id) => {
                        result.skipped += 1;
                        claimed.insert(id);
                    }
                    Step::Extracted(Ok(mut document)) => {
                        document.indexed_at_unix = indexed_at;
                        let outcome = writer.upsert(&document)?;
                        if outcome == UpsertOutcome::Replaced {
                            debug!(
                                id = %document.message_id,
                                path = %document.file_path,
                                "replaced existing document"
                            );
                        }
                        writer.record_file(
                            file.key(),
                            FileState::of(
                                file,
                                document.message_id.clone(),
                                include_content,
                            ),
                        );
                        claimed.insert(document.message_id);
                        result.indexed += 1;
                    }
                    Step::Extracted(Err(err)) => {
                        warn!(error = %err, "skipping message");
                        result.errors += 1;
                        // Keep the last good revision of a file that broke.
                        if let Some(state) = baseline.states.get(&file.key()) {
                            claimed.insert(state.message_id.clone());
                        }
                    }
                }
                processed += 1;
                progress.report(IndexingProgress::new(processed, total));
            }

            writer.commit()?;
            debug!(processed, total, "committed batch");
        }

        if result.cancelled {
            info!(processed, total, "indexing cancelled");
            result.duration = started.elapsed();
            return Ok(result);
        }

        if mode == Mode::Incremental {
            result.pruned =
                prune_vanished(&mut writer, &baseline, &discovery, &claimed)?;
        }
        self.finish(&mut writer, archive, mode, include_content)?;
        if total == 0 {
            progress.report(IndexingProgress::new(0, 0));
        }

        result.duration = started.elapsed();
        info!(
            indexed = result.indexed,
            skipped = result.skipped,
            errors = result.errors,
            pruned = result.pruned,
            elapsed_ms = result.duration.as_millis() as u64,
            "indexing finished"
        );
        Ok(result)
    }

    /// Record the run in the store metadata, in the final commit.
    fn finish(
        &self,
        writer: &mut StoreWriter<'_>,
        archive: &Path,
        mode: Mode,
        include_content: bool,
    ) -> Result<()> {
        let archive = archive
            .canonicalize()
            .unwrap_or_else(|_| archive.to_path_buf());
        writer.set_metadata(
            meta_keys::LAST_INDEXED_TIME,
            &unix_now().to_string(),
        );
        writer.set_metadata(
            meta_keys::ARCHIVE_PATH,
            &archive.to_string_lossy(),
        );
        writer.set_metadata(
            meta_keys::CONTENT_INDEXED,
            if include_content { "true" } else { "false" },
        );
        writer.set_metadata(meta_keys::LAST_RUN_MODE, mode.as_str());
        writer.commit()
    }
}

/// Stage removal of documents no discovered file claims, and of the file
/// state of paths that left the archive. Anything stored from a path the
/// walk could not read is kept.
fn prune_vanished(
    writer: &mut StoreWriter<'_>,
    baseline: &Baseline,
    discovery: &Discovery,
    claimed: &HashSet<MessageId>,
) -> Result<usize> {
    let mut shielded: HashSet<&MessageId> = baseline
        .states
        .iter()
        .filter(|(path, _)| discovery.is_unreadable(path))
        .map(|(_, state)| &state.message_id)
        .collect();
    shielded.extend(
        baseline
            .indexed
            .iter()
            .filter(|(_, path)| discovery.is_unreadable(path))
            .map(|(id, _)| id),
    );

    let mut pruned = 0;
    let mut stale: Vec<&MessageId> = baseline
        .indexed
        .keys()
        .filter(|id| !claimed.contains(*id) && !shielded.contains(*id))
        .collect();
    stale.sort();
    for id in stale {
        if writer.prune(id)? {
            debug!(%id, "pruned document");
            pruned += 1;
        }
    }

    for path in baseline.states.keys() {
        if !baseline.discovered.contains(path) && !discovery.is_unreadable(path) {
            writer.forget_file(path.clone());
        }
    }
    Ok(pruned)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
