use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tantivy::{
    DocId,
    Index,
    IndexReader,
    IndexSettings,
    IndexWriter,
    ReloadPolicy,
    Score,
    SegmentReader,
    TantivyDocument,
    TantivyError,
    Term,
    collector::{Count, DocSetCollector, TopDocs},
    directory::MmapDirectory,
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        EmptyQuery,
        Occur,
        PhraseQuery,
        Query,
        TermQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RawTokenizer,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};
use tracing::{debug, info, warn};

use crate::{
    document::EmailDocument,
    error::{Error, Result},
    file_state::{FileState, FileStateChange, FileStateDb},
    message_id::MessageId,
    query::{self, Clause, Expression, Group},
};

/// Version of the field layout written into the store metadata.
pub const SCHEMA_VERSION: u32 = 2;

/// Directory under the store root holding the tantivy segments.
const INDEX_DIR: &str = "index";

/// File under the store root holding per-file indexing state.
const FILE_STATE_DB: &str = "files.redb";

const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Relevance multiplier for subject matches.
const SUBJECT_BOOST: Score = 2.0;

/// Field names used in the schema.
pub mod fields {
    pub const MESSAGE_ID: &str = "message_id";
    pub const FILE_PATH: &str = "file_path";
    pub const SUBJECT: &str = "subject";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const CC: &str = "cc";
    pub const FROM_ADDRESS: &str = "from_address";
    pub const TO_ADDRESS: &str = "to_address";
    pub const CC_ADDRESS: &str = "cc_address";
    pub const CONTENT: &str = "content";
    pub const DATE: &str = "date";
    pub const FOLDER: &str = "folder";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const HAS_ATTACHMENTS: &str = "has_attachments";
    pub const INDEXED_AT: &str = "indexed_at";
    pub const FILE_MTIME: &str = "file_mtime";
}

/// Well-known metadata keys.
pub mod meta_keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const LAST_INDEXED_TIME: &str = "last_indexed_time";
    pub const ARCHIVE_PATH: &str = "archive_path";
    pub const CONTENT_INDEXED: &str = "content_indexed";
    pub const LAST_RUN_MODE: &str = "last_run_mode";
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub message_id: Field,
    pub file_path: Field,
    pub subject: Field,
    pub from: Field,
    pub to: Field,
    pub cc: Field,
    /// Whole lowercased addresses, one term each, for exact matches.
    pub from_address: Field,
    pub to_address: Field,
    pub cc_address: Field,
    pub content: Field,
    pub date: Field,
    pub folder: Field,
    pub size_bytes: Field,
    pub has_attachments: Field,
    pub indexed_at: Field,
    pub file_mtime: Field,
}

/// Whether an upsert created a row or replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// How thoroughly [`DocumentStore::health_check`] inspects the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckMode {
    /// Reload the reader and run a trivial query. Fast, but blind to
    /// corrupted segment files.
    Connectivity,
    /// Verify segment checksums and read back every stored document. Slow,
    /// but detects on-disk corruption.
    Integrity,
}

/// A document matched by [`DocumentStore::query`].
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub score: Score,
    pub document: EmailDocument,
}

/// The persistent document table, full-text index and metadata map.
///
/// Stored fields of a tantivy document form the document row and its
/// inverted index is the full-text projection, so a single commit always
/// updates both. The metadata map travels as the commit payload.
pub struct DocumentStore {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    root: Option<PathBuf>,
    file_states: Mutex<Option<Arc<FileStateDb>>>,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let message_id = builder.add_text_field(fields::MESSAGE_ID, STRING | STORED);
    let file_path = builder.add_text_field(fields::FILE_PATH, STRING | STORED);

    let stemmed = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let subject = builder.add_text_field(fields::SUBJECT, stemmed.clone());
    let content = builder.add_text_field(fields::CONTENT, stemmed);

    let address = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("address")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let from = builder.add_text_field(fields::FROM, address.clone());
    let to = builder.add_text_field(fields::TO, address.clone());
    let cc = builder.add_text_field(fields::CC, address);

    let exact_address = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("address_exact")
            .set_index_option(IndexRecordOption::WithFreqs),
    );
    let from_address =
        builder.add_text_field(fields::FROM_ADDRESS, exact_address.clone());
    let to_address =
        builder.add_text_field(fields::TO_ADDRESS, exact_address.clone());
    let cc_address = builder.add_text_field(fields::CC_ADDRESS, exact_address);

    let folder_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("folder")
                .set_index_option(IndexRecordOption::WithFreqs),
        )
        .set_stored();
    let folder = builder.add_text_field(fields::FOLDER, folder_opts);

    let date = builder.add_i64_field(fields::DATE, STORED | FAST);
    let size_bytes = builder.add_u64_field(fields::SIZE_BYTES, STORED);
    let has_attachments =
        builder.add_bool_field(fields::HAS_ATTACHMENTS, STORED);
    let indexed_at = builder.add_i64_field(fields::INDEXED_AT, STORED);
    let file_mtime = builder.add_u64_field(fields::FILE_MTIME, STORED);

    let schema = builder.build();
    let fields = SchemaFields {
        message_id,
        file_path,
        subject,
        from,
        to,
        cc,
        from_address,
        to_address,
        cc_address,
        content,
        date,
        folder,
        size_bytes,
        has_attachments,
        indexed_at,
        file_mtime,
    };

    (schema, fields)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);

    let address = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(100))
        .filter(LowerCaser)
        .build();
    index.tokenizers().register("address", address);

    let address_exact = TextAnalyzer::builder(RawTokenizer::default())
        .filter(LowerCaser)
        .build();
    index.tokenizers().register("address_exact", address_exact);

    let folder = TextAnalyzer::builder(RawTokenizer::default())
        .filter(LowerCaser)
        .build();
    index.tokenizers().register("folder", folder);
}

/// Errors while opening map to a storage problem when the directory itself
/// is unusable, and to corruption when its contents cannot be understood.
fn classify_open_error(err: TantivyError) -> Error {
    match err {
        TantivyError::OpenDirectoryError(_)
        | TantivyError::IoError(_)
        | TantivyError::LockFailure(..) => Error::Storage(err.to_string()),
        other => Error::CorruptIndex(other.to_string()),
    }
}

fn same_layout(found: &Schema, expected: &Schema) -> Result<bool> {
    Ok(serde_json::to_value(found)? == serde_json::to_value(expected)?)
}

impl DocumentStore {
    /// Open the store under `root`, creating it when absent.
    ///
    /// Opening is idempotent. A store written with an older schema version
    /// but the same field layout is upgraded in place; anything else that
    /// does not match fails with [`Error::CorruptIndex`].
    pub fn open(root: &Path) -> Result<Self> {
        let index_dir = root.join(INDEX_DIR);
        std::fs::create_dir_all(&index_dir).map_err(|e| {
            Error::Storage(format!("cannot create {}: {e}", index_dir.display()))
        })?;

        let (schema, fields) = build_schema();
        let dir = MmapDirectory::open(&index_dir)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let exists =
            Index::exists(&dir).map_err(|e| Error::Storage(e.to_string()))?;

        let index = if exists {
            Index::open(dir).map_err(classify_open_error)?
        } else {
            info!(path = %root.display(), "creating document store");
            Index::create(dir, schema.clone(), IndexSettings::default())
                .map_err(classify_open_error)?
        };

        Self::initialize(index, &schema, fields, Some(root.to_path_buf()))
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::initialize(index, &schema, fields, None)
    }

    /// Delete whatever store exists under `root` and create an empty one.
    ///
    /// Only the entries this store owns are removed.
    pub fn create_fresh(root: &Path) -> Result<Self> {
        let index_dir = root.join(INDEX_DIR);
        if index_dir.exists() {
            std::fs::remove_dir_all(&index_dir).map_err(|e| {
                Error::Storage(format!(
                    "cannot remove {}: {e}",
                    index_dir.display()
                ))
            })?;
        }
        let file_db = root.join(FILE_STATE_DB);
        if file_db.exists() {
            std::fs::remove_file(&file_db).map_err(|e| {
                Error::Storage(format!("cannot remove {}: {e}", file_db.display()))
            })?;
        }
        Self::open(root)
    }

    fn initialize(
        index: Index,
        expected: &Schema,
        fields: SchemaFields,
        root: Option<PathBuf>,
    ) -> Result<Self> {
        register_tokenizers(&index);
        let layout_matches = same_layout(&index.schema(), expected)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(classify_open_error)?;

        let store = Self {
            index,
            reader,
            fields,
            root,
            file_states: Mutex::new(None),
        };
        store.ensure_schema_version(layout_matches)?;
        Ok(store)
    }

    fn ensure_schema_version(&self, layout_matches: bool) -> Result<()> {
        let stored = match self.metadata_get(meta_keys::SCHEMA_VERSION)? {
            None => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::CorruptIndex(format!("unreadable schema version {raw:?}"))
            })?),
        };

        match stored {
            Some(version) if version == SCHEMA_VERSION && layout_matches => {
                Ok(())
            }
            Some(version) if version > SCHEMA_VERSION => {
                Err(Error::CorruptIndex(format!(
                    "store has schema version {version}, this build supports \
                     up to {SCHEMA_VERSION}"
                )))
            }
            _ if !layout_matches => Err(Error::CorruptIndex(
                "field layout does not match this version".into(),
            )),
            previous => {
                debug!(
                    from = ?previous,
                    to = SCHEMA_VERSION,
                    "writing schema version"
                );
                self.metadata_set(
                    meta_keys::SCHEMA_VERSION,
                    &SCHEMA_VERSION.to_string(),
                )
            }
        }
    }

    /// Get the resolved field handles.
    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Root directory of an on-disk store.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Acquire the single writer.
    ///
    /// Fails with [`Error::Storage`] when another writer (in this or
    /// another process) holds the index lock.
    pub fn writer(&self) -> Result<StoreWriter<'_>> {
        let writer: IndexWriter =
            self.index.writer(WRITER_MEMORY_BUDGET).map_err(|e| match e {
                TantivyError::LockFailure(..) => Error::Storage(format!(
                    "the index is locked by another writer: {e}"
                )),
                other => Error::Tantivy(other),
            })?;
        self.reader.reload()?;
        let metadata = self.metadata()?;
        Ok(StoreWriter {
            store: self,
            writer,
            metadata,
            staged: HashMap::new(),
            cleared: false,
            file_changes: Vec::new(),
            clear_file_states: false,
        })
    }

    /// Insert or replace a document in its own commit.
    pub fn upsert(&self, document: &EmailDocument) -> Result<UpsertOutcome> {
        let mut writer = self.writer()?;
        let outcome = writer.upsert(document)?;
        writer.commit()?;
        Ok(outcome)
    }

    /// Remove a document in its own commit. Returns whether it existed.
    pub fn prune(&self, message_id: &MessageId) -> Result<bool> {
        let mut writer = self.writer()?;
        let existed = writer.prune(message_id)?;
        if existed {
            writer.commit()?;
        }
        Ok(existed)
    }

    /// Number of live documents in the last committed snapshot.
    pub fn count(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// Whether a document with this id is committed.
    pub fn contains(&self, message_id: &MessageId) -> Result<bool> {
        let searcher = self.reader.searcher();
        let query = self.id_query(message_id);
        Ok(searcher.search(&query, &Count)? > 0)
    }

    /// Fetch a single document by id.
    pub fn get(&self, message_id: &MessageId) -> Result<Option<EmailDocument>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let query = self.id_query(message_id);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(self.from_tantivy(&doc)?))
            }
            None => Ok(None),
        }
    }

    /// Map every committed message id to the file it was extracted from.
    pub fn indexed_files(&self) -> Result<HashMap<MessageId, String>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let f = self.fields;
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;

        let mut files = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            let id = extract_text(&doc, f.message_id);
            if id.is_empty() {
                return Err(Error::CorruptIndex(
                    "document without a message id".into(),
                ));
            }
            files.insert(
                MessageId::from_stored(id),
                extract_text(&doc, f.file_path),
            );
        }
        Ok(files)
    }

    /// Run a retrieval expression, ranked by BM25 (subject matches count
    /// double) with newer messages first among equal scores.
    pub fn query(
        &self,
        expression: &Expression,
        take: usize,
        skip: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let query = self.compile(expression)?;
        if take == 0 {
            return Ok(Vec::new());
        }

        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let collector = TopDocs::with_limit(take).and_offset(skip).tweak_score(
            move |segment: &SegmentReader| {
                let dates = segment.fast_fields().i64(fields::DATE).ok();
                move |doc: DocId, score: Score| {
                    let date = dates
                        .as_ref()
                        .and_then(|column| column.first(doc))
                        .unwrap_or(i64::MIN);
                    (score, date)
                }
            },
        );
        let top_docs = searcher.search(&*query, &collector)?;

        let mut results = Vec::with_capacity(top_docs.len());
        for ((score, _date), address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            results.push(ScoredDocument {
                score,
                document: self.from_tantivy(&doc)?,
            });
        }
        Ok(results)
    }

    /// Read the whole metadata map from the last commit.
    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let metas = self
            .index
            .load_metas()
            .map_err(|e| Error::CorruptIndex(e.to_string()))?;
        match metas.payload {
            None => Ok(BTreeMap::new()),
            Some(payload) if payload.is_empty() => Ok(BTreeMap::new()),
            Some(payload) => serde_json::from_str(&payload).map_err(|e| {
                Error::CorruptIndex(format!("unreadable store metadata: {e}"))
            }),
        }
    }

    pub fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.metadata()?.remove(key))
    }

    /// Set one metadata key in its own commit.
    pub fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        let mut writer = self.writer()?;
        writer.set_metadata(key, value);
        writer.commit()
    }

    /// Bytes used by the store on disk; zero for in-memory stores.
    pub fn size_on_disk(&self) -> Result<u64> {
        match &self.root {
            Some(root) => dir_size(root),
            None => Ok(0),
        }
    }

    /// Report whether the store is usable. Never fails; problems are
    /// logged and reported as `false`.
    pub fn health_check(&self, mode: HealthCheckMode) -> bool {
        let outcome = match mode {
            HealthCheckMode::Connectivity => self.probe().map(|()| true),
            HealthCheckMode::Integrity => self.integrity_scan(),
        };
        outcome.unwrap_or_else(|e| {
            warn!(error = %e, ?mode, "health check failed");
            false
        })
    }

    fn probe(&self) -> Result<()> {
        self.reader.reload()?;
        self.reader.searcher().search(&AllQuery, &Count)?;
        self.metadata()?;
        Ok(())
    }

    fn integrity_scan(&self) -> Result<bool> {
        let corrupted = self.index.validate_checksum()?;
        if !corrupted.is_empty() {
            warn!(files = ?corrupted, "segment files failed checksum validation");
            return Ok(false);
        }
        self.metadata()?;

        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;
        let mut seen = HashSet::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            let document = self.from_tantivy(&doc)?;
            if !seen.insert(document.message_id.clone()) {
                warn!(id = %document.message_id, "duplicate document row");
                return Ok(false);
            }
        }
        Ok(seen.len() as u64 == searcher.num_docs())
    }

    /// Per-file indexing state, opened on first use so that read-only
    /// callers never touch it.
    pub fn file_states(&self) -> Result<Arc<FileStateDb>> {
        let mut slot = self
            .file_states
            .lock()
            .map_err(|_| Error::Storage("file state lock poisoned".into()))?;
        if let Some(db) = slot.as_ref() {
            return Ok(Arc::clone(db));
        }
        let db = match &self.root {
            Some(root) => FileStateDb::open(&root.join(FILE_STATE_DB))?,
            None => FileStateDb::open_in_memory()?,
        };
        let db = Arc::new(db);
        *slot = Some(Arc::clone(&db));
        Ok(db)
    }

    fn id_query(&self, message_id: &MessageId) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(self.fields.message_id, message_id.as_str()),
            IndexRecordOption::Basic,
        )
    }

    fn compile(&self, expression: &Expression) -> Result<Box<dyn Query>> {
        if !expression.groups().iter().any(Group::is_positive) {
            return Err(Error::InvalidQuery(
                "expression has no positive clause".into(),
            ));
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for group in expression.groups() {
            match group {
                Group::One(clause) if clause.negated => {
                    if let Some(query) = self.compile_clause(clause)? {
                        clauses.push((Occur::MustNot, query));
                    }
                }
                Group::One(clause) => {
                    let query = self
                        .compile_clause(clause)?
                        .unwrap_or_else(|| Box::new(EmptyQuery));
                    clauses.push((Occur::Must, query));
                }
                Group::Any(members) => {
                    if members.iter().any(|c| c.negated) {
                        return Err(Error::InvalidQuery(
                            "negated clause inside an OR group".into(),
                        ));
                    }
                    let mut should: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                    for clause in members {
                        if let Some(query) = self.compile_clause(clause)? {
                            should.push((Occur::Should, query));
                        }
                    }
                    let query: Box<dyn Query> = if should.is_empty() {
                        Box::new(EmptyQuery)
                    } else {
                        Box::new(BooleanQuery::new(should))
                    };
                    clauses.push((Occur::Must, query));
                }
            }
        }

        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    /// Build the query for one clause across its target fields. `None`
    /// when the text produces no index terms.
    fn compile_clause(&self, clause: &Clause) -> Result<Option<Box<dyn Query>>> {
        let f = self.fields;
        // A value with an `@` names a whole address, not words inside one.
        let (from, to, cc) = if is_address(&clause.text) {
            (f.from_address, f.to_address, f.cc_address)
        } else {
            (f.from, f.to, f.cc)
        };
        let targets: Vec<(Field, Score)> = match clause.field {
            Some(query::Field::From) => vec![(from, 1.0)],
            Some(query::Field::To) => vec![(to, 1.0)],
            Some(query::Field::Cc) => vec![(cc, 1.0)],
            Some(query::Field::Subject) => vec![(f.subject, 1.0)],
            Some(query::Field::Folder) => vec![(f.folder, 1.0)],
            None => vec![
                (f.subject, SUBJECT_BOOST),
                (from, 1.0),
                (to, 1.0),
                (cc, 1.0),
                (f.content, 1.0),
            ],
        };

        let mut per_field: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for (field, boost) in targets {
            if let Some(query) = self.field_query(field, &clause.text)? {
                let query: Box<dyn Query> = if boost == 1.0 {
                    query
                } else {
                    Box::new(BoostQuery::new(query, boost))
                };
                per_field.push((Occur::Should, query));
            }
        }

        Ok(match per_field.len() {
            0 => None,
            1 => per_field.pop().map(|(_, query)| query),
            _ => Some(Box::new(BooleanQuery::new(per_field))),
        })
    }

    /// Analyze `text` with the field's tokenizer: one token becomes a term
    /// query, several become a phrase query.
    fn field_query(
        &self,
        field: Field,
        text: &str,
    ) -> Result<Option<Box<dyn Query>>> {
        let mut analyzer = self.index.tokenizer_for_field(field)?;
        let mut stream = analyzer.token_stream(text);
        let mut terms: Vec<(usize, Term)> = Vec::new();
        while stream.advance() {
            let token = stream.token();
            terms.push((token.position, Term::from_field_text(field, &token.text)));
        }

        Ok(match terms.len() {
            0 => None,
            1 => terms.pop().map(|(_, term)| {
                Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs))
                    as Box<dyn Query>
            }),
            _ => Some(Box::new(PhraseQuery::new_with_offset(terms))),
        })
    }

    fn to_tantivy(&self, document: &EmailDocument) -> TantivyDocument {
        let f = self.fields;
        let mut doc = TantivyDocument::default();
        doc.add_text(f.message_id, document.message_id.as_str());
        doc.add_text(f.file_path, &document.file_path);
        doc.add_text(f.subject, &document.subject);
        doc.add_text(f.from, &document.from);
        doc.add_text(f.to, &document.to);
        doc.add_text(f.cc, &document.cc);
        for (field, header) in [
            (f.from_address, &document.from),
            (f.to_address, &document.to),
            (f.cc_address, &document.cc),
        ] {
            for address in addresses_in(header) {
                doc.add_text(field, address);
            }
        }
        doc.add_text(f.folder, &document.folder);
        if let Some(content) = &document.content {
            doc.add_text(f.content, content);
        }
        if let Some(date) = document.date {
            doc.add_i64(f.date, date);
        }
        doc.add_u64(f.size_bytes, document.size_bytes);
        doc.add_bool(f.has_attachments, document.has_attachments);
        doc.add_i64(f.indexed_at, document.indexed_at_unix);
        doc.add_u64(f.file_mtime, document.file_mtime);
        doc
    }

    fn from_tantivy(&self, doc: &TantivyDocument) -> Result<EmailDocument> {
        let f = self.fields;
        let id = extract_text(doc, f.message_id);
        if id.is_empty() {
            return Err(Error::CorruptIndex(
                "document without a message id".into(),
            ));
        }
        Ok(EmailDocument {
            message_id: MessageId::from_stored(id),
            file_path: extract_text(doc, f.file_path),
            subject: extract_text(doc, f.subject),
            from: extract_text(doc, f.from),
            to: extract_text(doc, f.to),
            cc: extract_text(doc, f.cc),
            date: doc.get_first(f.date).and_then(|v| v.as_i64()),
            folder: extract_text(doc, f.folder),
            size_bytes: extract_u64(doc, f.size_bytes),
            has_attachments: doc
                .get_first(f.has_attachments)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            content: doc
                .get_first(f.content)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            indexed_at_unix: doc
                .get_first(f.indexed_at)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            file_mtime: extract_u64(doc, f.file_mtime),
        })
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// The single writer of a [`DocumentStore`].
///
/// Changes are staged until [`StoreWriter::commit`], which publishes
/// documents, their full-text entries and the metadata map in one step.
/// Dropping the writer discards everything staged since the last commit.
pub struct StoreWriter<'a> {
    store: &'a DocumentStore,
    writer: IndexWriter,
    metadata: BTreeMap<String, String>,
    /// Ids touched since the last commit: `true` if present afterwards.
    staged: HashMap<MessageId, bool>,
    /// A reset is staged, so the committed snapshot no longer counts.
    cleared: bool,
    file_changes: Vec<FileStateChange>,
    clear_file_states: bool,
}

impl StoreWriter<'_> {
    fn exists(&self, message_id: &MessageId) -> Result<bool> {
        match self.staged.get(message_id) {
            Some(&present) => Ok(present),
            None if self.cleared => Ok(false),
            None => self.store.contains(message_id),
        }
    }

    /// Stage an insert-or-replace keyed by message id.
    pub fn upsert(&mut self, document: &EmailDocument) -> Result<UpsertOutcome> {
        let existed = self.exists(&document.message_id)?;
        let term = Term::from_field_text(
            self.store.fields.message_id,
            document.message_id.as_str(),
        );
        self.writer.delete_term(term);
        self.writer.add_document(self.store.to_tantivy(document))?;
        self.staged.insert(document.message_id.clone(), true);

        Ok(if existed {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Stage a removal. Returns whether the document existed.
    pub fn prune(&mut self, message_id: &MessageId) -> Result<bool> {
        if !self.exists(message_id)? {
            return Ok(false);
        }
        let term = Term::from_field_text(
            self.store.fields.message_id,
            message_id.as_str(),
        );
        self.writer.delete_term(term);
        self.staged.insert(message_id.clone(), false);
        Ok(true)
    }

    /// Stage removal of every document, all file state and every metadata
    /// key except the schema version.
    pub fn reset(&mut self) -> Result<()> {
        self.writer.delete_all_documents()?;
        self.staged.clear();
        self.cleared = true;
        self.file_changes.clear();
        self.clear_file_states = true;
        self.metadata.retain(|key, _| key == meta_keys::SCHEMA_VERSION);
        Ok(())
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Remember which revision of a file produced its document. Written
    /// after the documents of the same commit.
    pub fn record_file(&mut self, path: String, state: FileState) {
        self.file_changes.push(FileStateChange::Record(path, state));
    }

    pub fn forget_file(&mut self, path: String) {
        self.file_changes.push(FileStateChange::Forget(path));
    }

    /// Publish everything staged since the last commit.
    pub fn commit(&mut self) -> Result<()> {
        let payload = serde_json::to_string(&self.metadata)?;
        let mut prepared = self.writer.prepare_commit()?;
        prepared.set_payload(&payload);
        prepared.commit()?;
        self.store.reader.reload()?;

        if self.clear_file_states || !self.file_changes.is_empty() {
            let db = self.store.file_states()?;
            db.apply(self.clear_file_states, &self.file_changes)?;
        }

        self.staged.clear();
        self.cleared = false;
        self.file_changes.clear();
        self.clear_file_states = false;
        Ok(())
    }

    /// Discard everything staged since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        self.writer.rollback()?;
        self.metadata = self.store.metadata()?;
        self.staged.clear();
        self.cleared = false;
        self.file_changes.clear();
        self.clear_file_states = false;
        Ok(())
    }
}

fn is_address(text: &str) -> bool {
    let text = text.trim();
    !text.contains(char::is_whitespace) && text.contains('@')
}

/// Bare addresses in a formatted header such as
/// `Alice <alice@example.com>, bob@example.com`.
fn addresses_in(header: &str) -> impl Iterator<Item = &str> {
    header
        .split(|c: char| {
            c.is_whitespace() || matches!(c, ',' | ';' | '<' | '>' | '"')
        })
        .filter(|part| part.contains('@'))
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{document::fixtures::email, query::parse};

    fn id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    fn search(store: &DocumentStore, q: &str) -> Vec<ScoredDocument> {
        store.query(&parse(q).unwrap(), 100, 0).unwrap()
    }

    #[test]
    fn fresh_store_is_healthy_and_versioned() {
        let store = DocumentStore::open_in_ram().unwrap();
        assert!(store.health_check(HealthCheckMode::Connectivity));
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(
            store.metadata_get(meta_keys::SCHEMA_VERSION).unwrap(),
            Some(SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn upsert_twice_keeps_one_row() {
        let store = DocumentStore::open_in_ram().unwrap();
        let first = email("a@x", "Budget draft", "alice@example.com");
        assert_eq!(store.upsert(&first).unwrap(), UpsertOutcome::Inserted);

        let mut second = first.clone();
        second.subject = "Budget final".to_string();
        assert_eq!(store.upsert(&second).unwrap(), UpsertOutcome::Replaced);

        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(&id("a@x")).unwrap().unwrap();
        assert_eq!(stored.subject, "Budget final");
        assert!(search(&store, "draft").is_empty());
    }

    #[test]
    fn upsert_within_one_commit_reports_replacement() {
        let store = DocumentStore::open_in_ram().unwrap();
        let doc = email("a@x", "Hello", "alice@example.com");

        let mut writer = store.writer().unwrap();
        assert_eq!(writer.upsert(&doc).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(writer.upsert(&doc).unwrap(), UpsertOutcome::Replaced);
        writer.commit().unwrap();
        drop(writer);

        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn prune_removes_document_and_text() {
        let store = DocumentStore::open_in_ram().unwrap();
        store
            .upsert(&email("a@x", "Budget", "alice@example.com"))
            .unwrap();

        assert!(store.prune(&id("a@x")).unwrap());
        assert!(!store.prune(&id("a@x")).unwrap());
        assert_eq!(store.count().unwrap(), 0);
        assert!(search(&store, "budget").is_empty());
    }

    #[test]
    fn uncommitted_changes_are_invisible_and_dropped() {
        let store = DocumentStore::open_in_ram().unwrap();
        {
            let mut writer = store.writer().unwrap();
            writer
                .upsert(&email("a@x", "Hello", "alice@example.com"))
                .unwrap();
            assert_eq!(store.count().unwrap(), 0);
        }
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn rollback_discards_staged_changes() {
        let store = DocumentStore::open_in_ram().unwrap();
        let mut writer = store.writer().unwrap();
        writer
            .upsert(&email("a@x", "Hello", "alice@example.com"))
            .unwrap();
        writer.set_metadata("k", "v");
        writer.rollback().unwrap();
        writer.commit().unwrap();
        drop(writer);

        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.metadata_get("k").unwrap(), None);
    }

    #[test]
    fn second_writer_is_a_storage_error() {
        let store = DocumentStore::open_in_ram().unwrap();
        let _writer = store.writer().unwrap();
        assert!(matches!(store.writer(), Err(Error::Storage(_))));
    }

    #[test]
    fn reset_drops_everything_but_schema_version() {
        let store = DocumentStore::open_in_ram().unwrap();
        store
            .upsert(&email("a@x", "Hello", "alice@example.com"))
            .unwrap();
        store.metadata_set("archive_path", "/mail").unwrap();

        let mut writer = store.writer().unwrap();
        writer.reset().unwrap();
        assert_eq!(
            writer
                .upsert(&email("a@x", "Hello", "alice@example.com"))
                .unwrap(),
            UpsertOutcome::Inserted
        );
        writer.commit().unwrap();
        drop(writer);

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.metadata_get("archive_path").unwrap(), None);
        assert!(store.metadata_get(meta_keys::SCHEMA_VERSION).unwrap().is_some());
    }

    #[test]
    fn field_scoped_and_negated_queries() {
        let store = DocumentStore::open_in_ram().unwrap();
        let mut budget = email("1@x", "Q3 budget", "Alice <alice@example.com>");
        budget.content = Some("Please review the budget numbers".into());
        let mut draft = email("2@x", "Budget draft", "Bob <bob@example.com>");
        draft.content = Some("Early budget notes".into());
        let other = email("3@x", "Lunch", "Alice <alice@example.com>");
        for doc in [&budget, &draft, &other] {
            store.upsert(doc).unwrap();
        }

        let hits = search(&store, "from:alice@example.com budget");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.message_id, id("1@x"));

        let hits = search(&store, "budget -draft");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.message_id, id("1@x"));

        let hits = search(&store, "subject:\"budget draft\"");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.message_id, id("2@x"));

        let hits = search(&store, "lunch OR draft");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn address_scope_matches_whole_addresses_only() {
        let store = DocumentStore::open_in_ram().unwrap();
        for (n, from) in [
            "Alice <alice@example.com>",
            "mallory.alice@example.com",
            "alice@example.com.evil.org",
            "Alice Smith <ALICE@Example.com>, carol@example.com",
        ]
        .into_iter()
        .enumerate()
        {
            store
                .upsert(&email(&format!("{n}@x"), "budget", from))
                .unwrap();
        }

        let mut ids: Vec<String> = search(&store, "from:alice@example.com budget")
            .into_iter()
            .map(|hit| hit.document.message_id.as_str().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["0@x", "3@x"]);

        // Name fragments still match words.
        assert_eq!(search(&store, "from:smith").len(), 1);
        assert_eq!(search(&store, "from:alice").len(), 4);
        assert_eq!(search(&store, "carol@example.com").len(), 1);
        assert_eq!(search(&store, "to:team@example.com").len(), 4);
    }

    #[test]
    fn phrase_requires_adjacent_words() {
        let store = DocumentStore::open_in_ram().unwrap();
        store
            .upsert(&email("1@x", "hello big world", "a@example.com"))
            .unwrap();

        assert!(search(&store, "\"hello world\"").is_empty());
        assert_eq!(search(&store, "\"big world\"").len(), 1);
    }

    #[test]
    fn folder_scope_matches_whole_name_case_insensitively() {
        let store = DocumentStore::open_in_ram().unwrap();
        let mut archived = email("1@x", "Report", "a@example.com");
        archived.folder = "Archive/2023".into();
        store.upsert(&archived).unwrap();
        store.upsert(&email("2@x", "Report", "a@example.com")).unwrap();

        let hits = search(&store, "report folder:archive/2023");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.folder, "Archive/2023");
        assert!(search(&store, "report folder:archive").is_empty());
    }

    #[test]
    fn subject_matches_outrank_body_matches() {
        let store = DocumentStore::open_in_ram().unwrap();
        let mut body_only = email("1@x", "Numbers", "a@example.com");
        body_only.content = Some("the budget is attached".into());
        store.upsert(&body_only).unwrap();
        store.upsert(&email("2@x", "Budget", "a@example.com")).unwrap();

        let hits = search(&store, "budget");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.message_id, id("2@x"));
    }

    #[test]
    fn equal_scores_order_by_date_descending() {
        let store = DocumentStore::open_in_ram().unwrap();
        for (raw, date) in [("old@x", Some(100)), ("new@x", Some(300)), ("none@x", None), ("mid@x", Some(200))] {
            let mut doc = email(raw, "Status update", "a@example.com");
            doc.date = date;
            store.upsert(&doc).unwrap();
        }

        let order: Vec<String> = search(&store, "status")
            .into_iter()
            .map(|hit| hit.document.message_id.as_str().to_string())
            .collect();
        assert_eq!(order, vec!["new@x", "mid@x", "old@x", "none@x"]);
    }

    #[test]
    fn take_and_skip_page_through_results() {
        let store = DocumentStore::open_in_ram().unwrap();
        for n in 0..5 {
            let mut doc = email(&format!("{n}@x"), "Weekly report", "a@example.com");
            doc.date = Some(n);
            store.upsert(&doc).unwrap();
        }
        let expr = parse("report").unwrap();

        let page = store.query(&expr, 2, 1).unwrap();
        let ids: Vec<_> = page
            .iter()
            .map(|hit| hit.document.message_id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["3@x", "2@x"]);
        assert!(store.query(&expr, 0, 0).unwrap().is_empty());
        assert!(store.query(&expr, 10, 10).unwrap().is_empty());
    }

    #[test]
    fn stored_fields_roundtrip() {
        let store = DocumentStore::open_in_ram().unwrap();
        let mut doc = email("a@x", "Hello", "alice@example.com");
        doc.cc = "carol@example.com".into();
        doc.date = Some(1_700_000_123);
        doc.has_attachments = true;
        doc.content = Some("body text".into());
        doc.size_bytes = 4096;
        store.upsert(&doc).unwrap();

        assert_eq!(store.get(&id("a@x")).unwrap(), Some(doc));
        assert_eq!(store.get(&id("missing@x")).unwrap(), None);
    }

    #[test]
    fn indexed_files_maps_ids_to_paths() {
        let store = DocumentStore::open_in_ram().unwrap();
        store.upsert(&email("a@x", "One", "a@example.com")).unwrap();
        store.upsert(&email("b@x", "Two", "a@example.com")).unwrap();

        let files = store.indexed_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[&id("a@x")], "a@x.eml");
    }

    #[test]
    fn metadata_set_and_get() {
        let store = DocumentStore::open_in_ram().unwrap();
        assert_eq!(store.metadata_get("last_indexed_time").unwrap(), None);
        store.metadata_set("last_indexed_time", "1700000000").unwrap();
        store.metadata_set("last_indexed_time", "1700000500").unwrap();
        assert_eq!(
            store.metadata_get("last_indexed_time").unwrap(),
            Some("1700000500".to_string())
        );
    }

    #[test]
    fn integrity_check_passes_on_healthy_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(tmp.path()).unwrap();
        store.upsert(&email("a@x", "Hello", "a@example.com")).unwrap();
        assert!(store.health_check(HealthCheckMode::Integrity));
        assert!(store.health_check(HealthCheckMode::Connectivity));
    }

    #[test]
    fn integrity_check_detects_damaged_segment() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let tmp = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(tmp.path()).unwrap();
        let mut writer = store.writer().unwrap();
        for n in 0..3 {
            writer
                .upsert(&email(&format!("{n}@x"), "Damaged", "a@example.com"))
                .unwrap();
        }
        writer.commit().unwrap();
        drop(writer);

        let store_file = std::fs::read_dir(tmp.path().join(INDEX_DIR))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| path.extension().is_some_and(|ext| ext == "store"))
            .unwrap();
        // Flip the first byte in place; the file keeps its length.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&store_file)
            .unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        assert!(store.health_check(HealthCheckMode::Connectivity));
        assert!(!store.health_check(HealthCheckMode::Integrity));
    }

    #[test]
    fn disk_persistence_and_idempotent_open() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(tmp.path()).unwrap();
            store.upsert(&email("a@x", "Persistent", "a@example.com")).unwrap();
            store.metadata_set("archive_path", "/mail").unwrap();
        }
        {
            let store = DocumentStore::open(tmp.path()).unwrap();
            assert_eq!(store.count().unwrap(), 1);
            assert_eq!(
                store.metadata_get("archive_path").unwrap(),
                Some("/mail".to_string())
            );
            assert!(store.size_on_disk().unwrap() > 0);
        }
    }

    #[test]
    fn newer_schema_version_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(tmp.path()).unwrap();
            store
                .metadata_set(
                    meta_keys::SCHEMA_VERSION,
                    &(SCHEMA_VERSION + 1).to_string(),
                )
                .unwrap();
        }
        let err = DocumentStore::open(tmp.path()).unwrap_err();
        assert!(err.is_corrupt_index());
    }

    #[test]
    fn missing_schema_version_is_migrated() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(tmp.path()).unwrap();
            let mut writer = store.writer().unwrap();
            writer.metadata.clear();
            writer.commit().unwrap();
        }
        let store = DocumentStore::open(tmp.path()).unwrap();
        assert_eq!(
            store.metadata_get(meta_keys::SCHEMA_VERSION).unwrap(),
            Some(SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn unreadable_meta_is_corrupt_and_create_fresh_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(tmp.path()).unwrap();
            store.upsert(&email("a@x", "Hello", "a@example.com")).unwrap();
        }
        std::fs::write(tmp.path().join(INDEX_DIR).join("meta.json"), "{ nope")
            .unwrap();

        let err = DocumentStore::open(tmp.path()).unwrap_err();
        assert!(err.is_corrupt_index(), "unexpected error: {err}");

        let store = DocumentStore::create_fresh(tmp.path()).unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.health_check(HealthCheckMode::Integrity));
    }
}
