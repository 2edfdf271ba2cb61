//! maildex - full-text search over a local archive of email messages.
//!
//! maildex walks an archive of `.eml` files and maildir folders, extracts
//! headers (and optionally bodies) from each message, and keeps them in a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index keyed by
//! `Message-ID`. Re-runs only parse files that changed since the last run.
//!
//! # Quick start
//!
//! ```no_run
//! use maildex::{DataDir, DocumentStore, Indexer, MailParserExtractor};
//! use maildex::indexer::{CancelToken, NoProgress};
//! use maildex::search::{self, SearchQuery};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let store = DocumentStore::open(&data_dir.store_dir()).unwrap();
//!
//! let indexer = Indexer::new(&store, &MailParserExtractor);
//! let result = indexer
//!     .index_incremental(
//!         "/home/me/Mail".as_ref(),
//!         false,
//!         &mut NoProgress,
//!         &CancelToken::new(),
//!     )
//!     .unwrap();
//! println!("{} indexed, {} unchanged", result.indexed, result.skipped);
//!
//! let query = SearchQuery::new("from:alice@example.com budget -draft");
//! for hit in search::execute_search(&query, &store).unwrap() {
//!     println!("{}. {} ({})", hit.rank, hit.document.subject, hit.snippet);
//! }
//! ```

pub mod data_dir;
pub mod document;
pub mod error;
pub mod extract;
pub mod file_state;
pub mod indexer;
pub mod message_id;
pub mod query;
pub mod search;
pub mod snippet;
pub mod store;
pub mod walker;

pub use data_dir::DataDir;
pub use document::EmailDocument;
pub use error::{Error, Result};
pub use extract::{MailParserExtractor, MetadataExtractor};
pub use indexer::Indexer;
pub use message_id::MessageId;
pub use store::{DocumentStore, HealthCheckMode};
