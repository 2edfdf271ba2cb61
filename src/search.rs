use serde::Serialize;
use tracing::debug;

use crate::{
    document::EmailDocument,
    error::Result,
    query,
    snippet::{self, DEFAULT_SNIPPET_MAX_CHARS},
    store::DocumentStore,
};

/// Default number of results per page.
pub const DEFAULT_TAKE: usize = 100;

/// A user search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub raw_text: String,
    pub take: usize,
    pub skip: usize,
}

impl SearchQuery {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            take: DEFAULT_TAKE,
            skip: 0,
        }
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = take;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// A ranked match with its excerpt.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// 1-based position across all pages.
    pub rank: usize,
    pub score: f32,
    #[serde(flatten)]
    pub document: EmailDocument,
    pub snippet: String,
}

/// Run a search with the default snippet length.
pub fn execute_search(
    query: &SearchQuery,
    store: &DocumentStore,
) -> Result<Vec<SearchResult>> {
    execute_search_with(query, store, DEFAULT_SNIPPET_MAX_CHARS)
}

/// Parse `query`, run it against the store and attach snippets of at most
/// `snippet_max_chars` characters.
///
/// The query is parsed before the store is touched, so a malformed query
/// fails with [`Error::InvalidQuery`](crate::Error::InvalidQuery) even when
/// the store is unusable.
pub fn execute_search_with(
    query: &SearchQuery,
    store: &DocumentStore,
    snippet_max_chars: usize,
) -> Result<Vec<SearchResult>> {
    let expression = query::parse(&query.raw_text)?;
    debug!(query = %expression, take = query.take, skip = query.skip, "search");

    let terms = expression.highlight_terms();
    let terms: Vec<&str> = terms.iter().map(String::as_str).collect();

    let hits = store.query(&expression, query.take, query.skip)?;
    Ok(hits
        .into_iter()
        .enumerate()
        .map(|(i, hit)| {
            let snippet = snippet::generate(
                hit.document.snippet_source(),
                &terms,
                snippet_max_chars,
            );
            SearchResult {
                rank: query.skip + i + 1,
                score: hit.score,
                document: hit.document,
                snippet,
            }
        })
        .collect())
}
