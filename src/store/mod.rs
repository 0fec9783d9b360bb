//! Read and bulk-write access to the document store.
//!
//! - [`DocumentStore`]: the two primitive calls a backend must provide (one page of a query, one
//!   bulk update request)
//! - [`StoreClient`]: drains paged queries lazily with the shared [`RetryPolicy`] applied per page
//! - [`opensearch::OpenSearchStore`]: HTTP backend (scroll search + `_bulk`)
//! - [`memory::InMemoryStore`]: in-process backend with failure injection, used by tests

pub mod memory;
pub mod opensearch;

pub use memory::InMemoryStore;
pub use opensearch::OpenSearchStore;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::VecDeque, future::Future, sync::Arc};

use crate::{
    document::{
        coerce_scalar, Document, FIELD_ARCHIVE_STATUS, FIELD_LID, FIELD_PRODUCT_CLASS, FIELD_VID,
        PRODUCT_CLASS_BUNDLE, PRODUCT_CLASS_COLLECTION, PUBLISHED_ARCHIVE_STATUSES,
    },
    error::SweepersError,
    reconcile::WriteOperation,
    retry::{retry_async, RetryPolicy},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Product documents.
    Registry,
    /// Collection membership documents.
    Refs,
}

/// Store-side document filter. Backends translate it to their own query language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    All,
    /// `field` equals one of `values`.
    FieldIn { field: String, values: Vec<String> },
    /// `field` equals none of `values`.
    FieldNotIn { field: String, values: Vec<String> },
    And(Vec<Filter>),
}

impl Filter {
    pub fn field_in<I, S>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::FieldIn {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluates the filter against a document source, the way the store would.
    pub fn matches(&self, source: &Map<String, Value>) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldIn { field, values } => field_strings(source, field)
                .iter()
                .any(|v| values.iter().any(|want| want == v)),
            Filter::FieldNotIn { field, values } => !field_strings(source, field)
                .iter()
                .any(|v| values.iter().any(|want| want == v)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(source)),
        }
    }

    /// OpenSearch query DSL for this filter.
    pub fn to_query_dsl(&self) -> Value {
        match self {
            Filter::All => json!({"match_all": {}}),
            Filter::FieldIn { field, values } => {
                json!({"bool": {"filter": [{"terms": {field: values}}]}})
            }
            Filter::FieldNotIn { field, values } => {
                json!({"bool": {"must_not": [{"terms": {field: values}}]}})
            }
            Filter::And(filters) => json!({
                "bool": {"must": filters.iter().map(Filter::to_query_dsl).collect::<Vec<_>>()}
            }),
        }
    }
}

fn field_strings<'a>(source: &'a Map<String, Value>, field: &str) -> Vec<&'a str> {
    match source.get(field) {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => vec![],
    }
}

/// Sort key used by backends: the scalar string form of a field, missing sorting first.
pub fn sort_key(source: &Map<String, Value>, field: &str) -> Option<String> {
    let value = source.get(field)?;
    match coerce_scalar(value).ok().flatten()? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub index: IndexKind,
    pub filter: Filter,
    /// Ascending sort fields, most significant first.
    pub sort: Vec<String>,
    /// Source fields to return. `None` returns the whole document.
    pub includes: Option<Vec<String>>,
}

impl Query {
    pub fn new(index: IndexKind, filter: Filter) -> Self {
        Query {
            index,
            filter,
            sort: vec![],
            includes: None,
        }
    }

    pub fn sorted_by<I: IntoIterator<Item = &'static str>>(mut self, fields: I) -> Self {
        self.sort = fields.into_iter().map(str::to_string).collect();
        self
    }

    pub fn including<I: IntoIterator<Item = &'static str>>(mut self, fields: I) -> Self {
        self.includes = Some(fields.into_iter().map(str::to_string).collect());
        self
    }

    pub fn bundles() -> Self {
        Query::new(
            IndexKind::Registry,
            Filter::field_in(FIELD_PRODUCT_CLASS, [PRODUCT_CLASS_BUNDLE]),
        )
    }

    pub fn collections() -> Self {
        Query::new(
            IndexKind::Registry,
            Filter::field_in(FIELD_PRODUCT_CLASS, [PRODUCT_CLASS_COLLECTION]),
        )
    }

    pub fn non_aggregates() -> Self {
        Query::new(
            IndexKind::Registry,
            Filter::FieldNotIn {
                field: FIELD_PRODUCT_CLASS.to_string(),
                values: vec![
                    PRODUCT_CLASS_BUNDLE.to_string(),
                    PRODUCT_CLASS_COLLECTION.to_string(),
                ],
            },
        )
    }

    /// Every published document, grouped by LID (store-side sort) and then by version.
    pub fn published_by_lid() -> Self {
        Query::new(
            IndexKind::Registry,
            Filter::field_in(FIELD_ARCHIVE_STATUS, PUBLISHED_ARCHIVE_STATUSES),
        )
        .sorted_by([FIELD_LID, FIELD_VID])
    }

    pub fn collection_members() -> Self {
        Query::new(IndexKind::Refs, Filter::All)
    }
}

/// Opaque continuation handed back by a backend, plus the running count of served hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub cursor: String,
    pub served: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub documents: Vec<Document>,
    /// `None` marks the end of the stream.
    pub next: Option<PageToken>,
    pub total_hits: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub status: u16,
    pub kind: String,
    pub reason: String,
}

impl ItemError {
    pub fn new(status: u16, kind: impl Into<String>, reason: impl Into<String>) -> Self {
        ItemError {
            status,
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Conflicts, throttling and server errors may succeed on a later attempt. Other client
    /// errors (missing document, mapping failures) reflect bad data and never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 0 | 409 | 429) || self.status >= 500
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Applied,
    Failed(ItemError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
}

pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch one page of `query`. `token` is `None` for the first page.
    fn fetch_page(
        &self,
        query: &Query,
        page_size: usize,
        token: Option<&PageToken>,
    ) -> impl Future<Output = Result<Page, SweepersError>> + Send;

    /// Release server-side cursor state once a read is drained.
    fn release(
        &self,
        _token: PageToken,
    ) -> impl Future<Output = Result<(), SweepersError>> + Send {
        async { Ok(()) }
    }

    /// Submit partial-document updates. `Err` means the batch as a whole could not be submitted;
    /// otherwise one outcome is returned per operation.
    fn bulk_update(
        &self,
        operations: &[WriteOperation],
    ) -> impl Future<Output = Result<Vec<ItemOutcome>, SweepersError>> + Send;
}

/// Paging + retry wrapper over a [DocumentStore].
pub struct StoreClient<S: DocumentStore> {
    store: Arc<S>,
    page_size: usize,
    read_policy: RetryPolicy,
}

impl<S: DocumentStore> Clone for StoreClient<S> {
    fn clone(&self) -> Self {
        StoreClient {
            store: self.store.clone(),
            page_size: self.page_size,
            read_policy: self.read_policy,
        }
    }
}

impl<S: DocumentStore> StoreClient<S> {
    pub fn new(store: Arc<S>, page_size: usize, read_policy: RetryPolicy) -> Self {
        StoreClient {
            store,
            page_size: page_size.clamp(1, crate::config::MAX_PAGE_SIZE),
            read_policy,
        }
    }

    /// Lazily reads every document matching `query`. Each call starts from the first page.
    pub fn read(&self, query: Query) -> DocumentReader<S> {
        DocumentReader {
            store: self.store.clone(),
            query,
            page_size: self.page_size,
            policy: self.read_policy,
            token: None,
            buffer: VecDeque::new(),
            started: false,
            finished: false,
            served: 0,
            total: None,
            last_logged_pct: 0,
        }
    }

    pub async fn bulk_update(
        &self,
        operations: &[WriteOperation],
    ) -> Result<Vec<ItemOutcome>, SweepersError> {
        self.store.bulk_update(operations).await
    }
}

/// A lazy, finite, non-resumable document sequence.
pub struct DocumentReader<S: DocumentStore> {
    store: Arc<S>,
    query: Query,
    page_size: usize,
    policy: RetryPolicy,
    token: Option<PageToken>,
    buffer: VecDeque<Document>,
    started: bool,
    finished: bool,
    served: u64,
    total: Option<u64>,
    last_logged_pct: u64,
}

impl<S: DocumentStore> DocumentReader<S> {
    /// Number of documents handed out so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub async fn next(&mut self) -> Result<Option<Document>, SweepersError> {
        if self.buffer.is_empty() && !self.finished {
            if let Some(page) = self.next_page().await? {
                self.buffer.extend(page);
            }
        }
        Ok(self.buffer.pop_front().inspect(|_| self.served += 1))
    }

    /// Fetches the next whole page, bypassing the per-document buffer.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>, SweepersError> {
        if self.finished {
            return Ok(None);
        }
        if self.started && self.token.is_none() {
            self.finished = true;
            return Ok(None);
        }
        self.started = true;

        let store = &*self.store;
        let query = &self.query;
        let token = self.token.as_ref();
        let page_size = self.page_size;
        let served = self.served + self.buffer.len() as u64;
        let page = retry_async(&self.policy, "registry page read", move |_| async move {
            let page = store.fetch_page(query, page_size, token).await?;
            if !page.documents.is_empty() || page.next.is_none() {
                return Ok(page);
            }
            // An empty page with more advertised would otherwise loop forever. A first page
            // opened a cursor of its own, which the next attempt replaces.
            if let (None, Some(opened)) = (token, page.next) {
                release_cursor(store, opened).await;
            }
            Err(SweepersError::Transient(format!(
                "empty page received before end of stream (served {served} of {:?})",
                page.total_hits
            )))
        })
        .await?;

        self.total = page.total_hits.or(self.total);
        self.log_progress(page.documents.len() as u64);

        let previous = std::mem::replace(&mut self.token, page.next);
        if self.token.is_none() {
            self.finished = true;
            if let Some(last) = previous {
                release_cursor(&*self.store, last).await;
            }
        }

        if page.documents.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.documents))
    }

    /// Ends the read, releasing the server-side cursor if the stream was not drained. Every
    /// caller that may stop before the end (cancellation, an error) must close the reader.
    pub async fn close(&mut self) {
        self.finished = true;
        self.buffer.clear();
        if let Some(token) = self.token.take() {
            release_cursor(&*self.store, token).await;
        }
    }

    fn log_progress(&mut self, page_len: u64) {
        let Some(total) = self.total.filter(|t| *t > 0) else {
            return;
        };
        let fetched = self.served + self.buffer.len() as u64 + page_len;
        let pct = (fetched * 100 / total).min(100);
        tracing::debug!("paging query ({fetched} of {total})");
        if pct >= self.last_logged_pct + 5 || (pct == 100 && self.last_logged_pct < 100) {
            self.last_logged_pct = pct;
            tracing::info!("Query progress: {pct}%");
        }
    }

    /// Drains the remaining stream into memory. The cursor is released even if a page fails.
    pub async fn collect_all(mut self) -> Result<Vec<Document>, SweepersError> {
        let mut docs = Vec::new();
        loop {
            match self.next_page().await {
                Ok(Some(page)) => {
                    self.served += page.len() as u64;
                    docs.extend(page);
                }
                Ok(None) => return Ok(docs),
                Err(err) => {
                    self.close().await;
                    return Err(err);
                }
            }
        }
    }
}

async fn release_cursor<S: DocumentStore>(store: &S, token: PageToken) {
    if let Err(err) = store.release(token).await {
        tracing::debug!("failed to release read cursor: {err}");
    }
}
