//! In-process [DocumentStore] used by tests and local dry runs.
//!
//! Reads snapshot the matching documents when a query starts (like a scroll context), so writes
//! made while a read is in flight do not shift later pages. Failures can be injected at the page,
//! batch and item level.
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use super::{
    sort_key, DocumentStore, IndexKind, ItemError, ItemOutcome, ItemStatus, Page, PageToken, Query,
};
use crate::{document::Document, error::SweepersError, reconcile::WriteOperation};

#[derive(Debug, Clone)]
struct ItemFailure {
    error: ItemError,
    /// Remaining failing attempts; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    indices: BTreeMap<IndexKind, BTreeMap<String, Map<String, Value>>>,
    cursors: HashMap<String, (Vec<Document>, usize)>,
    next_cursor: u64,
    failing_pages: u32,
    malformed_pages: u32,
    empty_pages: u32,
    failing_batches: u32,
    item_failures: HashMap<String, ItemFailure>,
    bulk_requests: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: IndexKind, id: impl Into<String>, source: Value) {
        let source = match source {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.state
            .lock()
            .indices
            .entry(index)
            .or_default()
            .insert(id.into(), source);
    }

    pub fn get(&self, index: IndexKind, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .indices
            .get(&index)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn field(&self, id: &str, key: &str) -> Option<Value> {
        self.get(IndexKind::Registry, id)
            .and_then(|source| source.get(key).cloned())
    }

    /// The next `n` page fetches fail with a transient error.
    pub fn fail_next_pages(&self, n: u32) {
        self.state.lock().failing_pages = n;
    }

    /// The next `n` page fetches return an undecodable response.
    pub fn malform_next_pages(&self, n: u32) {
        self.state.lock().malformed_pages = n;
    }

    /// The next `n` page fetches come back empty while still advertising more hits. The cursor
    /// does not advance, and a first page still opens one.
    pub fn empty_next_pages(&self, n: u32) {
        self.state.lock().empty_pages = n;
    }

    /// The next `n` bulk requests fail as a whole with a transient transport error.
    pub fn fail_next_batches(&self, n: u32) {
        self.state.lock().failing_batches = n;
    }

    /// Updates to `id` fail with `error`, `times` times or forever when `None`.
    pub fn fail_item(&self, id: impl Into<String>, error: ItemError, times: Option<u32>) {
        self.state.lock().item_failures.insert(
            id.into(),
            ItemFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Ids of each bulk request that reached the store, in order.
    pub fn bulk_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().bulk_requests.clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    fn snapshot(state: &State, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = state
            .indices
            .get(&query.index)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .filter(|(_, source)| query.filter.matches(source))
            .map(|(id, source)| {
                let source = match &query.includes {
                    Some(fields) => source
                        .iter()
                        .filter(|(key, _)| fields.iter().any(|f| f == *key))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    None => source.clone(),
                };
                Document::new(id.clone(), source)
            })
            .collect();
        if !query.sort.is_empty() {
            docs.sort_by(|a, b| {
                query
                    .sort
                    .iter()
                    .map(|field| sort_key(&a.source, field).cmp(&sort_key(&b.source, field)))
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        docs
    }
}

impl DocumentStore for InMemoryStore {
    async fn fetch_page(
        &self,
        query: &Query,
        page_size: usize,
        token: Option<&PageToken>,
    ) -> Result<Page, SweepersError> {
        let mut state = self.state.lock();
        if state.failing_pages > 0 {
            state.failing_pages -= 1;
            return Err(SweepersError::Transient("injected page failure".to_string()));
        }
        if state.malformed_pages > 0 {
            state.malformed_pages -= 1;
            return Err(SweepersError::MalformedResponse(
                "injected undecodable page".to_string(),
            ));
        }

        let cursor = match token {
            Some(token) => token.cursor.clone(),
            None => {
                let docs = Self::snapshot(&state, query);
                state.next_cursor += 1;
                let cursor = format!("cursor-{}", state.next_cursor);
                state.cursors.insert(cursor.clone(), (docs, 0));
                cursor
            }
        };

        if state.empty_pages > 0 {
            state.empty_pages -= 1;
            let (docs, offset) = state.cursors.get(&cursor).ok_or_else(|| {
                SweepersError::MalformedResponse(format!("unknown cursor {cursor}"))
            })?;
            return Ok(Page {
                documents: vec![],
                next: Some(PageToken {
                    cursor,
                    served: *offset as u64,
                }),
                total_hits: Some(docs.len() as u64),
            });
        }

        let (docs, offset) = state.cursors.get_mut(&cursor).ok_or_else(|| {
            SweepersError::MalformedResponse(format!("unknown cursor {cursor}"))
        })?;
        let total = docs.len();
        let end = (*offset + page_size.max(1)).min(total);
        let page: Vec<Document> = docs[*offset..end].to_vec();
        *offset = end;

        let next = (end < total).then(|| PageToken {
            cursor: cursor.clone(),
            served: end as u64,
        });
        if next.is_none() && token.is_none() {
            // single-page reads never hand out a cursor to release
            state.cursors.remove(&cursor);
        }
        Ok(Page {
            documents: page,
            next,
            total_hits: Some(total as u64),
        })
    }

    async fn release(&self, token: PageToken) -> Result<(), SweepersError> {
        self.state.lock().cursors.remove(&token.cursor);
        Ok(())
    }

    async fn bulk_update(
        &self,
        operations: &[WriteOperation],
    ) -> Result<Vec<ItemOutcome>, SweepersError> {
        let mut state = self.state.lock();
        if state.failing_batches > 0 {
            state.failing_batches -= 1;
            return Err(SweepersError::Transient(
                "injected bulk transport failure".to_string(),
            ));
        }
        state
            .bulk_requests
            .push(operations.iter().map(|op| op.id.clone()).collect());

        let mut outcomes = Vec::with_capacity(operations.len());
        for op in operations {
            if let Some(failure) = state.item_failures.get_mut(&op.id) {
                let active = match &mut failure.remaining {
                    None => true,
                    Some(0) => false,
                    Some(n) => {
                        *n -= 1;
                        true
                    }
                };
                if active {
                    outcomes.push(ItemOutcome {
                        id: op.id.clone(),
                        status: ItemStatus::Failed(failure.error.clone()),
                    });
                    continue;
                }
            }

            let status = match state
                .indices
                .get_mut(&IndexKind::Registry)
                .and_then(|docs| docs.get_mut(&op.id))
            {
                Some(source) => {
                    for (key, value) in &op.patch {
                        source.insert(key.clone(), value.clone());
                    }
                    ItemStatus::Applied
                }
                None => ItemStatus::Failed(ItemError::new(
                    404,
                    "document_missing_exception",
                    format!("[{}]: document missing", op.id),
                )),
            };
            outcomes.push(ItemOutcome {
                id: op.id.clone(),
                status,
            });
        }
        Ok(outcomes)
    }
}
