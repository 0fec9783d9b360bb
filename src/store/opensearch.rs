//! HTTP backend speaking the OpenSearch scroll and `_bulk` APIs.
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt, time::Duration};

use super::{DocumentStore, IndexKind, ItemError, ItemOutcome, ItemStatus, Page, PageToken, Query};
use crate::{
    config::StoreConfig, document::Document, error::SweepersError, reconcile::WriteOperation,
};

/// Bulk item errors that indicate bad registry data rather than a sweeper fault.
const WARN_ERROR_TYPES: [&str; 1] = ["document_missing_exception"];

pub struct OpenSearchStore {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    index: String,
    refs_index: String,
    remotes: Vec<String>,
    scroll_keepalive: String,
}

impl fmt::Debug for OpenSearchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenSearchStore")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("index", &self.index)
            .field("refs_index", &self.refs_index)
            .field("remotes", &self.remotes)
            .finish_non_exhaustive()
    }
}

impl OpenSearchStore {
    pub fn from_config(config: &StoreConfig) -> Result<Self, SweepersError> {
        let url = config.endpoint_url()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()
            .map_err(|e| SweepersError::Config(format!("Failed to build HTTP client: {e}")))?;

        tracing::info!("Using store at {url} (index '{}')", config.index);
        if !config.remotes.is_empty() {
            tracing::info!("Reading through cross-cluster remotes {:?}", config.remotes);
        }
        Ok(OpenSearchStore {
            client,
            base_url: url.as_str().trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            index: config.index.clone(),
            refs_index: config.refs_index.clone(),
            remotes: config.remotes.clone(),
            scroll_keepalive: format!("{}m", config.scroll_keepalive_minutes.max(1)),
        })
    }

    fn index_name(&self, index: IndexKind) -> &str {
        match index {
            IndexKind::Registry => &self.index,
            IndexKind::Refs => &self.refs_index,
        }
    }

    /// Search target for `index`: the local index plus its copy on each remote.
    fn search_target(&self, index: IndexKind) -> String {
        index_expression(self.index_name(index), &self.remotes)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, SweepersError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SweepersError::from_status(status, &body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| SweepersError::MalformedResponse(format!("undecodable body: {e}")))
    }
}

/// Comma-joined multi-index expression, e.g. `registry,en-west:registry`.
pub fn index_expression(index: &str, remotes: &[String]) -> String {
    std::iter::once(index.to_string())
        .chain(remotes.iter().map(|remote| format!("{remote}:{index}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Scroll id opened by a first-page response. Later pages continue the reader's own cursor.
fn opened_scroll(data: &Value, token: Option<&PageToken>) -> Option<String> {
    match token {
        None => data
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(_) => None,
    }
}

/// Request body for the first page of `query`.
pub fn search_body(query: &Query, page_size: usize) -> Value {
    let source = match &query.includes {
        Some(fields) => json!({"includes": fields}),
        None => json!(true),
    };
    let mut body = json!({
        "query": query.filter.to_query_dsl(),
        "_source": source,
        "size": page_size,
    });
    if !query.sort.is_empty() {
        body["sort"] = query
            .sort
            .iter()
            .map(|field| json!({field: {"order": "asc"}}))
            .collect();
    }
    body
}

/// Decodes a search or scroll response. `served_before` counts hits handed out by earlier pages.
pub fn parse_search_response(data: Value, served_before: u64) -> Result<Page, SweepersError> {
    let total = data
        .pointer("/hits/total/value")
        .and_then(Value::as_u64)
        .ok_or_else(|| SweepersError::MalformedResponse("response has no hits.total.value".into()))?;
    let hits = match data.pointer("/hits/hits") {
        Some(Value::Array(hits)) => hits.clone(),
        _ => {
            return Err(SweepersError::MalformedResponse(
                "response has no hits.hits list".into(),
            ))
        }
    };
    let documents = hits
        .into_iter()
        .map(Document::from_hit)
        .collect::<Result<Vec<_>, _>>()?;

    let served = served_before + documents.len() as u64;
    if documents.is_empty() && served < total {
        tracing::error!(
            "Response contained no hits when hits were expected (got {served} of {total})"
        );
    }
    let next = match data.get("_scroll_id").and_then(Value::as_str) {
        Some(cursor) if served < total => Some(PageToken {
            cursor: cursor.to_string(),
            served,
        }),
        _ => None,
    };
    Ok(Page {
        documents,
        next,
        total_hits: Some(total),
    })
}

/// Decodes a `_bulk` response into one outcome per submitted operation. Operations the store
/// did not report on are failed with a retryable status so they are resubmitted.
pub fn parse_bulk_response(
    data: &Value,
    operations: &[WriteOperation],
) -> Result<Vec<ItemOutcome>, SweepersError> {
    let items = data
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| SweepersError::MalformedResponse("bulk response has no items".into()))?;

    let mut reported: BTreeMap<String, ItemStatus> = BTreeMap::new();
    for item in items {
        let Some(update) = item.get("update") else {
            continue;
        };
        let Some(id) = update.get("_id").and_then(Value::as_str) else {
            continue;
        };
        let status = match update.get("error") {
            Some(error) => ItemStatus::Failed(ItemError::new(
                update.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                error.get("type").and_then(Value::as_str).unwrap_or("unknown"),
                error.get("reason").and_then(Value::as_str).unwrap_or(""),
            )),
            None => ItemStatus::Applied,
        };
        reported.insert(id.to_string(), status);
    }

    Ok(operations
        .iter()
        .map(|op| ItemOutcome {
            id: op.id.clone(),
            status: reported.remove(&op.id).unwrap_or_else(|| {
                ItemStatus::Failed(ItemError::new(
                    0,
                    "no_item_result",
                    "bulk response did not report this document",
                ))
            }),
        })
        .collect())
}

/// Logs failed items aggregated by error type, then reason.
fn log_item_errors(outcomes: &[ItemOutcome]) {
    let mut aggregates: BTreeMap<(&str, &str), Vec<&str>> = BTreeMap::new();
    for outcome in outcomes {
        if let ItemStatus::Failed(err) = &outcome.status {
            aggregates
                .entry((err.kind.as_str(), err.reason.as_str()))
                .or_default()
                .push(outcome.id.as_str());
        }
    }
    for ((kind, reason), ids) in aggregates {
        if WARN_ERROR_TYPES.contains(&kind) {
            tracing::warn!("Attempt to update the following documents failed due to {kind} ({reason}): {ids:?}");
        } else {
            tracing::error!(
                "Attempt to update the following documents failed unexpectedly due to {kind} ({reason}): {ids:?}"
            );
        }
    }
}

impl DocumentStore for OpenSearchStore {
    async fn fetch_page(
        &self,
        query: &Query,
        page_size: usize,
        token: Option<&PageToken>,
    ) -> Result<Page, SweepersError> {
        let (request, served_before) = match token {
            None => {
                let body = search_body(query, page_size);
                tracing::info!("Initiating query: {body}");
                let path = format!(
                    "{}/_search?scroll={}",
                    self.search_target(query.index),
                    self.scroll_keepalive
                );
                (self.client.post(self.url(&path)).json(&body), 0)
            }
            Some(token) => {
                let body = json!({"scroll": self.scroll_keepalive, "scroll_id": token.cursor});
                (
                    self.client.post(self.url("_search/scroll")).json(&body),
                    token.served,
                )
            }
        };
        let data = self.send_json(request).await?;
        let opened = opened_scroll(&data, token);
        match parse_search_response(data, served_before) {
            Ok(page) => Ok(page),
            Err(err) => {
                // the retried request opens a scroll of its own
                if let Some(cursor) = opened {
                    let abandoned = PageToken { cursor, served: 0 };
                    if let Err(clear_err) = self.release(abandoned).await {
                        tracing::debug!("failed to clear abandoned scroll: {clear_err}");
                    }
                }
                Err(err)
            }
        }
    }

    async fn release(&self, token: PageToken) -> Result<(), SweepersError> {
        let path = format!("_search/scroll/{}", token.cursor);
        self.send_json(self.client.delete(self.url(&path))).await?;
        Ok(())
    }

    async fn bulk_update(
        &self,
        operations: &[WriteOperation],
    ) -> Result<Vec<ItemOutcome>, SweepersError> {
        let mut body = String::new();
        for op in operations {
            body.push_str(&op.to_bulk_lines()?);
        }
        let path = format!("{}/_bulk", self.index);
        let request = self
            .client
            .put(self.url(&path))
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        // A 200 does not mean every item succeeded; the per-item results must be inspected.
        let data = self.send_json(request).await?;
        let outcomes = parse_bulk_response(&data, operations)?;
        if data.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            log_item_errors(&outcomes);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use test_log::test;

    #[test]
    fn test_search_body() {
        let query = Query::published_by_lid().including(["lid", "vid"]);
        let body = search_body(&query, 500);
        assert_eq!(body["size"], json!(500));
        assert_eq!(body["_source"], json!({"includes": ["lid", "vid"]}));
        assert_eq!(
            body["sort"],
            json!([{"lid": {"order": "asc"}}, {"vid": {"order": "asc"}}])
        );
        assert_eq!(
            body["query"],
            json!({"bool": {"filter": [{"terms": {
                "ops:Tracking_Meta/ops:archive_status": ["archived", "certified"]
            }}]}})
        );
    }

    #[test]
    fn test_parse_search_pages() {
        let first = json!({
            "_scroll_id": "abc",
            "hits": {"total": {"value": 3}, "hits": [
                {"_id": "a::1.0", "_source": {"lid": "a"}},
                {"_id": "a::2.0", "_source": {"lid": "a"}}
            ]}
        });
        let page = parse_search_response(first, 0).unwrap();
        assert_eq!(page.documents.len(), 2);
        assert_eq!(
            page.next,
            Some(PageToken {
                cursor: "abc".into(),
                served: 2
            })
        );

        let last = json!({
            "_scroll_id": "abc",
            "hits": {"total": {"value": 3}, "hits": [{"_id": "b::1.0", "_source": {}}]}
        });
        let page = parse_search_response(last, 2).unwrap();
        assert_eq!(page.next, None);
    }

    #[test]
    fn test_empty_page_before_total_keeps_cursor() {
        // the reader retries this instead of looping
        let empty = json!({"_scroll_id": "abc", "hits": {"total": {"value": 9}, "hits": []}});
        let page = parse_search_response(empty, 4).unwrap();
        assert!(page.documents.is_empty());
        assert!(page.next.is_some());

        assert!(parse_search_response(json!({"hits": {}}), 0).is_err());
    }

    #[test]
    fn test_index_expression_covers_remotes() {
        assert_eq!(index_expression("registry", &[]), "registry");
        let remotes = vec!["en-west".to_string(), "img".to_string()];
        assert_eq!(
            index_expression("registry-refs", &remotes),
            "registry-refs,en-west:registry-refs,img:registry-refs"
        );
    }

    #[test]
    fn test_rejected_first_page_scroll_is_cleared() {
        // decodes as JSON but is not a search response
        let data = json!({"_scroll_id": "abc", "hits": {}});
        assert!(parse_search_response(data.clone(), 0).is_err());
        assert_eq!(opened_scroll(&data, None).as_deref(), Some("abc"));

        let token = PageToken {
            cursor: "abc".into(),
            served: 4,
        };
        assert_eq!(opened_scroll(&data, Some(&token)), None);
        assert_eq!(opened_scroll(&json!({"hits": {}}), None), None);
    }

    #[test]
    fn test_parse_bulk_response() {
        let ops: Vec<WriteOperation> = ["a", "b", "c"]
            .iter()
            .map(|id| WriteOperation::new(*id, Map::new()))
            .collect();
        let data = json!({
            "errors": true,
            "items": [
                {"update": {"_id": "a", "status": 200}},
                {"update": {"_id": "b", "status": 404, "error": {
                    "type": "document_missing_exception", "reason": "[b]: document missing"
                }}}
            ]
        });
        let outcomes = parse_bulk_response(&data, &ops).unwrap();
        assert_eq!(outcomes[0].status, ItemStatus::Applied);
        match &outcomes[1].status {
            ItemStatus::Failed(err) => {
                assert_eq!(err.status, 404);
                assert!(!err.is_retryable());
            }
            other => panic!("unexpected {other:?}"),
        }
        match &outcomes[2].status {
            ItemStatus::Failed(err) => assert!(err.is_retryable()),
            other => panic!("unexpected {other:?}"),
        }
        log_item_errors(&outcomes);

        assert!(parse_bulk_response(&json!({"took": 3}), &ops).is_err());
    }
}
