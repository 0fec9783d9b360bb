//! Bulk Write Orchestrator.
//!
//! Operations are buffered into batches bounded by count and encoded size. A batch that cannot be
//! submitted at all is resubmitted whole under `retry.batch`; once that ceiling is exhausted it is
//! decomposed into individual operations. Any operation that fails inside an accepted batch becomes
//! a [PendingFailure] and is retried on its own under `retry.item`. Failures that outlive their
//! ceiling, or that the store reports as permanent, are recorded in the [WriteSummary] and never
//! block the rest of the pass.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    config::{RetryConfig, WriterConfig},
    context::CancelFlag,
    error::SweepersError,
    reconcile::WriteOperation,
    retry::{retry_async, RetryPolicy},
    store::{DocumentStore, ItemOutcome, ItemStatus, StoreClient},
};

/// An operation whose last write attempt failed and that may still be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFailure {
    pub operation: WriteOperation,
    pub attempts: u32,
    pub last_error: String,
    retryable: bool,
}

impl PendingFailure {
    fn new(operation: WriteOperation, error: impl ToString, retryable: bool) -> Self {
        PendingFailure {
            operation,
            attempts: 1,
            last_error: error.to_string(),
            retryable,
        }
    }
}

/// A write that reached a terminal failed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedWrite {
    pub id: String,
    pub error: String,
    pub attempts: u32,
}

impl From<PendingFailure> for FailedWrite {
    fn from(failure: PendingFailure) -> Self {
        FailedWrite {
            id: failure.operation.id,
            error: failure.last_error,
            attempts: failure.attempts,
        }
    }
}

/// `applied + failed + unsent == submitted` once the writer is finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub submitted: u64,
    pub applied: u64,
    pub failed: Vec<FailedWrite>,
    pub unsent: u64,
    pub batches: u64,
    pub cancelled: bool,
}

pub struct BulkWriter<S: DocumentStore> {
    client: StoreClient<S>,
    limits: WriterConfig,
    batch_policy: RetryPolicy,
    item_policy: RetryPolicy,
    cancel: CancelFlag,
    batch: Vec<WriteOperation>,
    positions: HashMap<String, usize>,
    batch_bytes: usize,
    summary: WriteSummary,
}

impl<S: DocumentStore> BulkWriter<S> {
    pub fn new(
        client: StoreClient<S>,
        limits: WriterConfig,
        retry: &RetryConfig,
        cancel: CancelFlag,
    ) -> Self {
        BulkWriter {
            client,
            limits,
            batch_policy: retry.batch,
            item_policy: retry.item,
            cancel,
            batch: Vec::new(),
            positions: HashMap::new(),
            batch_bytes: 0,
            summary: WriteSummary::default(),
        }
    }

    pub fn summary(&self) -> &WriteSummary {
        &self.summary
    }

    /// Queues `op`, flushing first if it would push the batch over the byte threshold and after if
    /// the batch reaches the count threshold. A second operation for a document already in the
    /// current batch is merged into the first.
    pub async fn submit(&mut self, op: WriteOperation) -> Result<(), SweepersError> {
        if let Some(&position) = self.positions.get(&op.id) {
            let queued = &mut self.batch[position];
            self.batch_bytes -= queued.encoded_len();
            queued.patch.extend(op.patch);
            self.batch_bytes += queued.encoded_len();
            return Ok(());
        }

        let len = op.encoded_len();
        if !self.batch.is_empty() && self.batch_bytes + len > self.limits.batch_max_bytes {
            self.flush().await?;
        }
        self.summary.submitted += 1;
        self.positions.insert(op.id.clone(), self.batch.len());
        self.batch.push(op);
        self.batch_bytes += len;
        if self.batch.len() >= self.limits.batch_max_count {
            self.flush().await?;
        }
        Ok(())
    }

    /// Submits the current batch. Checks for cancellation first; a batch once started runs to
    /// completion.
    pub async fn flush(&mut self) -> Result<(), SweepersError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.positions.clear();
        self.batch_bytes = 0;

        if self.cancel.is_cancelled() {
            tracing::warn!("Run cancelled - {} document updates not written", batch.len());
            self.summary.cancelled = true;
            self.summary.unsent += batch.len() as u64;
            return Ok(());
        }

        self.summary.batches += 1;
        tracing::info!("Writing batch of {} document updates", batch.len());

        let client = &self.client;
        let operations = &batch;
        let submitted = retry_async(&self.batch_policy, "bulk update batch", move |_| {
            client.bulk_update(operations)
        })
        .await;

        let pending = match submitted {
            Ok(outcomes) => self.record_outcomes(batch, outcomes),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    "Batch of {} could not be submitted ({err}) - retrying documents individually",
                    batch.len()
                );
                batch
                    .into_iter()
                    .map(|op| PendingFailure::new(op, &err, true))
                    .collect()
            }
            Err(err) => return Err(err),
        };

        for failure in pending {
            self.resolve(failure).await?;
        }
        Ok(())
    }

    fn record_outcomes(
        &mut self,
        batch: Vec<WriteOperation>,
        outcomes: Vec<ItemOutcome>,
    ) -> Vec<PendingFailure> {
        let mut by_id: HashMap<String, WriteOperation> =
            batch.into_iter().map(|op| (op.id.clone(), op)).collect();
        let mut pending = Vec::new();
        for outcome in outcomes {
            let Some(op) = by_id.remove(&outcome.id) else {
                tracing::debug!("store reported on unknown document {}", outcome.id);
                continue;
            };
            match outcome.status {
                ItemStatus::Applied => self.summary.applied += 1,
                ItemStatus::Failed(err) => {
                    let retryable = err.is_retryable();
                    pending.push(PendingFailure::new(op, err, retryable));
                }
            }
        }
        // anything the store did not report on is treated as a retryable failure
        pending.extend(
            by_id
                .into_values()
                .map(|op| PendingFailure::new(op, "no outcome reported", true)),
        );
        pending
    }

    /// Retries one failed operation on its own until it applies, fails permanently, or exhausts
    /// the item ceiling.
    async fn resolve(&mut self, mut failure: PendingFailure) -> Result<(), SweepersError> {
        while failure.retryable && self.item_policy.allows_another(failure.attempts) {
            tokio::time::sleep(self.item_policy.delay_for(failure.attempts - 1)).await;
            failure.attempts += 1;
            let result = self
                .client
                .bulk_update(std::slice::from_ref(&failure.operation))
                .await;
            match result {
                Ok(outcomes) => {
                    let status = outcomes
                        .into_iter()
                        .find(|outcome| outcome.id == failure.operation.id)
                        .map(|outcome| outcome.status);
                    match status {
                        Some(ItemStatus::Applied) => {
                            tracing::debug!(
                                "{} applied after {} attempts",
                                failure.operation.id,
                                failure.attempts
                            );
                            self.summary.applied += 1;
                            return Ok(());
                        }
                        Some(ItemStatus::Failed(err)) => {
                            failure.retryable = err.is_retryable();
                            failure.last_error = err.to_string();
                        }
                        None => failure.last_error = "no outcome reported".to_string(),
                    }
                }
                Err(err) if err.is_retryable() => failure.last_error = err.to_string(),
                Err(err) => return Err(err),
            }
        }

        tracing::error!(
            "Update of {} failed permanently after {} attempt(s): {}",
            failure.operation.id,
            failure.attempts,
            failure.last_error
        );
        self.summary.failed.push(failure.into());
        Ok(())
    }

    /// Flushes what remains and returns the final tally.
    pub async fn finish(mut self) -> Result<WriteSummary, SweepersError> {
        self.flush().await?;
        tracing::info!(
            "Updated {} of {} documents ({} failed, {} batches)",
            self.summary.applied,
            self.summary.submitted,
            self.summary.failed.len(),
            self.summary.batches
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexKind, InMemoryStore, ItemError};
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn store_with(n: usize) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        for i in 0..n {
            store.insert(IndexKind::Registry, format!("doc-{i}"), json!({}));
        }
        Arc::new(store)
    }

    fn op(i: usize) -> WriteOperation {
        let mut patch = Map::new();
        patch.insert("field".to_string(), json!(i));
        WriteOperation::new(format!("doc-{i}"), patch)
    }

    fn writer(store: &Arc<InMemoryStore>, batch_max_count: usize) -> BulkWriter<InMemoryStore> {
        let retry = RetryConfig {
            read: RetryPolicy::immediate(1),
            batch: RetryPolicy::immediate(2),
            item: RetryPolicy::immediate(3),
        };
        BulkWriter::new(
            StoreClient::new(store.clone(), 100, retry.read),
            WriterConfig {
                batch_max_count,
                batch_max_bytes: 1024 * 1024,
            },
            &retry,
            CancelFlag::new(),
        )
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_block_the_batch() {
        let store = store_with(10);
        store.fail_item("doc-3", ItemError::new(400, "mapper_parsing_exception", "bad"), None);
        store.fail_item("doc-7", ItemError::new(404, "document_missing_exception", "gone"), None);

        let mut writer = writer(&store, 100);
        for i in 0..10 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();

        assert_eq!(summary.submitted, 10);
        assert_eq!(summary.applied, 8);
        let mut failed: Vec<&str> = summary.failed.iter().map(|f| f.id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["doc-3", "doc-7"]);
        assert!(summary.failed[0].error.contains("exception"));
        // permanent failures are not retried individually
        assert_eq!(store.bulk_requests().len(), 1);
        assert_eq!(store.field("doc-0", "field"), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_transient_item_failure_is_retried_alone() {
        let store = store_with(4);
        store.fail_item("doc-2", ItemError::new(429, "es_rejected_execution_exception", ""), Some(1));

        let mut writer = writer(&store, 100);
        for i in 0..4 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.applied, 4);
        assert!(summary.failed.is_empty());
        assert_eq!(store.bulk_requests()[1], vec!["doc-2".to_string()]);
    }

    #[tokio::test]
    async fn test_item_ceiling_exhausted() {
        let store = store_with(2);
        store.fail_item("doc-1", ItemError::new(503, "unavailable", "shard down"), None);
        let mut writer = writer(&store, 100);
        writer.submit(op(0)).await.unwrap();
        writer.submit(op(1)).await.unwrap();
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].attempts, 3);
        assert_eq!(store.bulk_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_transport_failure_then_decomposition() {
        let store = store_with(3);
        // both whole-batch attempts fail, individual retries go through
        store.fail_next_batches(2);
        let mut writer = writer(&store, 100);
        for i in 0..3 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.batches, 1);
        assert!(store.bulk_requests().iter().all(|ids| ids.len() == 1));
    }

    #[tokio::test]
    async fn test_count_threshold_and_coalescing() {
        let store = store_with(10);
        let mut writer = writer(&store, 3);
        for i in 0..10 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.batches, 4);
        assert_eq!(summary.applied, 10);

        let mut writer = self::writer(&store, 10);
        writer.submit(op(1)).await.unwrap();
        let mut second = Map::new();
        second.insert("other".to_string(), json!(true));
        writer.submit(WriteOperation::new("doc-1", second)).await.unwrap();
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(store.field("doc-1", "other"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_byte_threshold_splits_batches() {
        let store = store_with(4);
        let one = op(0).encoded_len();
        let mut writer = writer(&store, 100);
        writer.limits.batch_max_bytes = one * 2;
        for i in 0..4 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.applied, 4);
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let store = store_with(6);
        let mut writer = writer(&store, 2);
        let cancel = writer.cancel.clone();
        for i in 0..2 {
            writer.submit(op(i)).await.unwrap();
        }
        cancel.cancel();
        for i in 2..6 {
            writer.submit(op(i)).await.unwrap();
        }
        let summary = writer.finish().await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.unsent, 4);
        assert_eq!(
            summary.applied + summary.failed.len() as u64 + summary.unsent,
            summary.submitted
        );
    }
}
