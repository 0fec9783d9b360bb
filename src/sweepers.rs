//! Pass drivers.
//!
//! Every pass runs as two stages joined by a bounded queue: the compute stage reads from the store
//! and emits [WriteOperation]s, and a spawned write stage owns the [BulkWriter] that submits them.
//! A slow store on either side applies backpressure to the other. The write stage is the only
//! writer; the compute stage never touches stored documents directly.
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;

use crate::{
    ancestry::compute_ancestry,
    context::{Pass, PassReport, RunContext, RunReport},
    error::SweepersError,
    provenance::compute_provenance,
    reconcile::WriteOperation,
    store::{DocumentStore, StoreClient},
    writer::{BulkWriter, WriteSummary},
};

async fn compute<S: DocumentStore>(
    pass: Pass,
    client: &StoreClient<S>,
    ctx: &RunContext,
    sink: &mpsc::Sender<WriteOperation>,
    report: &mut PassReport,
) -> Result<(), SweepersError> {
    match pass {
        Pass::Provenance => compute_provenance(client, ctx, sink, report).await,
        Pass::Ancestry => compute_ancestry(client, ctx, sink, report).await,
    }
}

/// Drains `rx` into `writer` until the compute stage hangs up. The summary is returned even when
/// the stage stops early so that already-applied writes are still reported.
async fn write_stage<S: DocumentStore>(
    mut writer: BulkWriter<S>,
    mut rx: mpsc::Receiver<WriteOperation>,
) -> (WriteSummary, Option<SweepersError>) {
    let drained = async {
        while let Some(op) = rx.recv().await {
            writer.submit(op).await?;
        }
        writer.flush().await
    }
    .await;
    if let Err(err) = drained {
        return (writer.summary().clone(), Some(err));
    }
    match writer.finish().await {
        Ok(summary) => (summary, None),
        Err(err) => (WriteSummary::default(), Some(err)),
    }
}

/// Runs one pass to completion and reports on it. Errors are recorded in the report, never
/// returned.
#[tracing::instrument(skip(ctx, store))]
pub async fn run_pass<S: DocumentStore>(ctx: &RunContext, store: Arc<S>, pass: Pass) -> PassReport {
    let started = Instant::now();
    let config = &ctx.config;
    tracing::info!("Starting {pass} pass");

    let client = StoreClient::new(store, config.store.effective_page_size(), config.retry.read);
    let writer = BulkWriter::new(
        client.clone(),
        config.writer.clone(),
        &config.retry,
        ctx.cancel.clone(),
    );
    let (tx, rx) = mpsc::channel(config.pipeline.queue_capacity.max(1));
    let write_handle = tokio::spawn(write_stage(writer, rx));

    let mut report = PassReport::default();
    let computed = compute(pass, &client, ctx, &tx, &mut report).await;
    drop(tx);

    let (summary, write_err) = write_handle.await.unwrap_or_else(|err| {
        (
            WriteSummary::default(),
            Some(SweepersError::InvariantViolation(format!(
                "write stage failed to complete: {err}"
            ))),
        )
    });
    report.absorb(summary);

    // a stopped write stage surfaces on the compute side as a closed queue, so its own error is
    // the one worth reporting
    if let Some(err) = write_err.or(computed.err()) {
        report.abort(err);
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        "{pass} pass finished in {:.1}s: {} read, {} computed, {} applied, {} failed",
        report.elapsed_ms as f64 / 1000.0,
        report.documents_read,
        report.operations_computed,
        report.operations_applied,
        report.failures.len()
    );
    report
}

pub async fn run_provenance<S: DocumentStore>(ctx: &RunContext, store: Arc<S>) -> PassReport {
    run_pass(ctx, store, Pass::Provenance).await
}

pub async fn run_ancestry<S: DocumentStore>(ctx: &RunContext, store: Arc<S>) -> PassReport {
    run_pass(ctx, store, Pass::Ancestry).await
}

/// Runs each requested pass once, in order, or all at once when `concurrent` is set. The passes
/// write disjoint fields, so running them side by side is safe. A fatal error in one pass does
/// not prevent the others; cancellation stops passes that have not started yet.
#[tracing::instrument(skip(ctx, store))]
pub async fn run_all<S: DocumentStore>(
    ctx: &RunContext,
    store: Arc<S>,
    passes: &[Pass],
    concurrent: bool,
) -> RunReport {
    let mut passes = passes.to_vec();
    passes.sort();
    passes.dedup();

    let mut run = RunReport::default();
    if concurrent {
        let handles: Vec<_> = passes
            .into_iter()
            .map(|pass| {
                let ctx = ctx.clone();
                let store = store.clone();
                (
                    pass,
                    tokio::spawn(async move { run_pass(&ctx, store, pass).await }),
                )
            })
            .collect();
        for (pass, handle) in handles {
            let report = handle.await.unwrap_or_else(|err| {
                let mut report = PassReport::default();
                report.abort(SweepersError::InvariantViolation(format!(
                    "{pass} pass failed to complete: {err}"
                )));
                report
            });
            run.insert(pass, report);
        }
    } else {
        for pass in passes {
            if ctx.cancel.is_cancelled() {
                tracing::warn!("Run cancelled - not starting {pass} pass");
                run.insert(
                    pass,
                    PassReport {
                        cancelled: true,
                        ..Default::default()
                    },
                );
                continue;
            }
            let report = run_pass(ctx, store.clone(), pass).await;
            run.insert(pass, report);
        }
    }
    run
}
