//! Explicit per-run state handed to every stage: configuration, the cooperative cancellation flag,
//! and the report each pass accumulates.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    config::SweepersConfig,
    error::SweepersError,
    writer::{FailedWrite, WriteSummary},
};

/// Cooperative cancellation, checked between batches and pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SweepersError> {
        if self.is_cancelled() {
            Err(SweepersError::OperationCancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<SweepersConfig>,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(config: SweepersConfig) -> Self {
        RunContext {
            config: Arc::new(config),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Provenance,
    Ancestry,
}

impl Display for Pass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Pass::Provenance => write!(f, "provenance"),
            Pass::Ancestry => write!(f, "ancestry"),
        }
    }
}

/// A group, subgraph or document that a pass skipped, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedUnit {
    pub unit: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub documents_read: u64,
    pub operations_computed: u64,
    pub operations_applied: u64,
    /// Recoverable data-shape problems (bad versions, malformed reference fields).
    pub data_warnings: u64,
    /// Identifiers whose write never applied, with the last error seen.
    pub failures: Vec<FailedWrite>,
    /// Units excluded because of an invariant violation.
    pub skipped: Vec<SkippedUnit>,
    /// Computed operations that were never submitted because the run was cancelled.
    pub unsent: u64,
    pub cancelled: bool,
    /// Error that aborted the pass, if any.
    pub fatal: Option<SweepersError>,
    pub elapsed_ms: u64,
}

impl PassReport {
    pub fn data_warning(&mut self, id: &str, reason: impl Display) {
        tracing::warn!("{id}: {reason}");
        self.data_warnings += 1;
    }

    pub fn skip(&mut self, unit: impl Into<String>, reason: impl Into<String>) {
        let unit = unit.into();
        let reason = reason.into();
        tracing::error!("Skipping {unit}: {reason}");
        self.skipped.push(SkippedUnit { unit, reason });
    }

    pub fn absorb(&mut self, summary: WriteSummary) {
        self.operations_applied += summary.applied;
        self.unsent += summary.unsent;
        self.cancelled |= summary.cancelled;
        self.failures.extend(summary.failed);
    }

    /// Records a pass-ending error. Cancellation is reported as such rather than as a failure.
    pub fn abort(&mut self, err: SweepersError) {
        if err == SweepersError::OperationCancelled {
            tracing::warn!("Pass cancelled");
            self.cancelled = true;
        } else {
            tracing::error!("Pass aborted: {err}");
            self.fatal = Some(err);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.fatal.is_none() && self.failures.is_empty()
    }
}

/// Outcome of a whole run, serialized as JSON for the external scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub passes: BTreeMap<Pass, PassReport>,
}

impl RunReport {
    pub fn insert(&mut self, pass: Pass, report: PassReport) {
        self.passes.insert(pass, report);
    }

    pub fn pass(&self, pass: Pass) -> Option<&PassReport> {
        self.passes.get(&pass)
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.passes
            .values()
            .flat_map(|report| report.failures.iter().map(|f| f.id.as_str()))
            .collect()
    }

    pub fn has_fatal_error(&self) -> bool {
        self.passes.values().any(|report| report.fatal.is_some())
    }

    /// True when every pass finished and every computed write applied.
    pub fn is_success(&self) -> bool {
        self.passes.values().all(PassReport::is_clean)
    }

    pub fn to_json(&self) -> Result<String, SweepersError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
