//! Sync cycles: fetch, filter, resolve references, deduplicate, persist, report.
//!
//! Each cycle is a [`SyncCycle`] driven by [`run_cycle`], which owns the
//! per-run id and tracing span and turns any failure into a logged "no result"
//! so the schedule carries on.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::{FetchError, SyncError};
use crate::fetch::FetchUnit;
use crate::model::EventCandidate;

pub mod events;
pub mod scrobbles;

pub use events::EventsSync;
pub use scrobbles::ScrobbleSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleStage {
    Idle,
    Fetching,
    Filtering,
    ResolvingReferences,
    Deduplicating,
    Persisting,
    Reporting,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::Idle => "idle",
            CycleStage::Fetching => "fetching",
            CycleStage::Filtering => "filtering",
            CycleStage::ResolvingReferences => "resolving_references",
            CycleStage::Deduplicating => "deduplicating",
            CycleStage::Persisting => "persisting",
            CycleStage::Reporting => "reporting",
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage of a running cycle. Stages only move forward.
#[derive(Debug)]
pub struct StageTracker {
    stage: CycleStage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self {
            stage: CycleStage::Idle,
        }
    }
}

impl StageTracker {
    pub fn enter(&mut self, next: CycleStage) {
        debug_assert!(next > self.stage, "stage {} after {}", next, self.stage);
        debug!(from = %self.stage, to = %next, "stage");
        self.stage = next;
    }

    pub fn stage(&self) -> CycleStage {
        self.stage
    }
}

/// A fetch unit that still failed when the cycle completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    pub unit: FetchUnit,
    pub error: FetchError,
}

impl From<(FetchUnit, FetchError)> for PartialFailure {
    fn from((unit, error): (FetchUnit, FetchError)) -> Self {
        Self { unit, error }
    }
}

/// Outcome of a completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport<T> {
    pub run_id: Uuid,
    /// Records persisted as new or changed during this cycle.
    pub reported: Vec<T>,
    pub partial_failures: Vec<PartialFailure>,
    /// Records dropped because a referenced entity could not be resolved.
    pub dropped: usize,
    pub unchanged: usize,
}

impl<T> CycleReport<T> {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            reported: Vec::new(),
            partial_failures: Vec::new(),
            dropped: 0,
            unchanged: 0,
        }
    }
}

#[async_trait]
pub trait SyncCycle: Send + Sync {
    type Record: Send;

    /// Short name used in logs and the sync log table.
    fn name(&self) -> &'static str;

    fn pool(&self) -> &Pool;

    async fn execute(
        &self,
        run_id: Uuid,
        stages: &mut StageTracker,
    ) -> Result<CycleReport<Self::Record>, SyncError>;
}

/// Run one cycle to completion. Failures are logged (and recorded in the
/// sync log) and yield `None`; they never propagate to the scheduler.
pub async fn run_cycle<C>(cycle: &C) -> Option<CycleReport<C::Record>>
where
    C: SyncCycle + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("cycle", cycle = cycle.name(), %run_id);

    async move {
        info!("cycle started");
        let mut stages = StageTracker::default();
        match cycle.execute(run_id, &mut stages).await {
            Ok(report) => {
                if !report.partial_failures.is_empty() {
                    warn!(
                        failures = report.partial_failures.len(),
                        "cycle completed with partial failures"
                    );
                }
                info!(
                    reported = report.reported.len(),
                    unchanged = report.unchanged,
                    dropped = report.dropped,
                    "cycle finished"
                );
                Some(report)
            }
            Err(err) => {
                let stage = stages.stage();
                error!(%stage, error = %err, "cycle aborted");
                let message = format!("[{}] {} stage: {}", run_id, stage, err);
                if let Err(log_err) =
                    db::add_sync_log(cycle.pool(), cycle.name(), "error", &message).await
                {
                    warn!(?log_err, "failed to write sync log");
                }
                None
            }
        }
    }
    .instrument(span)
    .await
}

/// Keep events whose title contains any interest term (case-sensitive), first
/// occurrence per id.
pub fn filter_by_interest(
    candidates: Vec<EventCandidate>,
    interests: &[String],
) -> Vec<EventCandidate> {
    let terms: Vec<&str> = interests
        .iter()
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .collect();
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|e| terms.iter().any(|t| e.title.contains(t)))
        .filter(|e| seen.insert(e.id))
        .collect()
}
