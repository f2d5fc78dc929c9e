//! Bounded-concurrency fetching with retry rounds.
//!
//! Each round runs a fixed number of workers that drain a shared queue of
//! units; the round ends when every worker has returned. Units that failed
//! with a retryable error form the retry set, which is re-driven as a whole
//! (never mixed with fresh units) for at most `RetryPolicy::rounds` rounds.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{FetchOutcome, FetchUnit, RetryPolicy, UnitFetcher};
use crate::error::FetchError;

#[derive(Debug, Clone, Copy)]
pub struct BoundedFetcher {
    concurrency: usize,
    policy: RetryPolicy,
}

/// Result of driving a set of units to completion.
#[derive(Debug)]
pub struct FetchReport<T> {
    pub successes: Vec<T>,
    /// Units that failed permanently; attempted once.
    pub fatal: Vec<(FetchUnit, FetchError)>,
    /// Units still failing after the last retry round, with their last error.
    pub unresolved: Vec<(FetchUnit, FetchError)>,
    /// Retry rounds actually run after the initial pass.
    pub retry_rounds: usize,
}

impl<T> Default for FetchReport<T> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            fatal: Vec::new(),
            unresolved: Vec::new(),
            retry_rounds: 0,
        }
    }
}

impl<T> FetchReport<T> {
    pub fn is_complete(&self) -> bool {
        self.fatal.is_empty() && self.unresolved.is_empty()
    }

    /// Every unit that did not end in success.
    pub fn failures(&self) -> impl Iterator<Item = &(FetchUnit, FetchError)> {
        self.fatal.iter().chain(self.unresolved.iter())
    }
}

impl BoundedFetcher {
    pub fn new(concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            concurrency: concurrency.max(1),
            policy,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every distinct unit with at most `concurrency` requests in flight.
    pub async fn fetch_all<F>(
        &self,
        fetcher: &F,
        units: impl IntoIterator<Item = FetchUnit>,
    ) -> FetchReport<F::Output>
    where
        F: UnitFetcher + ?Sized,
    {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<FetchUnit> = units
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .collect();

        let mut report = FetchReport::default();
        let mut retry_set: BTreeMap<FetchUnit, FetchError> = BTreeMap::new();
        let mut round = 0;

        while !pending.is_empty() {
            debug!(round, units = pending.len(), "fetch round");
            for (unit, outcome) in self.run_round(fetcher, pending).await {
                match outcome {
                    FetchOutcome::Success(value) => {
                        retry_set.remove(&unit);
                        report.successes.push(value);
                    }
                    FetchOutcome::Retryable(err) => {
                        debug!(%unit, error = %err, "unit queued for retry");
                        retry_set.insert(unit, err);
                    }
                    FetchOutcome::Fatal(err) => {
                        warn!(%unit, error = %err, "unit failed permanently");
                        retry_set.remove(&unit);
                        report.fatal.push((unit, err));
                    }
                }
            }

            if retry_set.is_empty() || round >= self.policy.rounds {
                break;
            }
            round += 1;
            info!(
                round,
                of = self.policy.rounds,
                units = retry_set.len(),
                "re-driving failed units"
            );
            tokio::time::sleep(self.policy.delay).await;
            pending = retry_set.keys().cloned().collect();
        }

        report.retry_rounds = round;
        if !retry_set.is_empty() {
            warn!(
                units = retry_set.len(),
                rounds = round,
                "units still failing after retries"
            );
        }
        report.unresolved = retry_set.into_iter().collect();
        report
    }

    async fn run_round<F>(
        &self,
        fetcher: &F,
        units: Vec<FetchUnit>,
    ) -> Vec<(FetchUnit, FetchOutcome<F::Output>)>
    where
        F: UnitFetcher + ?Sized,
    {
        let workers = self.concurrency.min(units.len());
        let queue = Mutex::new(VecDeque::from(units));
        let queue = &queue;

        let handles = (0..workers).map(|_| async move {
            let mut done = Vec::new();
            loop {
                let next = queue.lock().await.pop_front();
                let Some(unit) = next else {
                    break;
                };
                let outcome = fetcher.fetch(&unit).await;
                done.push((unit, outcome));
            }
            done
        });

        join_all(handles).await.into_iter().flatten().collect()
    }
}
