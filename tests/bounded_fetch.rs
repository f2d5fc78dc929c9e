use async_trait::async_trait;
use gigwatch::error::FetchError;
use gigwatch::fetch::pool::BoundedFetcher;
use gigwatch::fetch::{FetchOutcome, FetchUnit, RetryPolicy, UnitFetcher};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

fn busy(unit: &FetchUnit) -> FetchError {
    FetchError::Provider {
        target: unit.to_string(),
        status: 503,
        message: "service unavailable".into(),
        permanent: false,
    }
}

fn denied(unit: &FetchUnit) -> FetchError {
    FetchError::Provider {
        target: unit.to_string(),
        status: 403,
        message: "invalid api key".into(),
        permanent: true,
    }
}

fn policy(rounds: usize) -> RetryPolicy {
    RetryPolicy {
        rounds,
        delay: Duration::from_secs(1),
    }
}

/// Records the peak number of concurrent fetches.
#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl UnitFetcher for Gauge {
    type Output = i64;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<i64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match unit {
            FetchUnit::Resource(id) => FetchOutcome::Success(*id),
            other => FetchOutcome::Fatal(denied(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Ok,
    Busy,
    Denied,
}

/// Plays a per-unit script of outcomes; the last step repeats.
#[derive(Clone, Default)]
struct Scripted {
    scripts: Arc<Mutex<HashMap<FetchUnit, VecDeque<Step>>>>,
    calls: Arc<Mutex<Vec<FetchUnit>>>,
}

impl Scripted {
    fn new(scripts: Vec<(i64, Vec<Step>)>) -> Self {
        let map = scripts
            .into_iter()
            .map(|(id, steps)| (FetchUnit::Resource(id), VecDeque::from(steps)))
            .collect();
        Self {
            scripts: Arc::new(Mutex::new(map)),
            ..Default::default()
        }
    }

    async fn calls_for(&self, id: i64) -> usize {
        let unit = FetchUnit::Resource(id);
        self.calls.lock().await.iter().filter(|u| **u == unit).count()
    }
}

#[async_trait]
impl UnitFetcher for Scripted {
    type Output = i64;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<i64> {
        self.calls.lock().await.push(unit.clone());
        let step = {
            let mut scripts = self.scripts.lock().await;
            let script = scripts.entry(unit.clone()).or_default();
            if script.len() > 1 {
                script.pop_front().unwrap_or(Step::Ok)
            } else {
                script.front().copied().unwrap_or(Step::Ok)
            }
        };
        let FetchUnit::Resource(id) = unit else {
            return FetchOutcome::Fatal(denied(unit));
        };
        match step {
            Step::Ok => FetchOutcome::Success(*id),
            Step::Busy => FetchOutcome::Retryable(busy(unit)),
            Step::Denied => FetchOutcome::Fatal(denied(unit)),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_concurrency_cap() {
    let gauge = Gauge::default();
    let pool = BoundedFetcher::new(3, policy(5));

    let report = pool
        .fetch_all(&gauge, (1..=20).map(FetchUnit::Resource))
        .await;

    let mut got = report.successes.clone();
    got.sort();
    assert_eq!(got, (1..=20).collect::<Vec<_>>());
    assert!(report.is_complete());
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_concurrency_still_makes_progress() {
    let gauge = Gauge::default();
    let pool = BoundedFetcher::new(0, policy(1));
    assert_eq!(pool.concurrency(), 1);
    let report = pool.fetch_all(&gauge, [FetchUnit::Resource(1)]).await;
    assert_eq!(report.successes, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn retry_set_is_driven_until_success_or_rounds_exhausted() {
    let fake = Scripted::new(vec![
        (1, vec![Step::Ok]),
        (2, vec![Step::Busy, Step::Busy, Step::Ok]),
        (3, vec![Step::Denied]),
        (4, vec![Step::Busy]),
    ]);
    let pool = BoundedFetcher::new(2, policy(3));

    let report = pool
        .fetch_all(&fake, (1..=4).map(FetchUnit::Resource))
        .await;

    let mut got = report.successes.clone();
    got.sort();
    assert_eq!(got, vec![1, 2]);
    assert_eq!(report.retry_rounds, 3);

    assert_eq!(report.fatal.len(), 1);
    assert_eq!(report.fatal[0].0, FetchUnit::Resource(3));
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(report.unresolved[0].0, FetchUnit::Resource(4));
    assert!(report.unresolved[0].1.is_retryable());
    assert_eq!(report.failures().count(), 2);

    // Successful and fatal units are never re-driven.
    assert_eq!(fake.calls_for(1).await, 1);
    assert_eq!(fake.calls_for(3).await, 1);
    assert_eq!(fake.calls_for(2).await, 3);
    // Initial pass plus three retry rounds.
    assert_eq!(fake.calls_for(4).await, 4);
}

#[tokio::test(start_paused = true)]
async fn duplicate_units_are_fetched_once() {
    let fake = Scripted::new(vec![]);
    let pool = BoundedFetcher::new(4, policy(2));

    let units = vec![
        FetchUnit::Resource(7),
        FetchUnit::Resource(7),
        FetchUnit::Resource(8),
    ];
    let report = pool.fetch_all(&fake, units).await;

    assert_eq!(report.successes.len(), 2);
    assert_eq!(fake.calls_for(7).await, 1);
    assert_eq!(report.retry_rounds, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_input_is_a_complete_report() {
    let fake = Scripted::new(vec![]);
    let pool = BoundedFetcher::new(4, policy(2));
    let report = pool.fetch_all(&fake, Vec::new()).await;
    assert!(report.successes.is_empty());
    assert!(report.is_complete());
    assert!(fake.calls.lock().await.is_empty());
}
