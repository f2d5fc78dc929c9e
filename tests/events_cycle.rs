use async_trait::async_trait;
use gigwatch::db;
use gigwatch::error::FetchError;
use gigwatch::fetch::{FetchOutcome, FetchUnit, RetryPolicy, UnitFetcher};
use gigwatch::model::{DateRange, EventCandidate, Place, PlaceRef};
use gigwatch::providers::kudago::EventsPage;
use gigwatch::providers::InterestSource;
use gigwatch::sync::{run_cycle, EventsSync};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn quick() -> RetryPolicy {
    RetryPolicy {
        rounds: 2,
        delay: Duration::from_millis(1),
    }
}

fn event(id: i64, title: &str, place: Option<i64>, price: &str) -> EventCandidate {
    EventCandidate {
        id,
        title: title.into(),
        slug: format!("event-{}", id),
        price: price.into(),
        dates: vec![DateRange {
            start: 1_700_000_000 + id,
            end: 1_700_010_000 + id,
        }],
        place: place.map(|id| PlaceRef { id }),
    }
}

fn place(id: i64) -> Place {
    Place {
        id,
        title: format!("Venue {}", id),
        address: format!("Street {}", id),
    }
}

#[derive(Clone)]
struct StaticInterests(Result<Vec<String>, FetchError>);

#[async_trait]
impl InterestSource for StaticInterests {
    async fn interests(&self) -> Result<Vec<String>, FetchError> {
        self.0.clone()
    }
}

/// Two-page catalog; page 1 points at page 2 through a `next` URL.
#[derive(Clone, Default)]
struct RecordingCatalog {
    pages: Arc<Mutex<HashMap<FetchUnit, EventsPage>>>,
    calls: Arc<Mutex<Vec<FetchUnit>>>,
}

impl RecordingCatalog {
    async fn set(&self, first: Vec<EventCandidate>, second: Vec<EventCandidate>) {
        let next = "https://kudago.example/events/?page=2".to_string();
        let mut pages = self.pages.lock().await;
        pages.insert(
            FetchUnit::Page(1),
            EventsPage {
                count: (first.len() + second.len()) as i64,
                next: Some(next.clone()),
                previous: None,
                results: first,
            },
        );
        pages.insert(
            FetchUnit::Url(next),
            EventsPage {
                count: 0,
                next: None,
                previous: None,
                results: second,
            },
        );
    }
}

#[async_trait]
impl UnitFetcher for RecordingCatalog {
    type Output = EventsPage;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<EventsPage> {
        self.calls.lock().await.push(unit.clone());
        match self.pages.lock().await.get(unit) {
            Some(page) => FetchOutcome::Success(page.clone()),
            None => FetchOutcome::Fatal(FetchError::Provider {
                target: unit.to_string(),
                status: 404,
                message: "Not found.".into(),
                permanent: true,
            }),
        }
    }
}

/// Places it knows are returned; any other id times out on every attempt.
#[derive(Clone, Default)]
struct RecordingPlaces {
    known: Arc<Mutex<HashMap<i64, Place>>>,
    calls: Arc<Mutex<Vec<i64>>>,
}

impl RecordingPlaces {
    fn with(places: Vec<Place>) -> Self {
        Self {
            known: Arc::new(Mutex::new(places.into_iter().map(|p| (p.id, p)).collect())),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<i64> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl UnitFetcher for RecordingPlaces {
    type Output = Place;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<Place> {
        let FetchUnit::Resource(id) = unit else {
            panic!("unexpected unit {unit}");
        };
        self.calls.lock().await.push(*id);
        match self.known.lock().await.get(id) {
            Some(p) => FetchOutcome::Success(p.clone()),
            None => FetchOutcome::Retryable(FetchError::Transport {
                target: unit.to_string(),
                message: "operation timed out".into(),
            }),
        }
    }
}

fn interests() -> StaticInterests {
    StaticInterests(Ok(vec!["Green Day".to_string(), "Korn".to_string()]))
}

fn build(
    pool: &sqlx::SqlitePool,
    catalog: &RecordingCatalog,
    places: &RecordingPlaces,
    interests: StaticInterests,
) -> EventsSync {
    EventsSync::new(
        pool.clone(),
        Arc::new(catalog.clone()),
        Arc::new(places.clone()),
        Arc::new(interests),
        6,
        quick(),
    )
}

#[tokio::test]
async fn filters_resolves_persists_and_reports() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .set(
            vec![
                event(1, "Green Day Live", Some(10), "2000"),
                event(2, "Jazz Night", Some(11), "500"),
            ],
            vec![
                event(3, "Korn", Some(12), "3000"),
                event(4, "Korn acoustic", None, ""),
                event(1, "Green Day Live", Some(10), "2000"),
            ],
        )
        .await;
    let places = RecordingPlaces::with(vec![place(10), place(11)]);
    let sync = build(&pool, &catalog, &places, interests());

    let report = run_cycle(&sync).await.expect("cycle completes");

    let mut ids: Vec<i64> = report.reported.iter().map(|e| e.event_id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 4]);
    assert!(report.reported.iter().all(|e| !e.updated));
    let green_day = report.reported.iter().find(|e| e.event_id == 1).unwrap();
    assert_eq!(green_day.place, Some(place(10)));

    // Event 3's place never resolved: only that event is dropped.
    assert_eq!(report.dropped, 1);
    assert_eq!(report.partial_failures.len(), 1);
    assert_eq!(report.partial_failures[0].unit, FetchUnit::Resource(12));
    assert!(db::find_event(&pool, 3).await.unwrap().is_none());

    // Jazz Night was filtered out before its place was needed.
    let mut fetched = places.calls().await;
    fetched.sort();
    fetched.dedup();
    assert_eq!(fetched, vec![10, 12]);

    let stored = db::find_event(&pool, 1).await.unwrap().unwrap();
    assert_eq!(stored.place_id, Some(10));
    assert!(!stored.is_sent);
    assert_eq!(db::event_dates(&pool, 1).await.unwrap().len(), 1);
    assert!(db::find_event(&pool, 2).await.unwrap().is_none());
    assert_eq!(catalog.calls.lock().await.len(), 2);
}

#[tokio::test]
async fn identical_second_cycle_reports_nothing() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .set(
            vec![event(1, "Green Day Live", Some(10), "2000")],
            vec![event(4, "Korn acoustic", None, "")],
        )
        .await;
    let places = RecordingPlaces::with(vec![place(10)]);
    let sync = build(&pool, &catalog, &places, interests());

    let first = run_cycle(&sync).await.unwrap();
    assert_eq!(first.reported.len(), 2);

    let second = run_cycle(&sync).await.unwrap();
    assert!(second.reported.is_empty());
    assert_eq!(second.unchanged, 2);
    // Known places are not fetched again.
    assert_eq!(places.calls().await, vec![10]);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn changed_event_is_replaced_and_reported_as_updated() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .set(vec![event(1, "Korn", Some(10), "100")], vec![])
        .await;
    let places = RecordingPlaces::with(vec![place(10)]);
    let sync = build(&pool, &catalog, &places, interests());

    run_cycle(&sync).await.unwrap();
    db::mark_event_sent(&pool, 1).await.unwrap();

    catalog
        .set(vec![event(1, "Korn", Some(10), "150")], vec![])
        .await;
    let report = run_cycle(&sync).await.unwrap();

    assert_eq!(report.reported.len(), 1);
    assert!(report.reported[0].updated);
    assert_eq!(report.reported[0].price, "150");
    assert_eq!(report.reported[0].place, Some(place(10)));

    let stored = db::find_event(&pool, 1).await.unwrap().unwrap();
    assert_eq!(stored.price, "150");
    assert!(stored.updated);
    assert!(!stored.is_sent);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE event_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn fatal_interest_fetch_yields_no_result_and_logs() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .set(vec![event(1, "Korn", None, "")], vec![])
        .await;
    let places = RecordingPlaces::default();
    let failing = StaticInterests(Err(FetchError::Provider {
        target: "user.gettopartists".into(),
        status: 403,
        message: "Invalid API key".into(),
        permanent: true,
    }));
    let sync = build(&pool, &catalog, &places, failing);

    assert!(run_cycle(&sync).await.is_none());
    assert!(catalog.calls.lock().await.is_empty());

    let (cycle, message): (String, String) =
        sqlx::query_as("SELECT cycle, message FROM sync_log ORDER BY id DESC LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(cycle, "events");
    assert!(message.contains("fetching"));
    assert!(message.contains("Invalid API key"));
}

#[tokio::test]
async fn fatal_page_aborts_pagination() {
    let pool = setup_pool().await;
    // Nothing registered: page 1 answers 404.
    let catalog = RecordingCatalog::default();
    let places = RecordingPlaces::default();
    let sync = build(&pool, &catalog, &places, interests());

    assert!(run_cycle(&sync).await.is_none());
    assert_eq!(catalog.calls.lock().await.len(), 1);
    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(events, 0);
}
