use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{filter_by_interest, CycleReport, CycleStage, PartialFailure, StageTracker, SyncCycle};
use crate::config::Config;
use crate::db::{self, EventWrite, Pool};
use crate::dedup::{classify_event, event_fingerprint, Classification};
use crate::error::SyncError;
use crate::fetch::paginator::collect_pages;
use crate::fetch::pool::BoundedFetcher;
use crate::fetch::{FetchUnit, JsonFetcher, RetryPolicy, UnitFetcher};
use crate::model::{EventCandidate, Place, ReportedEvent};
use crate::providers::kudago::{EventsPage, KudagoEvents, KudagoPlaces};
use crate::providers::lastfm::LastfmTopArtists;
use crate::providers::InterestSource;

pub type EventsFetcher = Arc<dyn UnitFetcher<Output = EventsPage>>;
pub type PlacesFetcher = Arc<dyn UnitFetcher<Output = Place>>;

/// Events catalog cycle: keeps events matching the interest list and reports
/// the new or changed ones.
pub struct EventsSync {
    pool: Pool,
    events: EventsFetcher,
    places: PlacesFetcher,
    interests: Arc<dyn InterestSource>,
    place_fetcher: BoundedFetcher,
    policy: RetryPolicy,
}

impl EventsSync {
    pub fn new(
        pool: Pool,
        events: EventsFetcher,
        places: PlacesFetcher,
        interests: Arc<dyn InterestSource>,
        place_concurrency: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            events,
            places,
            interests,
            place_fetcher: BoundedFetcher::new(place_concurrency, policy),
            policy,
        }
    }

    pub fn from_config(pool: Pool, http: JsonFetcher, cfg: &Config) -> Self {
        Self::new(
            pool,
            Arc::new(KudagoEvents::from_config(http.clone(), cfg)),
            Arc::new(KudagoPlaces::from_config(http.clone(), cfg)),
            Arc::new(LastfmTopArtists::from_config(http, cfg)),
            cfg.kudago.place_concurrency,
            cfg.retry_policy(),
        )
    }

    /// Fetch places not yet stored. Returns the fetched places and every place
    /// id now known to be resolvable.
    async fn resolve_places(
        &self,
        events: &[EventCandidate],
        report: &mut CycleReport<ReportedEvent>,
    ) -> Result<(Vec<Place>, HashSet<i64>)> {
        let wanted: Vec<i64> = events
            .iter()
            .filter_map(EventCandidate::place_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut resolved = db::known_place_ids(&self.pool, &wanted).await?;
        let missing: Vec<FetchUnit> = wanted
            .iter()
            .filter(|id| !resolved.contains(id))
            .map(|id| FetchUnit::Resource(*id))
            .collect();

        if missing.is_empty() {
            return Ok((Vec::new(), resolved));
        }

        info!(known = resolved.len(), missing = missing.len(), "fetching places");
        let fetched = self.place_fetcher.fetch_all(self.places.as_ref(), missing).await;
        report
            .partial_failures
            .extend(fetched.failures().cloned().map(PartialFailure::from));
        resolved.extend(fetched.successes.iter().map(|p| p.id));
        Ok((fetched.successes, resolved))
    }
}

#[async_trait]
impl SyncCycle for EventsSync {
    type Record = ReportedEvent;

    fn name(&self) -> &'static str {
        "events"
    }

    fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn execute(
        &self,
        run_id: Uuid,
        stages: &mut StageTracker,
    ) -> Result<CycleReport<ReportedEvent>, SyncError> {
        let mut report = CycleReport::new(run_id);

        stages.enter(CycleStage::Fetching);
        let interests = self.interests.interests().await?;
        if interests.is_empty() {
            warn!("interest list is empty; nothing will be kept");
        }
        let candidates =
            collect_pages(self.events.as_ref(), FetchUnit::Page(1), &self.policy).await?;
        info!(interests = interests.len(), candidates = candidates.len(), "events fetched");

        stages.enter(CycleStage::Filtering);
        let kept = filter_by_interest(candidates, &interests);
        info!(kept = kept.len(), "events matched interests");

        stages.enter(CycleStage::ResolvingReferences);
        let (new_places, resolved) = self.resolve_places(&kept, &mut report).await?;
        let (kept, unresolved): (Vec<_>, Vec<_>) = kept
            .into_iter()
            .partition(|e| e.place_id().map_or(true, |id| resolved.contains(&id)));
        if !unresolved.is_empty() {
            let ids: Vec<i64> = unresolved.iter().map(|e| e.id).collect();
            warn!(?ids, "dropping events with unresolved places");
            report.dropped = unresolved.len();
        }

        stages.enter(CycleStage::Deduplicating);
        let mut fingerprints = Vec::with_capacity(kept.len());
        for event in &kept {
            let fingerprint = event_fingerprint(event);
            let class = classify_event(&self.pool, event, &fingerprint).await?;
            fingerprints.push((fingerprint, class));
        }
        let writes: Vec<EventWrite<'_>> = kept
            .iter()
            .zip(&fingerprints)
            .filter(|(_, (_, class))| *class != Classification::Unchanged)
            .map(|(event, (fingerprint, class))| EventWrite {
                candidate: event,
                fingerprint,
                replace: *class == Classification::Changed,
            })
            .collect();
        report.unchanged = kept.len() - writes.len();

        stages.enter(CycleStage::Persisting);
        if !writes.is_empty() || !new_places.is_empty() {
            db::persist_events(&self.pool, &new_places, &writes).await?;
        }

        stages.enter(CycleStage::Reporting);
        let place_ids: Vec<i64> = writes
            .iter()
            .filter_map(|w| w.candidate.place_id())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut places: HashMap<i64, Place> = db::load_places(&self.pool, &place_ids).await?;
        for place in new_places {
            places.insert(place.id, place);
        }
        report.reported = writes
            .iter()
            .map(|w| {
                let event = w.candidate;
                ReportedEvent {
                    event_id: event.id,
                    title: event.title.clone(),
                    slug: event.slug.clone(),
                    price: event.price.clone(),
                    place: event.place_id().and_then(|id| places.get(&id).cloned()),
                    dates: event.dates.clone(),
                    updated: w.replace,
                }
            })
            .collect();

        Ok(report)
    }
}
