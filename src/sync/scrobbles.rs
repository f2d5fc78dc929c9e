use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{CycleReport, CycleStage, PartialFailure, StageTracker, SyncCycle};
use crate::cache::IdentifierCache;
use crate::config::Config;
use crate::db::{self, Pool, ScrobbleRow};
use crate::dedup::{classify_scrobble, Classification};
use crate::error::SyncError;
use crate::fetch::pool::BoundedFetcher;
use crate::fetch::{fetch_with_retry, FetchUnit, JsonFetcher, RetryPolicy, UnitFetcher};
use crate::model::{DictionaryKind, Scrobble};
use crate::providers::lastfm::{LastfmRecentTracks, RecentTracksPage};

pub type RecentTracksFetcher = Arc<dyn UnitFetcher<Output = RecentTracksPage>>;

/// Listening-history cycle: stores every timestamped scrobble not seen before.
pub struct ScrobbleSync {
    pool: Pool,
    pages: RecentTracksFetcher,
    cache: Arc<IdentifierCache>,
    fetcher: BoundedFetcher,
    policy: RetryPolicy,
    max_pages: Option<u32>,
}

impl ScrobbleSync {
    pub fn new(
        pool: Pool,
        pages: RecentTracksFetcher,
        cache: Arc<IdentifierCache>,
        concurrency: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            pages,
            cache,
            fetcher: BoundedFetcher::new(concurrency, policy),
            policy,
            max_pages: None,
        }
    }

    /// Only look at the most recent `max_pages` pages.
    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn from_config(
        pool: Pool,
        http: JsonFetcher,
        cache: Arc<IdentifierCache>,
        cfg: &Config,
    ) -> Self {
        Self::new(
            pool,
            Arc::new(LastfmRecentTracks::from_config(http, cfg)),
            cache,
            cfg.lastfm.concurrency,
            cfg.retry_policy(),
        )
        .with_max_pages(cfg.lastfm.max_pages)
    }

    async fn resolve(&self, scrobble: &Scrobble) -> anyhow::Result<ScrobbleRow> {
        let store = &self.pool;
        let artist_id = self
            .cache
            .resolve(
                store,
                DictionaryKind::Artist,
                &scrobble.artist,
                scrobble.artist_mbid.as_deref(),
            )
            .await?;
        let album_id = self
            .cache
            .resolve(
                store,
                DictionaryKind::Album,
                &scrobble.album,
                scrobble.album_mbid.as_deref(),
            )
            .await?;
        let track_id = self
            .cache
            .resolve(
                store,
                DictionaryKind::Track,
                &scrobble.track,
                scrobble.track_mbid.as_deref(),
            )
            .await?;
        Ok(ScrobbleRow {
            artist_id,
            album_id,
            track_id,
            scrobbled_at: scrobble.scrobbled_at,
        })
    }
}

#[async_trait]
impl SyncCycle for ScrobbleSync {
    type Record = Scrobble;

    fn name(&self) -> &'static str {
        "scrobbles"
    }

    fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn execute(
        &self,
        run_id: Uuid,
        stages: &mut StageTracker,
    ) -> Result<CycleReport<Scrobble>, SyncError> {
        let mut report = CycleReport::new(run_id);
        let purged = self.cache.purge_expired();
        if purged > 0 {
            info!(purged, "expired identifier cache entries");
        }

        stages.enter(CycleStage::Fetching);
        let first =
            fetch_with_retry(self.pages.as_ref(), &FetchUnit::Page(1), &self.policy).await?;
        let mut total = first.total_pages().max(1);
        if let Some(cap) = self.max_pages {
            total = total.min(cap.max(1));
        }
        let rest = self
            .fetcher
            .fetch_all(self.pages.as_ref(), (2..=total).map(FetchUnit::Page))
            .await;
        report
            .partial_failures
            .extend(rest.failures().cloned().map(PartialFailure::from));
        info!(pages = total, fetched = rest.successes.len() + 1, "history pages fetched");

        stages.enter(CycleStage::Filtering);
        // Now-playing entries carry no timestamp and never become a Scrobble.
        let mut by_time: BTreeMap<i64, Scrobble> = BTreeMap::new();
        for scrobble in std::iter::once(first)
            .chain(rest.successes)
            .flat_map(RecentTracksPage::into_scrobbles)
        {
            by_time.entry(scrobble.scrobbled_at).or_insert(scrobble);
        }

        stages.enter(CycleStage::ResolvingReferences);
        let mut resolved = Vec::with_capacity(by_time.len());
        for scrobble in by_time.into_values() {
            let row = self.resolve(&scrobble).await?;
            resolved.push((scrobble, row));
        }

        stages.enter(CycleStage::Deduplicating);
        let mut fresh = Vec::new();
        for (scrobble, row) in resolved {
            match classify_scrobble(&self.pool, &scrobble).await? {
                Classification::New => fresh.push((scrobble, row)),
                _ => report.unchanged += 1,
            }
        }

        stages.enter(CycleStage::Persisting);
        let rows: Vec<ScrobbleRow> = fresh.iter().map(|(_, row)| *row).collect();
        let written = if rows.is_empty() {
            0
        } else {
            db::insert_scrobbles(&self.pool, &rows).await?
        };

        stages.enter(CycleStage::Reporting);
        info!(written, "scrobbles stored");
        report.reported = fresh.into_iter().map(|(scrobble, _)| scrobble).collect();
        Ok(report)
    }
}
