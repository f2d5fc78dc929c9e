//! Cursor pagination: follow each page's "next" pointer until it is absent.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::{fetch_with_retry, FetchUnit, RetryPolicy, UnitFetcher};
use crate::error::FetchError;

/// A decoded page that knows where the next one lives.
pub trait CursorPage {
    type Item;

    fn into_parts(self) -> (Option<FetchUnit>, Vec<Self::Item>);
}

/// Walk the pointer chain from `start` and concatenate every batch in page order.
///
/// Each page gets the single-unit retry discipline; a fatal failure (or a
/// retryable one that outlives its rounds) aborts the whole walk.
pub async fn collect_pages<F>(
    fetcher: &F,
    start: FetchUnit,
    policy: &RetryPolicy,
) -> Result<Vec<<F::Output as CursorPage>::Item>, FetchError>
where
    F: UnitFetcher + ?Sized,
    F::Output: CursorPage,
{
    let mut items = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(start);
    let mut pages = 0usize;

    while let Some(unit) = next.take() {
        if !visited.insert(unit.clone()) {
            warn!(%unit, "pagination cycle detected; stopping");
            break;
        }
        let page = fetch_with_retry(fetcher, &unit, policy).await?;
        let (following, batch) = page.into_parts();
        pages += 1;
        debug!(%unit, items = batch.len(), "page collected");
        items.extend(batch);
        next = following;
    }

    debug!(pages, items = items.len(), "pagination finished");
    Ok(items)
}
