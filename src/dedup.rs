//! New / Unchanged / Changed classification against the store.
use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::db::{self, Pool};
use crate::model::{EventCandidate, Scrobble};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    New,
    Unchanged,
    Changed,
}

/// SHA-256 over the attributes that make an event worth re-announcing. Dates
/// are hashed as a sorted set, so provider ordering alone never changes it.
pub fn event_fingerprint(event: &EventCandidate) -> String {
    let mut hasher = Sha256::new();
    match event.place_id() {
        Some(id) => hasher.update(id.to_string()),
        None => hasher.update("-"),
    }
    for field in [&event.price, &event.title, &event.slug] {
        hasher.update([0u8]);
        hasher.update(field.as_bytes());
    }
    let mut dates: Vec<(i64, i64)> = event.dates.iter().map(|d| (d.start, d.end)).collect();
    dates.sort_unstable();
    for (start, end) in dates {
        hasher.update([0u8]);
        hasher.update(format!("{}:{}", start, end));
    }
    hex::encode(hasher.finalize())
}

/// Events are keyed by provider id; a differing fingerprint means Changed.
pub async fn classify_event(
    pool: &Pool,
    event: &EventCandidate,
    fingerprint: &str,
) -> Result<Classification> {
    let class = match db::find_event(pool, event.id).await? {
        None => Classification::New,
        Some(row) if row.fingerprint == fingerprint => Classification::Unchanged,
        Some(_) => Classification::Changed,
    };
    Ok(class)
}

/// Scrobble timestamps are immutable once reported, so existence is enough.
pub async fn classify_scrobble(pool: &Pool, scrobble: &Scrobble) -> Result<Classification> {
    if db::scrobble_exists(pool, scrobble.scrobbled_at).await? {
        Ok(Classification::Unchanged)
    } else {
        Ok(Classification::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, PlaceRef};

    fn event() -> EventCandidate {
        EventCandidate {
            id: 1,
            title: "Korn".into(),
            slug: "korn-2024".into(),
            price: "100".into(),
            dates: vec![DateRange { start: 1, end: 2 }],
            place: Some(PlaceRef { id: 9 }),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let fp = event_fingerprint(&event());
        assert_eq!(fp, event_fingerprint(&event()));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_date_order() {
        let mut forward = event();
        forward.dates = vec![
            DateRange { start: 1, end: 2 },
            DateRange { start: 5, end: 6 },
            DateRange { start: 3, end: 4 },
        ];
        let mut reversed = forward.clone();
        reversed.dates.reverse();
        assert_eq!(event_fingerprint(&forward), event_fingerprint(&reversed));

        let mut shifted = forward.clone();
        shifted.dates[2].end = 7;
        assert_ne!(event_fingerprint(&forward), event_fingerprint(&shifted));
    }

    #[test]
    fn fingerprint_tracks_comparison_fields() {
        let base = event_fingerprint(&event());

        let mut e = event();
        e.price = "150".into();
        assert_ne!(event_fingerprint(&e), base);

        let mut e = event();
        e.place = None;
        assert_ne!(event_fingerprint(&e), base);

        let mut e = event();
        e.dates.push(DateRange { start: 3, end: 4 });
        assert_ne!(event_fingerprint(&e), base);

        // Field boundaries are separated.
        let mut a = event();
        a.price = "1".into();
        a.title = "00Korn".into();
        let mut b = event();
        b.price = "100".into();
        b.title = "Korn".into();
        b.slug = "korn-2024".into();
        assert_ne!(event_fingerprint(&a), event_fingerprint(&b));
    }
}
