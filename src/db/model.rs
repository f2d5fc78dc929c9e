//! Row and write models used by repositories.
//!
//! Keep these structs focused on the data moved by queries. Classification
//! and sync logic live in higher layers.

use crate::model::EventCandidate;

/// Stored event slice used for change detection and assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub event_id: i64,
    pub title: String,
    pub slug: String,
    pub place_id: Option<i64>,
    pub price: String,
    pub fingerprint: String,
    pub is_sent: bool,
    pub updated: bool,
}

/// One event to write during the persisting stage.
#[derive(Debug, Clone)]
pub struct EventWrite<'a> {
    pub candidate: &'a EventCandidate,
    pub fingerprint: &'a str,
    /// Delete the existing row (and its dates) first and flag the new one as updated.
    pub replace: bool,
}

/// A scrobble with its dictionary references already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrobbleRow {
    pub artist_id: i64,
    pub album_id: i64,
    pub track_id: i64,
    pub scrobbled_at: i64,
}
