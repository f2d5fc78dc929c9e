use serde::{Deserialize, Serialize};

/// One `{start, end}` pair of an event, unix seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PlaceRef {
    pub id: i64,
}

/// An event as decoded from the catalog, before deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCandidate {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub price: String,
    pub dates: Vec<DateRange>,
    #[serde(default)]
    pub place: Option<PlaceRef>,
}

impl EventCandidate {
    pub fn place_id(&self) -> Option<i64> {
        self.place.map(|p| p.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Place {
    pub id: i64,
    pub title: String,
    pub address: String,
}

/// A timestamped listen. Now-playing entries never become a `Scrobble`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scrobble {
    pub artist: String,
    pub artist_mbid: Option<String>,
    pub album: String,
    pub album_mbid: Option<String>,
    pub track: String,
    pub track_mbid: Option<String>,
    pub scrobbled_at: i64,
}

/// Dictionary tables addressed by natural key (name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictionaryKind {
    Artist,
    Album,
    Track,
}

impl DictionaryKind {
    pub fn table(&self) -> &'static str {
        match self {
            DictionaryKind::Artist => "artists",
            DictionaryKind::Album => "albums",
            DictionaryKind::Track => "tracks",
        }
    }
}

/// A persisted new or changed event handed to the notifier.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReportedEvent {
    pub event_id: i64,
    pub title: String,
    pub slug: String,
    pub price: String,
    pub place: Option<Place>,
    pub dates: Vec<DateRange>,
    pub updated: bool,
}
