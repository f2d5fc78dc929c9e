//! Listening-history provider: page-numbered recent tracks and top artists.
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::fmt::Display;
use std::str::FromStr;

use super::InterestSource;
use crate::config::Config;
use crate::error::FetchError;
use crate::fetch::paginator::{collect_pages, CursorPage};
use crate::fetch::{
    is_permanent_status, FetchOutcome, FetchUnit, JsonFetcher, ProviderFailure, RetryPolicy,
    UnitFetcher,
};
use crate::model::Scrobble;

/// The API only serves up to this many top artists per page.
const MAX_TOP_ARTISTS_PER_PAGE: u32 = 1000;

/// Numbers arrive as strings (`"totalPages": "12"`); accept both forms.
fn de_stringy<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stringy<T> {
        Num(T),
        Text(String),
    }
    match Stringy::<T>::deserialize(d)? {
        Stringy::Num(n) => Ok(n),
        Stringy::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

/// A lone item is sometimes sent as an object instead of a one-element list.
fn de_one_or_many<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }
    Ok(match OneOrMany::<T>::deserialize(d)? {
        OneOrMany::Many(v) => v,
        OneOrMany::One(t) => vec![t],
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PageAttr {
    #[serde(deserialize_with = "de_stringy")]
    pub page: u32,
    #[serde(rename = "totalPages", deserialize_with = "de_stringy")]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Named {
    #[serde(default)]
    pub mbid: String,
    #[serde(rename = "#text")]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrackAttr {
    #[serde(default)]
    pub nowplaying: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrackDate {
    #[serde(deserialize_with = "de_stringy")]
    pub uts: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RawTrack {
    pub artist: Named,
    pub album: Named,
    pub name: String,
    #[serde(default)]
    pub mbid: String,
    #[serde(rename = "@attr", default)]
    pub attr: Option<TrackAttr>,
    #[serde(default)]
    pub date: Option<TrackDate>,
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

impl RawTrack {
    pub fn is_now_playing(&self) -> bool {
        self.attr
            .as_ref()
            .and_then(|a| a.nowplaying.as_deref())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// `None` for the now-playing entry, which has no timestamp yet.
    pub fn into_scrobble(self) -> Option<Scrobble> {
        if self.is_now_playing() {
            return None;
        }
        let date = self.date?;
        Some(Scrobble {
            artist: self.artist.text,
            artist_mbid: non_empty(self.artist.mbid),
            album: self.album.text,
            album_mbid: non_empty(self.album.mbid),
            track: self.name,
            track_mbid: non_empty(self.mbid),
            scrobbled_at: date.uts,
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RecentTracks {
    #[serde(rename = "track", default, deserialize_with = "de_one_or_many")]
    pub tracks: Vec<RawTrack>,
    #[serde(rename = "@attr")]
    pub attr: PageAttr,
}

/// `{recenttracks: {track: [...], @attr: {totalPages, ...}}}`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RecentTracksPage {
    pub recenttracks: RecentTracks,
}

impl RecentTracksPage {
    pub fn total_pages(&self) -> u32 {
        self.recenttracks.attr.total_pages
    }

    pub fn into_scrobbles(self) -> Vec<Scrobble> {
        self.recenttracks
            .tracks
            .into_iter()
            .filter_map(RawTrack::into_scrobble)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TopArtist {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TopArtists {
    #[serde(default, deserialize_with = "de_one_or_many")]
    pub artist: Vec<TopArtist>,
    #[serde(rename = "@attr")]
    pub attr: PageAttr,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TopArtistsPage {
    pub topartists: TopArtists,
    /// Artists wanted in total; set by the fetcher, not the provider.
    #[serde(skip)]
    pub wanted: u32,
}

impl CursorPage for TopArtistsPage {
    type Item = String;

    fn into_parts(self) -> (Option<FetchUnit>, Vec<String>) {
        let attr = &self.topartists.attr;
        let per_page = self.topartists.artist.len() as u32;
        let collected = attr.page.saturating_mul(per_page.max(1));
        let next = if attr.page < attr.total_pages && per_page > 0 && collected < self.wanted {
            Some(FetchUnit::Page(attr.page + 1))
        } else {
            None
        };
        let names = self.topartists.artist.into_iter().map(|a| a.name).collect();
        (next, names)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<i64>,
    message: Option<String>,
}

/// Error envelope is `{"error": <code>, "message": "..."}`. Codes 8, 11, 16
/// and 29 are transient; every other code is permanent.
pub fn interpret_error(status: StatusCode, body: &str) -> ProviderFailure {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(code),
            message,
        }) => ProviderFailure {
            message: format!("error {}: {}", code, message.unwrap_or_default()),
            permanent: !matches!(code, 8 | 11 | 16 | 29),
        },
        _ => ProviderFailure {
            message: body.chars().take(200).collect(),
            permanent: is_permanent_status(status),
        },
    }
}

#[derive(Debug, Clone)]
struct Account {
    base_url: String,
    username: String,
    api_key: String,
}

impl Account {
    fn from_config(cfg: &Config) -> Self {
        Self {
            base_url: cfg.lastfm.base_url.clone(),
            username: cfg.lastfm.username.clone(),
            api_key: cfg.lastfm.api_key.clone(),
        }
    }

    fn url(&self, method: &str, extra: &[(&str, String)]) -> Result<String, FetchError> {
        let mut params: Vec<(&str, String)> = vec![
            ("method", method.to_string()),
            ("user", self.username.clone()),
            ("api_key", self.api_key.clone()),
            ("format", "json".to_string()),
        ];
        params.extend(extra.iter().cloned());
        Url::parse_with_params(&self.base_url, &params)
            .map(String::from)
            .map_err(|e| FetchError::Provider {
                target: self.base_url.clone(),
                status: 0,
                message: format!("invalid base url: {}", e),
                permanent: true,
            })
    }
}

/// `user.getrecenttracks`, addressed by page number.
#[derive(Debug, Clone)]
pub struct LastfmRecentTracks {
    http: JsonFetcher,
    account: Account,
    page_size: u32,
}

impl LastfmRecentTracks {
    pub fn from_config(http: JsonFetcher, cfg: &Config) -> Self {
        Self {
            http,
            account: Account::from_config(cfg),
            page_size: cfg.lastfm.page_size,
        }
    }

    pub fn page_url(&self, page: u32) -> Result<String, FetchError> {
        self.account.url(
            "user.getrecenttracks",
            &[
                ("limit", self.page_size.to_string()),
                ("page", page.to_string()),
            ],
        )
    }
}

#[async_trait]
impl UnitFetcher for LastfmRecentTracks {
    type Output = RecentTracksPage;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<RecentTracksPage> {
        let FetchUnit::Page(page) = unit else {
            return FetchOutcome::Fatal(FetchError::SchemaViolation {
                target: unit.to_string(),
                message: "unsupported fetch unit".into(),
            });
        };
        let result = match self.page_url(*page) {
            Ok(url) => self.http.get(&url, interpret_error).await,
            Err(err) => Err(err),
        };
        FetchOutcome::from_result(result)
    }
}

/// `user.gettopartists` over the whole listening history; the interest list.
#[derive(Debug, Clone)]
pub struct LastfmTopArtists {
    http: JsonFetcher,
    account: Account,
    limit: u32,
    policy: RetryPolicy,
}

impl LastfmTopArtists {
    pub fn from_config(http: JsonFetcher, cfg: &Config) -> Self {
        Self {
            http,
            account: Account::from_config(cfg),
            limit: cfg.lastfm.top_artists_limit,
            policy: cfg.retry_policy(),
        }
    }

    pub fn page_url(&self, page: u32) -> Result<String, FetchError> {
        self.account.url(
            "user.gettopartists",
            &[
                ("period", "overall".to_string()),
                ("limit", self.limit.min(MAX_TOP_ARTISTS_PER_PAGE).to_string()),
                ("page", page.to_string()),
            ],
        )
    }
}

#[async_trait]
impl UnitFetcher for LastfmTopArtists {
    type Output = TopArtistsPage;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<TopArtistsPage> {
        let FetchUnit::Page(page) = unit else {
            return FetchOutcome::Fatal(FetchError::SchemaViolation {
                target: unit.to_string(),
                message: "unsupported fetch unit".into(),
            });
        };
        let result = match self.page_url(*page) {
            Ok(url) => self.http.get::<TopArtistsPage>(&url, interpret_error).await,
            Err(err) => Err(err),
        };
        FetchOutcome::from_result(result.map(|mut p| {
            p.wanted = self.limit;
            p
        }))
    }
}

#[async_trait]
impl InterestSource for LastfmTopArtists {
    async fn interests(&self) -> Result<Vec<String>, FetchError> {
        let mut names = collect_pages(self, FetchUnit::Page(1), &self.policy).await?;
        names.truncate(self.limit as usize);
        Ok(names)
    }
}
