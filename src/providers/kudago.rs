//! Events catalog provider: cursor-paged event listing plus per-id place lookups.
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::Config;
use crate::error::FetchError;
use crate::fetch::paginator::CursorPage;
use crate::fetch::{
    is_permanent_status, FetchOutcome, FetchUnit, JsonFetcher, ProviderFailure, UnitFetcher,
};
use crate::model::{EventCandidate, Place};

/// `{count, next, previous, results}` envelope of the events listing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EventsPage {
    pub count: i64,
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<EventCandidate>,
}

impl CursorPage for EventsPage {
    type Item = EventCandidate;

    fn into_parts(self) -> (Option<FetchUnit>, Vec<EventCandidate>) {
        let next = self.next.filter(|u| !u.trim().is_empty()).map(FetchUnit::Url);
        (next, self.results)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

/// Error bodies look like `{"detail": "..."}`.
pub fn interpret_error(status: StatusCode, body: &str) -> ProviderFailure {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail)
        .unwrap_or_else(|| body.chars().take(200).collect());
    ProviderFailure {
        message,
        permanent: is_permanent_status(status),
    }
}

fn unsupported(unit: &FetchUnit) -> FetchError {
    FetchError::SchemaViolation {
        target: unit.to_string(),
        message: "unsupported fetch unit".into(),
    }
}

/// Event listing. `Page(n)` builds the first URL from the template; `Url`
/// follows a `next` pointer verbatim.
#[derive(Debug, Clone)]
pub struct KudagoEvents {
    http: JsonFetcher,
    url_template: String,
}

impl KudagoEvents {
    pub fn new(http: JsonFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }

    pub fn from_config(http: JsonFetcher, cfg: &Config) -> Self {
        Self::new(http, cfg.kudago.events_url.clone())
    }

    pub fn page_url(&self, page: u32, since: i64) -> String {
        self.url_template
            .replace("{page}", &page.to_string())
            .replace("{since}", &since.to_string())
    }
}

#[async_trait]
impl UnitFetcher for KudagoEvents {
    type Output = EventsPage;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<EventsPage> {
        let url = match unit {
            FetchUnit::Page(n) => self.page_url(*n, chrono::Utc::now().timestamp()),
            FetchUnit::Url(url) => url.clone(),
            FetchUnit::Resource(_) => return FetchOutcome::Fatal(unsupported(unit)),
        };
        FetchOutcome::from_result(self.http.get(&url, interpret_error).await)
    }
}

/// Place details, one request per `Resource(place_id)`.
#[derive(Debug, Clone)]
pub struct KudagoPlaces {
    http: JsonFetcher,
    url_template: String,
}

impl KudagoPlaces {
    pub fn new(http: JsonFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }

    pub fn from_config(http: JsonFetcher, cfg: &Config) -> Self {
        Self::new(http, cfg.kudago.place_url.clone())
    }

    pub fn place_url(&self, id: i64) -> String {
        self.url_template.replace("{id}", &id.to_string())
    }
}

#[async_trait]
impl UnitFetcher for KudagoPlaces {
    type Output = Place;

    async fn fetch(&self, unit: &FetchUnit) -> FetchOutcome<Place> {
        let FetchUnit::Resource(id) = unit else {
            return FetchOutcome::Fatal(unsupported(unit));
        };
        let url = self.place_url(*id);
        let result = self
            .http
            .get::<Place>(&url, interpret_error)
            .await
            .and_then(|place| check_place_id(*id, place, &url));
        FetchOutcome::from_result(result)
    }
}

fn check_place_id(requested: i64, place: Place, url: &str) -> Result<Place, FetchError> {
    if place.id != requested {
        return Err(FetchError::SchemaViolation {
            target: crate::fetch::redact_url(url),
            message: format!("asked for place {} but got {}", requested, place.id),
        });
    }
    Ok(place)
}
