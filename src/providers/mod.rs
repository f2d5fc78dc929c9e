//! External data sources.
use async_trait::async_trait;

use crate::error::FetchError;

pub mod kudago;
pub mod lastfm;

/// Ranked entity names used to decide which events are worth keeping.
#[async_trait]
pub trait InterestSource: Send + Sync {
    async fn interests(&self) -> Result<Vec<String>, FetchError>;
}
