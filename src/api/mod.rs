pub mod acousticbrainz;
pub mod mock;
pub mod musicbrainz;
pub mod spotify;

use crate::models::{CatalogTrack, CrowdInfo, FetchOutcome, Lookup, SecondaryKey};
use std::collections::HashMap;

/// Which feature tree a bulk request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureLevel {
    Low,
    High,
}

impl FeatureLevel {
    pub fn path(&self) -> &'static str {
        match self {
            FeatureLevel::Low => "low-level",
            FeatureLevel::High => "high-level",
        }
    }
}

/// Streaming catalog: scalar metadata for up to `max_batch()` primary ids.
#[async_trait::async_trait]
pub trait CatalogService: Send + Sync {
    fn name(&self) -> &str;
    fn max_batch(&self) -> usize {
        50
    }
    /// Ids unknown upstream are simply absent from the returned map.
    async fn fetch_tracks(&self, ids: &[String]) -> FetchOutcome<HashMap<String, CatalogTrack>>;
}

/// Crowd-sourced metadata: secondary key resolution plus tags and rating.
#[async_trait::async_trait]
pub trait CrowdService: Send + Sync {
    fn name(&self) -> &str;
    async fn lookup_by_isrc(&self, isrc: &str) -> Lookup;
    async fn lookup_by_title_artist(&self, title: &str, artist: &str) -> Lookup;
    async fn fetch_tags_and_rating(&self, key: &str) -> FetchOutcome<CrowdInfo>;
}

/// Derived-features service. Returns the raw bulk document: secondary key ->
/// submission id -> feature document.
#[async_trait::async_trait]
pub trait FeatureService: Send + Sync {
    fn name(&self) -> &str;
    fn max_batch(&self) -> usize {
        25
    }
    async fn fetch_level(&self, level: FeatureLevel, keys: &[SecondaryKey]) -> FetchOutcome;
}
