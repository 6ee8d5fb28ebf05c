use super::{FeatureLevel, FeatureService};
use crate::config::ACOUSTICBRAINZ;
use crate::fetcher::RateLimitedFetcher;
use crate::models::{FetchOutcome, SecondaryKey};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub const DEFAULT_API_BASE: &str = "https://acousticbrainz.org/api/v1";

/// Bulk client for the AcousticBrainz feature endpoints. Up to 25 recording
/// ids are joined with `;` into one request; the quota is reported through
/// the x-ratelimit-* headers and handled by the fetcher.
pub struct AcousticBrainzClient {
    fetcher: Arc<RateLimitedFetcher>,
    api_base: String,
}

impl AcousticBrainzClient {
    pub fn new(fetcher: Arc<RateLimitedFetcher>) -> Self {
        let api_base = fetcher
            .policy(ACOUSTICBRAINZ)
            .base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self { fetcher, api_base }
    }
}

#[async_trait]
impl FeatureService for AcousticBrainzClient {
    fn name(&self) -> &str {
        ACOUSTICBRAINZ
    }

    async fn fetch_level(&self, level: FeatureLevel, keys: &[SecondaryKey]) -> FetchOutcome {
        if keys.is_empty() {
            return FetchOutcome::Data(serde_json::Value::Object(Default::default()));
        }
        let url = format!("{}/{}", self.api_base, level.path());
        let ids = keys.join(";");
        let started = std::time::Instant::now();
        let outcome = self
            .fetcher
            .fetch_json(ACOUSTICBRAINZ, |c| c.get(&url).query(&[("recording_ids", ids.as_str())]))
            .await;
        info!(
            "AcousticBrainz {} for {} recordings in {:.2}s",
            level.path(),
            keys.len(),
            started.elapsed().as_secs_f64()
        );
        outcome
    }
}
