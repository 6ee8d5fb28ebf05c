use super::CatalogService;
use crate::config::SPOTIFY;
use crate::fetcher::RateLimitedFetcher;
use crate::models::{CatalogTrack, FetchOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::AUTHORIZATION;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";
pub const DEFAULT_AUTH_BASE: &str = "https://accounts.spotify.com";

#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: i64, // epoch seconds
}

/// Catalog client for the Spotify Web API, authenticated with the
/// client-credentials grant. Requests go through the shared fetcher.
pub struct SpotifyCatalog {
    fetcher: Arc<RateLimitedFetcher>,
    client_id: String,
    client_secret: String,
    api_base: String,
    auth_base: String,
    token: tokio::sync::Mutex<Option<AppToken>>,
}

impl SpotifyCatalog {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, client_id: String, client_secret: String) -> Self {
        let api_base = fetcher
            .policy(SPOTIFY)
            .base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            fetcher,
            client_id,
            client_secret,
            auth_base: DEFAULT_AUTH_BASE.to_string(),
            api_base,
            token: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_auth_base(mut self, base: impl Into<String>) -> Self {
        self.auth_base = base.into();
        self
    }

    pub fn is_authenticated(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    async fn request_token(&self) -> Result<AppToken> {
        let auth_header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret))
        );
        let url = format!("{}/api/token", self.auth_base);
        self.fetcher.wait_turn(SPOTIFY).await;
        let resp = self
            .fetcher
            .client()
            .post(&url)
            .header(AUTHORIZATION, auth_header)
            .form(&[("grant_type", "client_credentials")])
            .timeout(self.fetcher.policy(SPOTIFY).timeout())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("token request failed: {} - {}", status, body));
        }
        let j: serde_json::Value = resp.json().await?;
        let access_token = j["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("no access_token"))?
            .to_string();
        let expires_in = j["expires_in"].as_i64().unwrap_or(3600);
        Ok(AppToken {
            access_token,
            expires_at: Utc::now().timestamp() + expires_in,
        })
    }

    async fn get_bearer(&self) -> Result<String> {
        let mut lock = self.token.lock().await;
        let fresh = match &*lock {
            Some(t) => Utc::now().timestamp() + 30 < t.expires_at,
            None => false,
        };
        if !fresh {
            debug!("Requesting new Spotify app token");
            *lock = Some(self.request_token().await?);
        }
        let t = lock.as_ref().ok_or_else(|| anyhow!("no token loaded"))?;
        Ok(format!("Bearer {}", t.access_token))
    }
}

fn parse_track(tr: &serde_json::Value) -> CatalogTrack {
    CatalogTrack {
        track_name: tr["name"].as_str().map(String::from),
        artist_name: tr["artists"][0]["name"].as_str().map(String::from),
        duration_ms: tr["duration_ms"].as_u64(),
        explicit: tr["explicit"].as_bool(),
        popularity: tr["popularity"].as_u64().map(|p| p as u32),
        release_date: tr["album"]["release_date"].as_str().map(String::from),
        isrc: tr["external_ids"]["isrc"].as_str().map(String::from),
    }
}

/// Map a `/tracks?ids=` response by track id. Null entries are skipped.
pub fn parse_tracks_response(j: &serde_json::Value) -> HashMap<String, CatalogTrack> {
    let mut out = HashMap::new();
    if let Some(items) = j["tracks"].as_array() {
        for tr in items {
            if let Some(id) = tr["id"].as_str() {
                out.insert(id.to_string(), parse_track(tr));
            }
        }
    }
    out
}

#[async_trait]
impl CatalogService for SpotifyCatalog {
    fn name(&self) -> &str {
        SPOTIFY
    }

    async fn fetch_tracks(&self, ids: &[String]) -> FetchOutcome<HashMap<String, CatalogTrack>> {
        if ids.is_empty() {
            return FetchOutcome::Data(HashMap::new());
        }
        let bearer = match self.get_bearer().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Spotify authentication failed: {}", e);
                return FetchOutcome::Failed(e.to_string());
            }
        };
        let url = format!("{}/tracks", self.api_base);
        let joined = ids.join(",");
        self.fetcher
            .fetch_json(SPOTIFY, |c| {
                c.get(&url)
                    .query(&[("ids", joined.as_str())])
                    .header(AUTHORIZATION, &bearer)
            })
            .await
            .map(|j| parse_tracks_response(&j))
    }
}
