use super::CrowdService;
use crate::config::MUSICBRAINZ;
use crate::fetcher::RateLimitedFetcher;
use crate::models::{CrowdInfo, FetchOutcome, Lookup};
use async_trait::async_trait;
use log::debug;
use reqwest::header::ACCEPT;
use std::sync::Arc;

pub const DEFAULT_API_BASE: &str = "https://musicbrainz.org/ws/2";

/// MusicBrainz web service client. The one-request-per-second policy is
/// enforced by the fetcher's throttle for the `musicbrainz` service.
pub struct MusicBrainzClient {
    fetcher: Arc<RateLimitedFetcher>,
    api_base: String,
}

impl MusicBrainzClient {
    pub fn new(fetcher: Arc<RateLimitedFetcher>) -> Self {
        let api_base = fetcher
            .policy(MUSICBRAINZ)
            .base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self { fetcher, api_base }
    }

    async fn first_recording(&self, url: String, query: Vec<(&'static str, String)>) -> Lookup {
        let outcome = self
            .fetcher
            .fetch_json(MUSICBRAINZ, |c| {
                c.get(&url).query(&query).header(ACCEPT, "application/json")
            })
            .await;
        match outcome {
            FetchOutcome::Data(j) => match first_recording_id(&j) {
                Some(id) => Lookup::Found(id),
                None => Lookup::NotFound,
            },
            FetchOutcome::NotFound => Lookup::NotFound,
            FetchOutcome::Failed(e) => Lookup::Error(e),
        }
    }
}

/// Id of the first entry of a `recordings` list, if any.
pub fn first_recording_id(j: &serde_json::Value) -> Option<String> {
    j["recordings"]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|r| r["id"].as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Highest-count tag name (first wins on ties), rating value and vote count.
pub fn parse_tags_and_rating(j: &serde_json::Value) -> CrowdInfo {
    let mut best: Option<(i64, &str)> = None;
    if let Some(tags) = j["tags"].as_array() {
        for t in tags {
            let (Some(name), Some(count)) = (t["name"].as_str(), count_of(&t["count"])) else {
                continue;
            };
            if best.map_or(true, |(c, _)| count > c) {
                best = Some((count, name));
            }
        }
    }
    let rating = &j["rating"];
    CrowdInfo {
        genre: best.map(|(_, n)| n.to_string()),
        rating_value: rating["value"]
            .as_f64()
            .or_else(|| rating["value"].as_str().and_then(|s| s.parse().ok())),
        rating_votes: rating["votes-count"]
            .as_u64()
            .or_else(|| rating["votes-count"].as_str().and_then(|s| s.parse().ok())),
    }
}

fn count_of(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[async_trait]
impl CrowdService for MusicBrainzClient {
    fn name(&self) -> &str {
        MUSICBRAINZ
    }

    async fn lookup_by_isrc(&self, isrc: &str) -> Lookup {
        if isrc.trim().is_empty() {
            return Lookup::NotFound;
        }
        debug!("MusicBrainz isrc lookup {}", isrc);
        let url = format!("{}/isrc/{}", self.api_base, urlencoding::encode(isrc.trim()));
        self.first_recording(url, vec![("fmt", "json".to_string())]).await
    }

    async fn lookup_by_title_artist(&self, title: &str, artist: &str) -> Lookup {
        if title.trim().is_empty() || artist.trim().is_empty() {
            return Lookup::NotFound;
        }
        debug!("MusicBrainz search {} - {}", artist, title);
        let q = format!(
            "recording:\"{}\" AND artist:\"{}\"",
            title.replace('"', ""),
            artist.replace('"', "")
        );
        let url = format!("{}/recording", self.api_base);
        self.first_recording(
            url,
            vec![("query", q), ("limit", "1".to_string()), ("fmt", "json".to_string())],
        )
        .await
    }

    async fn fetch_tags_and_rating(&self, key: &str) -> FetchOutcome<CrowdInfo> {
        // `+` separates inc values and must reach the server unescaped.
        let url = format!("{}/recording/{}?inc=tags+ratings&fmt=json", self.api_base, key);
        self.fetcher
            .fetch_json(MUSICBRAINZ, |c| c.get(&url).header(ACCEPT, "application/json"))
            .await
            .map(|j| parse_tags_and_rating(&j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_highest_count_tag() {
        let j = json!({
            "tags": [
                {"name": "pop", "count": 2},
                {"name": "rock", "count": "5"},
                {"name": "indie", "count": 5},
                {"name": "broken"}
            ],
            "rating": {"value": 4.5, "votes-count": 3}
        });
        let info = parse_tags_and_rating(&j);
        assert_eq!(info.genre.as_deref(), Some("rock"));
        assert_eq!(info.rating_value, Some(4.5));
        assert_eq!(info.rating_votes, Some(3));
    }

    #[test]
    fn missing_everything_is_all_none() {
        assert_eq!(parse_tags_and_rating(&json!({})), CrowdInfo::default());
        assert_eq!(first_recording_id(&json!({"recordings": []})), None);
    }
}
