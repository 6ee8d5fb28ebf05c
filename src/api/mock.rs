use super::{CatalogService, CrowdService, FeatureLevel, FeatureService};
use crate::models::{CatalogTrack, CrowdInfo, FetchOutcome, Lookup, SecondaryKey};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// In-memory collaborators used in tests and dry runs. Every call is
/// recorded so callers can assert on what was (not) requested.
#[derive(Default)]
pub struct MockCatalog {
    pub tracks: HashMap<String, CatalogTrack>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, id: &str, track: CatalogTrack) -> Self {
        self.tracks.insert(id.to_string(), track);
        self
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl CatalogService for MockCatalog {
    fn name(&self) -> &str {
        "mock-catalog"
    }

    async fn fetch_tracks(&self, ids: &[String]) -> FetchOutcome<HashMap<String, CatalogTrack>> {
        info!("MockCatalog: fetch_tracks {} ids", ids.len());
        self.calls.lock().unwrap().push(ids.to_vec());
        let found = ids
            .iter()
            .filter_map(|id| self.tracks.get(id).map(|t| (id.clone(), t.clone())))
            .collect();
        FetchOutcome::Data(found)
    }
}

#[derive(Default)]
pub struct MockCrowd {
    pub by_isrc: HashMap<String, SecondaryKey>,
    pub by_title_artist: HashMap<(String, String), SecondaryKey>,
    pub info: HashMap<SecondaryKey, CrowdInfo>,
    /// Every lookup answers with an error instead of a result.
    pub failing: bool,
    pub lookups: Mutex<Vec<String>>,
    pub info_calls: Mutex<Vec<SecondaryKey>>,
}

impl MockCrowd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isrc(mut self, isrc: &str, key: &str) -> Self {
        self.by_isrc.insert(isrc.to_string(), key.to_string());
        self
    }

    pub fn with_title_artist(mut self, title: &str, artist: &str, key: &str) -> Self {
        self.by_title_artist
            .insert((title.to_string(), artist.to_string()), key.to_string());
        self
    }

    pub fn with_info(mut self, key: &str, info: CrowdInfo) -> Self {
        self.info.insert(key.to_string(), info);
        self
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.lock().unwrap().len()
    }

    pub fn info_requests(&self) -> Vec<SecondaryKey> {
        self.info_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrowdService for MockCrowd {
    fn name(&self) -> &str {
        "mock-crowd"
    }

    async fn lookup_by_isrc(&self, isrc: &str) -> Lookup {
        self.lookups.lock().unwrap().push(format!("isrc:{}", isrc));
        if self.failing {
            return Lookup::Error("mock failure".into());
        }
        match self.by_isrc.get(isrc) {
            Some(k) => Lookup::Found(k.clone()),
            None => Lookup::NotFound,
        }
    }

    async fn lookup_by_title_artist(&self, title: &str, artist: &str) -> Lookup {
        self.lookups
            .lock()
            .unwrap()
            .push(format!("search:{}|{}", title, artist));
        if self.failing {
            return Lookup::Error("mock failure".into());
        }
        match self.by_title_artist.get(&(title.to_string(), artist.to_string())) {
            Some(k) => Lookup::Found(k.clone()),
            None => Lookup::NotFound,
        }
    }

    async fn fetch_tags_and_rating(&self, key: &str) -> FetchOutcome<CrowdInfo> {
        self.info_calls.lock().unwrap().push(key.to_string());
        match self.info.get(key) {
            Some(i) => FetchOutcome::Data(i.clone()),
            None => FetchOutcome::NotFound,
        }
    }
}

#[derive(Default)]
pub struct MockFeatures {
    /// secondary key -> raw per-key document (submission id -> features)
    pub low: HashMap<SecondaryKey, Value>,
    pub high: HashMap<SecondaryKey, Value>,
    pub failing: bool,
    pub calls: Mutex<Vec<(FeatureLevel, Vec<SecondaryKey>)>>,
}

impl MockFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_low(mut self, key: &str, raw: Value) -> Self {
        self.low.insert(key.to_string(), raw);
        self
    }

    pub fn with_high(mut self, key: &str, raw: Value) -> Self {
        self.high.insert(key.to_string(), raw);
        self
    }

    pub fn requested_keys(&self, level: FeatureLevel) -> Vec<SecondaryKey> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .flat_map(|(_, keys)| keys.clone())
            .collect()
    }
}

#[async_trait]
impl FeatureService for MockFeatures {
    fn name(&self) -> &str {
        "mock-features"
    }

    async fn fetch_level(&self, level: FeatureLevel, keys: &[SecondaryKey]) -> FetchOutcome {
        self.calls.lock().unwrap().push((level, keys.to_vec()));
        if self.failing {
            return FetchOutcome::Failed("mock failure".into());
        }
        let source = match level {
            FeatureLevel::Low => &self.low,
            FeatureLevel::High => &self.high,
        };
        let mut out = Map::new();
        for k in keys {
            if let Some(v) = source.get(k) {
                out.insert(k.clone(), v.clone());
            }
        }
        FetchOutcome::Data(Value::Object(out))
    }
}
