use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Primary identifier of one track (the last segment of a catalog URI).
pub type WorkItem = String;

/// Cross-service recording identifier resolved for a track.
pub type SecondaryKey = String;

/// Primary id -> enrichment record. Serialized as a pretty JSON object.
pub type Dataset = BTreeMap<WorkItem, EnrichmentRecord>;

/// Primary ids whose record is final for the current run.
pub type DoneSet = BTreeSet<WorkItem>;

/// The enumerated scalar fields the engine knows how to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    // catalog service
    TrackName,
    ArtistName,
    DurationMs,
    Explicit,
    Popularity,
    ReleaseDate,
    Isrc,
    // crowd metadata service
    Mbid,
    GenreMb,
    RatingValue,
    RatingVotes,
    // derived-features service, low-level
    Bpm,
    Energy,
    DanceabilityLl,
    Loudness,
    // derived-features service, high-level payload
    Highlevel,
}

impl Field {
    pub fn key(&self) -> &'static str {
        match self {
            Field::TrackName => "track_name",
            Field::ArtistName => "artist_name",
            Field::DurationMs => "duration_ms",
            Field::Explicit => "explicit",
            Field::Popularity => "popularity",
            Field::ReleaseDate => "release_date",
            Field::Isrc => "isrc",
            Field::Mbid => "mbid",
            Field::GenreMb => "genre_mb",
            Field::RatingValue => "rating_value",
            Field::RatingVotes => "rating_votes",
            Field::Bpm => "bpm",
            Field::Energy => "energy",
            Field::DanceabilityLl => "danceability_ll",
            Field::Loudness => "loudness",
            Field::Highlevel => "highlevel",
        }
    }

    /// Merge policy used when the configuration does not override it.
    pub fn default_policy(&self) -> MergePolicy {
        match self {
            Field::Highlevel => MergePolicy::Replace,
            _ => MergePolicy::FillMissing,
        }
    }
}

/// Top-level fields derived from the previous flat shape of the high-level
/// payload. They are removed whenever `highlevel` is replaced.
pub const OBSOLETE_HIGHLEVEL_FIELDS: [&str; 4] =
    ["top_genre_hl", "danceability_hl", "mood_happy", "acousticness"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Write only when the stored value is null or absent.
    FillMissing,
    /// Overwrite with any non-null upstream value; nulls never clobber.
    Refresh,
    /// Overwrite unconditionally and drop fields derived from the old payload.
    Replace,
}

/// One output record. Kept as a JSON object so fields written by earlier
/// tooling survive a round trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrichmentRecord(Map<String, Value>);

impl EnrichmentRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.0.get(field.key()).filter(|v| !v.is_null())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_missing(&self, field: Field) -> bool {
        self.get(field).is_none()
    }

    pub fn str_field(&self, field: Field) -> Option<&str> {
        self.get(field).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn mbid(&self) -> Option<&str> {
        self.str_field(Field::Mbid)
    }

    /// Make sure every enumerated field is present, as null when unknown.
    pub fn ensure_fields(&mut self, fields: &[Field]) {
        for f in fields {
            self.0.entry(f.key().to_string()).or_insert(Value::Null);
        }
    }

    /// Apply one upstream value under `policy`. Returns true if the record changed.
    pub fn apply(&mut self, field: Field, value: Option<Value>, policy: MergePolicy) -> bool {
        let value = value.unwrap_or(Value::Null);
        match policy {
            MergePolicy::FillMissing => {
                if value.is_null() || !self.is_missing(field) {
                    self.0.entry(field.key().to_string()).or_insert(Value::Null);
                    return false;
                }
                self.0.insert(field.key().to_string(), value);
                true
            }
            MergePolicy::Refresh => {
                if value.is_null() {
                    self.0.entry(field.key().to_string()).or_insert(Value::Null);
                    return false;
                }
                let changed = self.0.get(field.key()) != Some(&value);
                self.0.insert(field.key().to_string(), value);
                changed
            }
            MergePolicy::Replace => {
                let changed = self.0.get(field.key()) != Some(&value);
                self.0.insert(field.key().to_string(), value);
                changed
            }
        }
    }

    /// Remove a set of top-level keys, returning how many existed.
    pub fn remove_keys(&mut self, keys: &[&str]) -> usize {
        keys.iter().filter(|k| self.0.remove(**k).is_some()).count()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for EnrichmentRecord {
    fn from(m: Map<String, Value>) -> Self {
        Self(m)
    }
}

/// Result of one logical fetch through the rate-limited fetcher.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T = Value> {
    Data(T),
    /// Permanent for this run: upstream does not know the identifier.
    NotFound,
    /// Retries exhausted or a non-retryable upstream error.
    Failed(String),
}

impl<T> FetchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Data(t) => FetchOutcome::Data(f(t)),
            FetchOutcome::NotFound => FetchOutcome::NotFound,
            FetchOutcome::Failed(e) => FetchOutcome::Failed(e),
        }
    }

    pub fn data(self) -> Option<T> {
        match self {
            FetchOutcome::Data(t) => Some(t),
            _ => None,
        }
    }
}

/// Outcome of resolving a secondary key for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(SecondaryKey),
    NotFound,
    Error(String),
}

impl Lookup {
    pub fn key(&self) -> Option<&str> {
        match self {
            Lookup::Found(k) => Some(k),
            _ => None,
        }
    }
}

/// How a secondary key lookup was phrased. Not-found outcomes are remembered
/// per strategy so a later run can try the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LookupStrategy {
    Isrc,
    TitleArtist,
}

impl LookupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStrategy::Isrc => "isrc",
            LookupStrategy::TitleArtist => "title_artist",
        }
    }
}

/// Scalar catalog metadata for one primary id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub duration_ms: Option<u64>,
    pub explicit: Option<bool>,
    pub popularity: Option<u32>,
    pub release_date: Option<String>,
    pub isrc: Option<String>,
}

/// Tag and rating data for one secondary key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrowdInfo {
    pub genre: Option<String>,
    pub rating_value: Option<f64>,
    pub rating_votes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fill_missing_keeps_present_values() {
        let mut r = EnrichmentRecord::new();
        assert!(r.apply(Field::Bpm, Some(json!(120.0)), MergePolicy::FillMissing));
        assert!(!r.apply(Field::Bpm, Some(json!(99.0)), MergePolicy::FillMissing));
        assert!(!r.apply(Field::Bpm, None, MergePolicy::FillMissing));
        assert_eq!(r.get(Field::Bpm), Some(&json!(120.0)));
    }

    #[test]
    fn fill_missing_writes_over_explicit_null() {
        let mut r = EnrichmentRecord::from(json!({"genre_mb": null}).as_object().unwrap().clone());
        assert!(r.apply(Field::GenreMb, Some(json!("rock")), MergePolicy::FillMissing));
        assert_eq!(r.str_field(Field::GenreMb), Some("rock"));
    }

    #[test]
    fn refresh_ignores_null_upstream() {
        let mut r = EnrichmentRecord::new();
        r.apply(Field::Loudness, Some(json!(0.5)), MergePolicy::Refresh);
        assert!(!r.apply(Field::Loudness, Some(Value::Null), MergePolicy::Refresh));
        assert!(r.apply(Field::Loudness, Some(json!(0.7)), MergePolicy::Refresh));
        assert_eq!(r.get(Field::Loudness), Some(&json!(0.7)));
    }

    #[test]
    fn field_keys_serialize_like_record_keys() {
        for f in [Field::DanceabilityLl, Field::RatingVotes, Field::Highlevel] {
            let s = serde_json::to_value(f).unwrap();
            assert_eq!(s.as_str(), Some(f.key()));
        }
    }
}
