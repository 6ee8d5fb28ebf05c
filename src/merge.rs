use crate::config::Config;
use crate::models::{
    CatalogTrack, CrowdInfo, Dataset, EnrichmentRecord, Field, MergePolicy, SecondaryKey, WorkItem,
    OBSOLETE_HIGHLEVEL_FIELDS,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Scalar low-level fields and where they live inside a feature document.
pub const LOW_LEVEL_PATHS: [(Field, &str); 4] = [
    (Field::Bpm, "/rhythm/bpm"),
    (Field::Energy, "/lowlevel/dynamic_complexity"),
    (Field::DanceabilityLl, "/rhythm/danceability"),
    (Field::Loudness, "/lowlevel/average_loudness"),
];

/// Every field a finished record carries, null when unknown.
pub const RECORD_FIELDS: [Field; 16] = [
    Field::TrackName,
    Field::ArtistName,
    Field::DurationMs,
    Field::Explicit,
    Field::Popularity,
    Field::ReleaseDate,
    Field::Isrc,
    Field::Mbid,
    Field::GenreMb,
    Field::RatingValue,
    Field::RatingVotes,
    Field::Bpm,
    Field::Energy,
    Field::DanceabilityLl,
    Field::Loudness,
    Field::Highlevel,
];

/// Field-level update rules for one run.
#[derive(Debug, Clone, Default)]
pub struct MergeRules {
    pub overrides: HashMap<Field, MergePolicy>,
    pub strip_highlevel_versions: bool,
}

impl MergeRules {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            overrides: cfg.merge.clone(),
            strip_highlevel_versions: cfg.strip_highlevel_versions,
        }
    }

    pub fn with_policy(mut self, field: Field, policy: MergePolicy) -> Self {
        self.overrides.insert(field, policy);
        self
    }

    pub fn policy(&self, field: Field) -> MergePolicy {
        self.overrides
            .get(&field)
            .copied()
            .unwrap_or_else(|| field.default_policy())
    }

    fn apply(&self, record: &mut EnrichmentRecord, field: Field, value: Option<Value>) -> bool {
        let policy = self.policy(field);
        let changed = record.apply(field, value, policy);
        if field == Field::Highlevel && policy == MergePolicy::Replace {
            return record.remove_keys(&OBSOLETE_HIGHLEVEL_FIELDS) > 0 || changed;
        }
        changed
    }
}

/// Bulk responses nest each key's document under a submission id. Take the
/// lexicographically-first submission; anything that is not a non-empty
/// object yields nothing.
pub fn first_submission(raw: &Value) -> Option<&Value> {
    raw.as_object()?
        .iter()
        .min_by(|a, b| a.0.cmp(b.0))
        .map(|(_, v)| v)
}

fn scalar_at(doc: &Value, path: &str) -> Option<Value> {
    match doc.pointer(path)? {
        v @ (Value::Number(_) | Value::String(_) | Value::Bool(_)) => Some(v.clone()),
        _ => None,
    }
}

/// The enumerated low-level scalars of one feature document.
pub fn low_level_values(doc: Option<&Value>) -> Vec<(Field, Option<Value>)> {
    LOW_LEVEL_PATHS
        .iter()
        .map(|(field, path)| (*field, doc.and_then(|d| scalar_at(d, path))))
        .collect()
}

/// The `highlevel` tree of one feature document, optionally without the
/// per-feature `version` blocks. Null when absent or malformed.
pub fn high_level_payload(doc: Option<&Value>, strip_versions: bool) -> Value {
    let Some(Value::Object(tree)) = doc.and_then(|d| d.get("highlevel")) else {
        return Value::Null;
    };
    let mut tree = tree.clone();
    if strip_versions {
        for feature in tree.values_mut() {
            if let Value::Object(f) = feature {
                f.remove("version");
            }
        }
    }
    Value::Object(tree)
}

/// Apply one group's bulk feature responses to every record sharing each
/// secondary key. `None` means that level's request failed; its fields are
/// left untouched. Returns the items whose record changed.
pub fn merge_features(
    dataset: &mut Dataset,
    fanout: &BTreeMap<SecondaryKey, Vec<WorkItem>>,
    low: Option<&Value>,
    high: Option<&Value>,
    rules: &MergeRules,
) -> Vec<WorkItem> {
    let mut changed = Vec::new();
    for (key, items) in fanout {
        let low_values = low.map(|bulk| low_level_values(bulk.get(key).and_then(first_submission)));
        let high_value = high.map(|bulk| {
            high_level_payload(
                bulk.get(key).and_then(first_submission),
                rules.strip_highlevel_versions,
            )
        });
        for item in items {
            let record = dataset.entry(item.clone()).or_default();
            let mut touched = false;
            if let Some(values) = &low_values {
                for (field, value) in values {
                    touched |= rules.apply(record, *field, value.clone());
                }
            }
            if let Some(payload) = &high_value {
                touched |= rules.apply(record, Field::Highlevel, Some(payload.clone()));
            }
            if touched {
                changed.push(item.clone());
            }
        }
    }
    changed
}

pub fn merge_catalog(record: &mut EnrichmentRecord, track: &CatalogTrack, rules: &MergeRules) -> bool {
    let updates = [
        (Field::TrackName, track.track_name.as_ref().map(|v| json!(v))),
        (Field::ArtistName, track.artist_name.as_ref().map(|v| json!(v))),
        (Field::DurationMs, track.duration_ms.map(|v| json!(v))),
        (Field::Explicit, track.explicit.map(|v| json!(v))),
        (Field::Popularity, track.popularity.map(|v| json!(v))),
        (Field::ReleaseDate, track.release_date.as_ref().map(|v| json!(v))),
        (Field::Isrc, track.isrc.as_ref().map(|v| json!(v))),
    ];
    let mut changed = false;
    for (field, value) in updates {
        changed |= rules.apply(record, field, value);
    }
    changed
}

pub fn merge_secondary_key(record: &mut EnrichmentRecord, key: &str, rules: &MergeRules) -> bool {
    rules.apply(record, Field::Mbid, Some(json!(key)))
}

pub fn merge_crowd(record: &mut EnrichmentRecord, info: &CrowdInfo, rules: &MergeRules) -> bool {
    let updates = [
        (Field::GenreMb, info.genre.as_ref().map(|v| json!(v))),
        (Field::RatingValue, info.rating_value.map(|v| json!(v))),
        (Field::RatingVotes, info.rating_votes.map(|v| json!(v))),
    ];
    let mut changed = false;
    for (field, value) in updates {
        changed |= rules.apply(record, field, value);
    }
    changed
}
