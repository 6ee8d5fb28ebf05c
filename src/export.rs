use crate::dedup::{primary_id, ChallengeSet};
use crate::models::Dataset;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

pub const FEATURES_MEMBER: &str = "acoustic_features";

/// Attach each track's record to the challenge set, in place. Tracks without
/// a record get null. Returns how many tracks had one.
pub fn attach_features(set: &mut ChallengeSet, dataset: &Dataset) -> usize {
    let mut matched = 0;
    for track in set.playlists.iter_mut().flat_map(|pl| pl.tracks.iter_mut()) {
        let value = match dataset.get(primary_id(&track.track_uri)) {
            Some(record) => {
                matched += 1;
                Value::Object(record.as_map().clone())
            }
            None => Value::Null,
        };
        track.extra.insert(FEATURES_MEMBER.to_string(), value);
    }
    matched
}

pub fn export_challenge_set(challenge_set: &Path, dataset: &Dataset, out: &Path) -> Result<usize> {
    let mut set = ChallengeSet::from_path(challenge_set)?;
    let matched = attach_features(&mut set, dataset);
    let total = set.track_refs().count();
    let f = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    serde_json::to_writer(BufWriter::new(f), &set)
        .with_context(|| format!("writing {}", out.display()))?;
    info!("Exported {} ({} of {} track references enriched)", out.display(), matched, total);
    Ok(matched)
}
