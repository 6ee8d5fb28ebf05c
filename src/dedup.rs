use crate::models::WorkItem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Source catalog: a list of playlists, each referencing tracks by URI.
/// Unknown members are kept so the set can be re-emitted by `export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSet {
    #[serde(default)]
    pub playlists: Vec<Playlist>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub tracks: Vec<PlaylistTrack>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistTrack {
    #[serde(default)]
    pub track_uri: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChallengeSet {
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading challenge set {}", path.display()))?;
        let set: ChallengeSet = serde_json::from_str(&s)
            .with_context(|| format!("parsing challenge set {}", path.display()))?;
        Ok(set)
    }

    /// Raw track references in playlist order, duplicates included.
    /// Tracks with a missing or blank `track_uri` are skipped.
    pub fn track_refs(&self) -> impl Iterator<Item = &str> {
        self.playlists
            .iter()
            .flat_map(|pl| pl.tracks.iter())
            .map(|t| t.track_uri.as_str())
            .filter(|r| !r.trim().is_empty())
    }

    /// Canonical work items of this catalog.
    pub fn work_items(&self) -> Vec<WorkItem> {
        dedup_work_items(self.track_refs())
    }
}

/// Extract the primary id from a composite reference such as
/// `spotify:track:XYZ` or `https://open.spotify.com/track/XYZ`.
/// References without a usable last segment come back unchanged.
pub fn primary_id(reference: &str) -> &str {
    match reference.rsplit([':', '/']).next() {
        Some(id) if !id.is_empty() => id,
        _ => reference,
    }
}

/// Unique primary ids in first-seen order.
pub fn dedup_work_items<'a, I>(refs: I) -> Vec<WorkItem>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for r in refs {
        let id = primary_id(r);
        if seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    out
}
