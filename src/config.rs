use crate::models::{Field, MergePolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const SPOTIFY: &str = "spotify";
pub const MUSICBRAINZ: &str = "musicbrainz";
pub const ACOUSTICBRAINZ: &str = "acousticbrainz";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Scalar metadata from the streaming catalog (name, artist, isrc, ...).
    Catalog,
    /// Secondary key resolution plus tags and rating.
    Crowd,
    /// Low-level and high-level derived features.
    Features,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub challenge_set: PathBuf,
    #[serde(default = "default_input_dataset")]
    pub input_dataset: PathBuf,
    #[serde(default = "default_output_dataset")]
    pub output_dataset: PathBuf,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_lookup_db_path")]
    pub lookup_db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,

    // Batching
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_catalog_batch_size")]
    pub catalog_batch_size: usize,
    #[serde(default = "default_features_batch_size")]
    pub features_batch_size: usize,
    #[serde(default = "default_lookup_concurrency")]
    pub lookup_concurrency: usize,
    #[serde(default = "default_inter_batch_pause_ms")]
    pub inter_batch_pause_ms: u64,

    /// Ignore not-found outcomes recorded by earlier runs.
    #[serde(default)]
    pub retry_not_found: bool,
    #[serde(default = "default_true")]
    pub strip_highlevel_versions: bool,

    /// Per-field merge policy overrides, e.g. `bpm = "refresh"`.
    #[serde(default)]
    pub merge: HashMap<Field, MergePolicy>,

    #[serde(default)]
    pub services: HashMap<String, ServiceOverride>,

    #[serde(default)]
    pub spotify_client_id: String,
    #[serde(default)]
    pub spotify_client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Request policy for one remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePolicy {
    pub base_url: Option<String>,
    /// Minimum spacing between two requests to this service.
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub timeout_backoff_secs: u64,
    pub error_backoff_secs: u64,
    /// Wait used on 429 when neither retry-after nor reset headers are present.
    pub default_rate_limit_wait_secs: u64,
    /// Upper bound for any server-suggested wait.
    pub max_rate_limit_wait_secs: u64,
    /// Added on top of every server-suggested wait.
    pub rate_limit_padding_ms: u64,
    /// Sleep before returning when remaining quota drops below this.
    pub low_quota_threshold: u64,
}

/// A `[services.<name>]` table. Unset keys keep the built-in value for
/// that service.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ServiceOverride {
    pub base_url: Option<String>,
    pub min_interval_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub timeout_backoff_secs: Option<u64>,
    pub error_backoff_secs: Option<u64>,
    pub default_rate_limit_wait_secs: Option<u64>,
    pub max_rate_limit_wait_secs: Option<u64>,
    pub rate_limit_padding_ms: Option<u64>,
    pub low_quota_threshold: Option<u64>,
}

impl ServiceOverride {
    pub fn apply(&self, mut base: ServicePolicy) -> ServicePolicy {
        if self.base_url.is_some() {
            base.base_url = self.base_url.clone();
        }
        base.min_interval_ms = self.min_interval_ms.unwrap_or(base.min_interval_ms);
        base.timeout_secs = self.timeout_secs.unwrap_or(base.timeout_secs);
        base.max_attempts = self.max_attempts.unwrap_or(base.max_attempts);
        base.timeout_backoff_secs = self.timeout_backoff_secs.unwrap_or(base.timeout_backoff_secs);
        base.error_backoff_secs = self.error_backoff_secs.unwrap_or(base.error_backoff_secs);
        base.default_rate_limit_wait_secs = self
            .default_rate_limit_wait_secs
            .unwrap_or(base.default_rate_limit_wait_secs);
        base.max_rate_limit_wait_secs = self
            .max_rate_limit_wait_secs
            .unwrap_or(base.max_rate_limit_wait_secs);
        base.rate_limit_padding_ms = self.rate_limit_padding_ms.unwrap_or(base.rate_limit_padding_ms);
        base.low_quota_threshold = self.low_quota_threshold.unwrap_or(base.low_quota_threshold);
        base
    }
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            base_url: None,
            min_interval_ms: 0,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            timeout_backoff_secs: default_timeout_backoff_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            default_rate_limit_wait_secs: default_rate_limit_wait_secs(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
            rate_limit_padding_ms: default_rate_limit_padding_ms(),
            low_quota_threshold: default_low_quota_threshold(),
        }
    }
}

impl ServicePolicy {
    pub fn with_min_interval(ms: u64) -> Self {
        Self { min_interval_ms: ms, ..Self::default() }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    /// Never more than a day, so deadlines built from it stay in range.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_wait_secs.min(86_400))
    }
    pub fn padding(&self) -> Duration {
        Duration::from_millis(self.rate_limit_padding_ms)
    }
}

fn default_input_dataset() -> PathBuf { "acousticbrainz_data.json".into() }
fn default_output_dataset() -> PathBuf { "acousticbrainz_data_updated.json".into() }
fn default_checkpoint_path() -> PathBuf { "acousticbrainz_checkpoint.json".into() }
fn default_lookup_db_path() -> PathBuf { "lookup_cache.db".into() }
fn default_log_dir() -> PathBuf { "logs".into() }
fn default_stages() -> Vec<Stage> { vec![Stage::Catalog, Stage::Crowd, Stage::Features] }
fn default_batch_size() -> usize { 100 }
fn default_catalog_batch_size() -> usize { 50 }
fn default_features_batch_size() -> usize { 25 }
fn default_lookup_concurrency() -> usize { 8 }
fn default_inter_batch_pause_ms() -> u64 { 100 }
fn default_true() -> bool { true }
fn default_user_agent() -> String { format!("track-enricher/{}", env!("CARGO_PKG_VERSION")) }
fn default_timeout_secs() -> u64 { 20 }
fn default_max_attempts() -> u32 { 3 }
fn default_timeout_backoff_secs() -> u64 { 5 }
fn default_error_backoff_secs() -> u64 { 10 }
fn default_rate_limit_wait_secs() -> u64 { 10 }
fn default_max_rate_limit_wait_secs() -> u64 { 3600 }
fn default_rate_limit_padding_ms() -> u64 { 1000 }
fn default_low_quota_threshold() -> u64 { 1 }

/// Built-in spacing per service; the crowd service allows one request per second.
fn builtin_policy(service: &str) -> ServicePolicy {
    match service {
        SPOTIFY => ServicePolicy::with_min_interval(300),
        MUSICBRAINZ => ServicePolicy::with_min_interval(1000),
        _ => ServicePolicy::default(),
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&s)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("SPOTIFY_CLIENT_ID") {
            self.spotify_client_id = id;
        }
        if let Ok(secret) = std::env::var("SPOTIFY_CLIENT_SECRET") {
            self.spotify_client_secret = secret;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.catalog_batch_size == 0 || self.features_batch_size == 0 {
            anyhow::bail!("batch sizes must be greater than zero");
        }
        if self.lookup_concurrency == 0 {
            anyhow::bail!("lookup_concurrency must be greater than zero");
        }
        if self.stages.is_empty() {
            anyhow::bail!("at least one stage must be enabled");
        }
        Ok(())
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Request policy for a service: the built-in one with the configured
    /// keys laid over it.
    pub fn service_policy(&self, service: &str) -> ServicePolicy {
        let base = builtin_policy(service);
        match self.services.get(service) {
            Some(o) => o.apply(base),
            None => base,
        }
    }

    pub fn merge_policy(&self, field: Field) -> MergePolicy {
        self.merge.get(&field).copied().unwrap_or_else(|| field.default_policy())
    }

    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }
}
