use crate::api::acousticbrainz::AcousticBrainzClient;
use crate::api::musicbrainz::MusicBrainzClient;
use crate::api::spotify::SpotifyCatalog;
use crate::api::{CatalogService, CrowdService, FeatureLevel, FeatureService};
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, Stage, ACOUSTICBRAINZ, MUSICBRAINZ, SPOTIFY};
use crate::db;
use crate::fetcher::RateLimitedFetcher;
use crate::merge::{self, MergeRules, RECORD_FIELDS};
use crate::models::{
    CrowdInfo, Dataset, DoneSet, Field, FetchOutcome, Lookup, LookupStrategy, SecondaryKey, WorkItem,
};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Knobs of one enrichment run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub stages: Vec<Stage>,
    pub batch_size: usize,
    pub catalog_batch_size: usize,
    pub features_batch_size: usize,
    pub lookup_concurrency: usize,
    pub inter_batch_pause: Duration,
    pub retry_not_found: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stages: vec![Stage::Catalog, Stage::Crowd, Stage::Features],
            batch_size: 100,
            catalog_batch_size: 50,
            features_batch_size: 25,
            lookup_concurrency: 8,
            inter_batch_pause: Duration::ZERO,
            retry_not_found: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            stages: cfg.stages.clone(),
            batch_size: cfg.batch_size,
            catalog_batch_size: cfg.catalog_batch_size,
            features_batch_size: cfg.features_batch_size,
            lookup_concurrency: cfg.lookup_concurrency,
            inter_batch_pause: cfg.inter_batch_pause(),
            retry_not_found: cfg.retry_not_found,
        }
    }

    fn stage(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub already_done: usize,
    pub processed: usize,
    pub updated: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Operator stop; progress up to the interrupt was saved.
    Interrupted(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Interrupted(s) => s,
        }
    }
}

/// Process exit status for a run: 0 when it completed or was stopped by the
/// operator, 1 when it ended with an error.
pub fn exit_status(result: &Result<RunOutcome>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Work items not yet in the done-set, in their original order.
pub fn pending_items<'a>(work: &'a [WorkItem], done: &DoneSet) -> Vec<&'a WorkItem> {
    work.iter().filter(|id| !done.contains(*id)).collect()
}

type LookupStep = (LookupStrategy, String);

/// Drives batches of pending work through the enabled stages, one batch at a
/// time, checkpointing after each.
pub struct Enricher {
    options: EngineOptions,
    rules: MergeRules,
    store: CheckpointStore,
    catalog: Option<Arc<dyn CatalogService>>,
    crowd: Option<Arc<dyn CrowdService>>,
    features: Option<Arc<dyn FeatureService>>,
    lookup_db: Option<PathBuf>,
    // Run-scoped caches: a key or crowd record is fetched at most once per run.
    lookups: HashMap<LookupStep, Lookup>,
    crowd_info: HashMap<SecondaryKey, Option<CrowdInfo>>,
}

pub struct EnricherBuilder {
    inner: Enricher,
}

impl EnricherBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.inner.options = options;
        self
    }
    pub fn rules(mut self, rules: MergeRules) -> Self {
        self.inner.rules = rules;
        self
    }
    pub fn catalog(mut self, svc: Arc<dyn CatalogService>) -> Self {
        self.inner.catalog = Some(svc);
        self
    }
    pub fn crowd(mut self, svc: Arc<dyn CrowdService>) -> Self {
        self.inner.crowd = Some(svc);
        self
    }
    pub fn features(mut self, svc: Arc<dyn FeatureService>) -> Self {
        self.inner.features = Some(svc);
        self
    }
    pub fn lookup_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.lookup_db = Some(path.into());
        self
    }
    pub fn build(self) -> Enricher {
        self.inner
    }
}

impl Enricher {
    pub fn builder(store: CheckpointStore) -> EnricherBuilder {
        EnricherBuilder {
            inner: Enricher {
                options: EngineOptions::default(),
                rules: MergeRules::default(),
                store,
                catalog: None,
                crowd: None,
                features: None,
                lookup_db: None,
                lookups: HashMap::new(),
                crowd_info: HashMap::new(),
            },
        }
    }

    /// Wire the real service clients around one shared fetcher.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let fetcher = RateLimitedFetcher::new(&cfg.user_agent)?
            .with_policy(SPOTIFY, cfg.service_policy(SPOTIFY))
            .with_policy(MUSICBRAINZ, cfg.service_policy(MUSICBRAINZ))
            .with_policy(ACOUSTICBRAINZ, cfg.service_policy(ACOUSTICBRAINZ));
        let fetcher = Arc::new(fetcher);

        let mut builder = Enricher::builder(CheckpointStore::from_config(cfg))
            .options(EngineOptions::from_config(cfg))
            .rules(MergeRules::from_config(cfg))
            .crowd(Arc::new(MusicBrainzClient::new(fetcher.clone())))
            .features(Arc::new(AcousticBrainzClient::new(fetcher.clone())))
            .lookup_db(&cfg.lookup_db_path);

        let spotify = SpotifyCatalog::new(
            fetcher,
            cfg.spotify_client_id.clone(),
            cfg.spotify_client_secret.clone(),
        );
        if spotify.is_authenticated() {
            builder = builder.catalog(Arc::new(spotify));
        } else if cfg.stage_enabled(Stage::Catalog) {
            warn!("No Spotify credentials configured; catalog stage will be skipped");
        }
        Ok(builder.build())
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Enrich `work` until it is exhausted or `shutdown` resolves.
    ///
    /// Batches run strictly one after another; the dataset and done-set are
    /// saved after each. On shutdown the current in-memory state is saved and
    /// `Interrupted` returned. A failed save ends the run with an error after
    /// one emergency save attempt.
    pub async fn run<S>(&mut self, work: &[WorkItem], shutdown: S) -> Result<RunOutcome>
    where
        S: Future<Output = ()>,
    {
        let started = Instant::now();
        let (mut dataset, mut done) = self.store.load().context("loading checkpoint")?;

        // Keep the done-set a subset of the work items with a record behind each id.
        let work_set: HashSet<&WorkItem> = work.iter().collect();
        done.retain(|id| work_set.contains(id) && dataset.contains_key(id));

        let pending: Vec<WorkItem> = pending_items(work, &done).into_iter().cloned().collect();
        let batch_size = self.options.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        let mut summary = RunSummary {
            total: work.len(),
            already_done: done.len(),
            ..RunSummary::default()
        };
        info!(
            "{} unique tracks, {} already done, {} pending in {} batches",
            work.len(),
            done.len(),
            pending.len(),
            total_batches
        );

        tokio::pin!(shutdown);
        for (idx, batch) in pending.chunks(batch_size).enumerate() {
            let batch_started = Instant::now();
            let first = summary.already_done + idx * batch_size + 1;
            info!(
                "[Batch {}/{}] tracks {}-{}",
                idx + 1,
                total_batches,
                first,
                first + batch.len() - 1
            );

            let updated = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                n = self.process_batch(batch, &mut dataset) => Some(n),
            };
            let Some(updated) = updated else {
                warn!("Interrupted during batch {}; saving progress", idx + 1);
                summary.elapsed = started.elapsed();
                self.persist(&dataset, &done)?;
                return Ok(RunOutcome::Interrupted(summary));
            };

            done.extend(batch.iter().cloned());
            self.persist(&dataset, &done)?;
            summary.batches += 1;
            summary.processed += batch.len();
            summary.updated += updated;
            info!(
                "[Batch {}/{}] saved: {} records updated in {:.1}s ({:.1}s total)",
                idx + 1,
                total_batches,
                updated,
                batch_started.elapsed().as_secs_f64(),
                started.elapsed().as_secs_f64()
            );

            if idx + 1 < total_batches && !self.options.inter_batch_pause.is_zero() {
                let stopped = tokio::select! {
                    biased;
                    _ = &mut shutdown => true,
                    _ = tokio::time::sleep(self.options.inter_batch_pause) => false,
                };
                if stopped {
                    warn!("Interrupted between batches; progress already saved");
                    summary.elapsed = started.elapsed();
                    return Ok(RunOutcome::Interrupted(summary));
                }
            }
        }

        self.store.clear().context("removing checkpoint")?;
        summary.elapsed = started.elapsed();
        info!(
            "Completed: {} tracks processed in {} batches, {} records updated in {:.1} min",
            summary.processed,
            summary.batches,
            summary.updated,
            summary.elapsed.as_secs_f64() / 60.0
        );
        Ok(RunOutcome::Completed(summary))
    }

    fn persist(&self, dataset: &Dataset, done: &DoneSet) -> Result<()> {
        if let Err(e) = self.store.save(dataset, done) {
            error!("Checkpoint save failed: {:#}", e);
            if let Err(e2) = self.store.save(dataset, done) {
                error!("Emergency save failed as well: {:#}", e2);
            }
            return Err(e.context("persisting checkpoint"));
        }
        Ok(())
    }

    /// Run every enabled stage over one batch. Returns how many records changed.
    async fn process_batch(&mut self, batch: &[WorkItem], dataset: &mut Dataset) -> usize {
        let mut changed: HashSet<WorkItem> = HashSet::new();
        for id in batch {
            dataset.entry(id.clone()).or_default().ensure_fields(&RECORD_FIELDS);
        }
        if self.options.stage(Stage::Catalog) {
            if let Some(catalog) = self.catalog.clone() {
                changed.extend(self.catalog_stage(catalog.as_ref(), batch, dataset).await);
            }
        }
        if self.options.stage(Stage::Crowd) {
            if let Some(crowd) = self.crowd.clone() {
                changed.extend(self.resolve_keys(crowd.as_ref(), batch, dataset).await);
                changed.extend(self.crowd_stage(crowd.as_ref(), batch, dataset).await);
            }
        }
        if self.options.stage(Stage::Features) {
            if let Some(features) = self.features.clone() {
                changed.extend(self.features_stage(features.as_ref(), batch, dataset).await);
            }
        }
        changed.len()
    }

    async fn catalog_stage(
        &self,
        catalog: &dyn CatalogService,
        batch: &[WorkItem],
        dataset: &mut Dataset,
    ) -> Vec<WorkItem> {
        let need: Vec<WorkItem> = batch
            .iter()
            .filter(|id| {
                dataset.get(*id).map_or(true, |r| {
                    r.is_missing(Field::TrackName) || r.is_missing(Field::ArtistName)
                })
            })
            .cloned()
            .collect();
        let mut changed = Vec::new();
        let size = self.options.catalog_batch_size.min(catalog.max_batch()).max(1);
        for chunk in need.chunks(size) {
            match catalog.fetch_tracks(chunk).await {
                FetchOutcome::Data(tracks) => {
                    for id in chunk {
                        let Some(track) = tracks.get(id) else {
                            debug!("{} has no entry for {}", catalog.name(), id);
                            continue;
                        };
                        let record = dataset.entry(id.clone()).or_default();
                        if merge::merge_catalog(record, track, &self.rules) {
                            changed.push(id.clone());
                        }
                    }
                }
                FetchOutcome::NotFound => debug!("{} knows none of {} ids", catalog.name(), chunk.len()),
                FetchOutcome::Failed(e) => {
                    warn!("{} failed for {} ids: {}", catalog.name(), chunk.len(), e)
                }
            }
        }
        info!("Catalog: {}/{} tracks needed metadata, {} updated", need.len(), batch.len(), changed.len());
        changed
    }

    fn lookup_plan(
        &self,
        id: &str,
        dataset: &Dataset,
        known_missing: &HashSet<(String, String)>,
    ) -> Vec<LookupStep> {
        let Some(record) = dataset.get(id) else {
            return Vec::new();
        };
        let skip = |s: LookupStrategy| {
            !self.options.retry_not_found
                && known_missing.contains(&(id.to_string(), s.as_str().to_string()))
        };
        let mut plan = Vec::new();
        if let Some(isrc) = record.str_field(Field::Isrc) {
            if !skip(LookupStrategy::Isrc) {
                plan.push((LookupStrategy::Isrc, isrc.trim().to_uppercase()));
            }
        }
        if let (Some(title), Some(artist)) = (
            record.str_field(Field::TrackName),
            record.str_field(Field::ArtistName),
        ) {
            if !skip(LookupStrategy::TitleArtist) {
                plan.push((LookupStrategy::TitleArtist, format!("{}\u{1f}{}", title, artist)));
            }
        }
        plan
    }

    /// Resolve secondary keys for batch items lacking one, with a bounded
    /// pool of concurrent lookups. Items with an identical plan share a
    /// single resolution, and every answered step is cached for the run.
    async fn resolve_keys(
        &mut self,
        crowd: &dyn CrowdService,
        batch: &[WorkItem],
        dataset: &mut Dataset,
    ) -> Vec<WorkItem> {
        let unresolved: Vec<WorkItem> = batch
            .iter()
            .filter(|id| dataset.get(*id).map_or(true, |r| r.mbid().is_none()))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            return Vec::new();
        }

        let known_missing = self.load_known_missing(&unresolved).await;
        let mut groups: BTreeMap<Vec<LookupStep>, Vec<WorkItem>> = BTreeMap::new();
        for id in &unresolved {
            let plan = self.lookup_plan(id, dataset, &known_missing);
            if plan.is_empty() {
                debug!("No usable lookup for {}", id);
                continue;
            }
            groups.entry(plan).or_default().push(id.clone());
        }

        let cache = &self.lookups;
        let results: Vec<(Vec<LookupStep>, Vec<(LookupStep, Lookup)>)> =
            stream::iter(groups.keys().cloned())
                .map(|plan| async move {
                    let mut answered = Vec::new();
                    for step in &plan {
                        let lookup = match cache.get(step) {
                            Some(hit) => hit.clone(),
                            None => match step.0 {
                                LookupStrategy::Isrc => crowd.lookup_by_isrc(&step.1).await,
                                LookupStrategy::TitleArtist => {
                                    let (title, artist) =
                                        step.1.split_once('\u{1f}').unwrap_or((step.1.as_str(), ""));
                                    crowd.lookup_by_title_artist(title, artist).await
                                }
                            },
                        };
                        let stop = !matches!(lookup, Lookup::NotFound);
                        answered.push((step.clone(), lookup));
                        if stop {
                            break;
                        }
                    }
                    (plan, answered)
                })
                .buffer_unordered(self.options.lookup_concurrency.max(1))
                .collect()
                .await;

        let mut changed = Vec::new();
        let mut misses: Vec<(WorkItem, LookupStrategy, String)> = Vec::new();
        let (mut found, mut missing, mut errors) = (0usize, 0usize, 0usize);
        for (plan, answered) in results {
            let items = groups.get(&plan).cloned().unwrap_or_default();
            for (step, lookup) in &answered {
                if !matches!(lookup, Lookup::Error(_)) {
                    self.lookups.insert(step.clone(), lookup.clone());
                }
            }
            match answered.last().map(|(_, l)| l) {
                Some(Lookup::Found(key)) => {
                    found += items.len();
                    for id in &items {
                        let record = dataset.entry(id.clone()).or_default();
                        if merge::merge_secondary_key(record, key, &self.rules) {
                            changed.push(id.clone());
                        }
                    }
                }
                Some(Lookup::Error(e)) => {
                    errors += items.len();
                    warn!("{} lookup failed for {} tracks: {}", crowd.name(), items.len(), e);
                }
                _ => missing += items.len(),
            }
            for ((strategy, query), lookup) in &answered {
                if *lookup == Lookup::NotFound {
                    for id in &items {
                        misses.push((id.clone(), *strategy, query.clone()));
                    }
                }
            }
        }
        self.record_misses(misses).await;
        info!(
            "Lookup: {} resolved, {} not found, {} failed of {} unresolved",
            found,
            missing,
            errors,
            unresolved.len()
        );
        changed
    }

    async fn load_known_missing(&self, ids: &[WorkItem]) -> HashSet<(String, String)> {
        let Some(path) = self.lookup_db.clone() else {
            return HashSet::new();
        };
        if self.options.retry_not_found {
            return HashSet::new();
        }
        let ids = ids.to_vec();
        let res = tokio::task::spawn_blocking(move || -> Result<HashSet<(String, String)>> {
            let conn = db::open_or_create(&path)?;
            db::known_not_found(&conn, &ids)
        })
        .await;
        match res {
            Ok(Ok(set)) => set,
            Ok(Err(e)) => {
                warn!("Reading lookup cache failed: {:#}", e);
                HashSet::new()
            }
            Err(e) => {
                warn!("Lookup cache task failed: {}", e);
                HashSet::new()
            }
        }
    }

    async fn record_misses(&self, misses: Vec<(WorkItem, LookupStrategy, String)>) {
        let Some(path) = self.lookup_db.clone() else {
            return;
        };
        if misses.is_empty() {
            return;
        }
        let res = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db::open_or_create(&path)?;
            for (id, strategy, query) in &misses {
                db::record_not_found(&conn, id, *strategy, query)?;
            }
            Ok(())
        })
        .await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Recording lookup misses failed: {:#}", e),
            Err(e) => warn!("Lookup cache task failed: {}", e),
        }
    }

    /// Tags and rating per distinct secondary key, fanned out to every item
    /// carrying that key.
    async fn crowd_stage(
        &mut self,
        crowd: &dyn CrowdService,
        batch: &[WorkItem],
        dataset: &mut Dataset,
    ) -> Vec<WorkItem> {
        let mut fanout: BTreeMap<SecondaryKey, Vec<WorkItem>> = BTreeMap::new();
        for id in batch {
            let Some(record) = dataset.get(id) else { continue };
            let needs = record.is_missing(Field::GenreMb)
                || record.is_missing(Field::RatingValue)
                || record.is_missing(Field::RatingVotes);
            if let (true, Some(key)) = (needs, record.mbid()) {
                fanout.entry(key.to_string()).or_default().push(id.clone());
            }
        }

        let to_fetch: Vec<SecondaryKey> = fanout
            .keys()
            .filter(|k| !self.crowd_info.contains_key(*k))
            .cloned()
            .collect();
        let fetched: Vec<(SecondaryKey, FetchOutcome<CrowdInfo>)> = stream::iter(to_fetch)
            .map(|key| async move {
                let outcome = crowd.fetch_tags_and_rating(&key).await;
                (key, outcome)
            })
            .buffer_unordered(self.options.lookup_concurrency.max(1))
            .collect()
            .await;
        for (key, outcome) in fetched {
            match outcome {
                FetchOutcome::Data(info) => {
                    self.crowd_info.insert(key, Some(info));
                }
                FetchOutcome::NotFound => {
                    self.crowd_info.insert(key, None);
                }
                FetchOutcome::Failed(e) => warn!("{} tags for {} failed: {}", crowd.name(), key, e),
            }
        }

        let mut changed = Vec::new();
        for (key, items) in &fanout {
            let Some(Some(info)) = self.crowd_info.get(key) else { continue };
            for id in items {
                let record = dataset.entry(id.clone()).or_default();
                if merge::merge_crowd(record, info, &self.rules) {
                    changed.push(id.clone());
                }
            }
        }
        changed
    }

    /// Bulk low/high-level requests per group of secondary keys; the two
    /// levels of one group are requested concurrently.
    async fn features_stage(
        &self,
        features: &dyn FeatureService,
        batch: &[WorkItem],
        dataset: &mut Dataset,
    ) -> Vec<WorkItem> {
        let mut fanout: BTreeMap<SecondaryKey, Vec<WorkItem>> = BTreeMap::new();
        for id in batch {
            if let Some(key) = dataset.get(id).and_then(|r| r.mbid()) {
                fanout.entry(key.to_string()).or_default().push(id.clone());
            }
        }
        let keys: Vec<SecondaryKey> = fanout.keys().cloned().collect();
        let size = self.options.features_batch_size.min(features.max_batch()).max(1);
        let groups = keys.len().div_ceil(size);
        let mut changed = Vec::new();
        for (gidx, chunk) in keys.chunks(size).enumerate() {
            let started = Instant::now();
            let (low, high) = tokio::join!(
                features.fetch_level(FeatureLevel::Low, chunk),
                features.fetch_level(FeatureLevel::High, chunk)
            );
            let low = level_body(features.name(), FeatureLevel::Low, low);
            let high = level_body(features.name(), FeatureLevel::High, high);
            let sub: BTreeMap<SecondaryKey, Vec<WorkItem>> = chunk
                .iter()
                .filter_map(|k| fanout.get(k).map(|items| (k.clone(), items.clone())))
                .collect();
            changed.extend(merge::merge_features(dataset, &sub, low.as_ref(), high.as_ref(), &self.rules));
            info!(
                "  Features group {}/{} ({} keys) in {:.2}s",
                gidx + 1,
                groups,
                chunk.len(),
                started.elapsed().as_secs_f64()
            );
        }
        changed
    }
}

/// A failed level yields `None` so the merger leaves its fields alone; a
/// 404 on the bulk endpoint means no key had data.
fn level_body(service: &str, level: FeatureLevel, outcome: FetchOutcome) -> Option<serde_json::Value> {
    match outcome {
        FetchOutcome::Data(v) => Some(v),
        FetchOutcome::NotFound => Some(serde_json::Value::Object(Default::default())),
        FetchOutcome::Failed(e) => {
            warn!("{} {} failed: {}", service, level.path(), e);
            None
        }
    }
}
