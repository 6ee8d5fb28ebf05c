use async_trait::async_trait;
use music_track_enricher::api::mock::{MockCatalog, MockCrowd, MockFeatures};
use music_track_enricher::api::{CatalogService, FeatureLevel};
use music_track_enricher::checkpoint::CheckpointStore;
use music_track_enricher::merge::MergeRules;
use music_track_enricher::models::{CatalogTrack, CrowdInfo, Field, FetchOutcome, MergePolicy};
use music_track_enricher::scheduler::{EngineOptions, Enricher, RunOutcome};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::pending;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::watch;

fn store(dir: &Path) -> CheckpointStore {
    CheckpointStore::new(dir.join("in.json"), dir.join("out.json"), dir.join("ck.json"))
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn track(name: &str, artist: &str, isrc: &str) -> CatalogTrack {
    CatalogTrack {
        track_name: Some(name.into()),
        artist_name: Some(artist.into()),
        isrc: Some(isrc.into()),
        popularity: Some(10),
        ..CatalogTrack::default()
    }
}

fn low_doc(bpm: f64) -> Value {
    json!({"0": {"rhythm": {"bpm": bpm, "danceability": 1.1},
                 "lowlevel": {"average_loudness": 0.9, "dynamic_complexity": 4.2}}})
}

fn high_doc(genre: &str) -> Value {
    json!({"0": {"highlevel": {"genre_rosamerica": {"value": genre, "version": {"essentia": "2.1"}}}}})
}

fn read_output(dir: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(dir.join("out.json")).unwrap()).unwrap()
}

fn options(batch_size: usize) -> EngineOptions {
    EngineOptions { batch_size, ..EngineOptions::default() }
}

#[tokio::test]
async fn full_run_enriches_every_item_and_clears_checkpoint() {
    let td = tempdir().unwrap();
    let catalog = Arc::new(
        MockCatalog::new()
            .with_track("a", track("Song A", "Band", "ISRC-A"))
            .with_track("b", track("Song B", "Band", "ISRC-B")),
    );
    let crowd = Arc::new(
        MockCrowd::new()
            .with_isrc("ISRC-A", "m-a")
            .with_title_artist("Song B", "Band", "m-b")
            .with_info("m-a", CrowdInfo { genre: Some("rock".into()), rating_value: Some(4.0), rating_votes: Some(3) }),
    );
    let features = Arc::new(
        MockFeatures::new()
            .with_low("m-a", low_doc(120.0))
            .with_high("m-a", high_doc("roc"))
            .with_low("m-b", low_doc(90.0)),
    );

    let mut engine = Enricher::builder(store(td.path()))
        .options(options(10))
        .rules(MergeRules { strip_highlevel_versions: true, ..MergeRules::default() })
        .catalog(catalog.clone())
        .crowd(crowd.clone())
        .features(features.clone())
        .lookup_db(td.path().join("lookups.db"))
        .build();

    let outcome = engine.run(&ids(&["a", "b", "c"]), pending()).await.unwrap();
    let RunOutcome::Completed(summary) = outcome else { panic!("expected completion") };
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.batches, 1);
    assert!(!td.path().join("ck.json").exists());

    let out = read_output(td.path());
    assert_eq!(out["a"]["mbid"], "m-a");
    assert_eq!(out["a"]["genre_mb"], "rock");
    assert_eq!(out["a"]["rating_votes"], 3);
    assert_eq!(out["a"]["bpm"], 120.0);
    assert_eq!(out["a"]["energy"], 4.2);
    assert_eq!(out["a"]["highlevel"], json!({"genre_rosamerica": {"value": "roc"}}));
    // resolved through the second strategy
    assert_eq!(out["b"]["mbid"], "m-b");
    assert_eq!(out["b"]["bpm"], 90.0);
    assert!(out["b"]["highlevel"].is_null());
    // unknown everywhere: record exists with every field null
    assert!(out["c"]["track_name"].is_null());
    assert!(out["c"].as_object().unwrap().contains_key("loudness"));

    assert_eq!(features.requested_keys(FeatureLevel::Low), ids(&["m-a", "m-b"]));
    assert_eq!(features.requested_keys(FeatureLevel::High), ids(&["m-a", "m-b"]));
}

#[tokio::test]
async fn resume_skips_done_items() {
    let td = tempdir().unwrap();
    let st = store(td.path());
    std::fs::write(td.path().join("out.json"), r#"{"a": {"track_name": "Kept"}}"#).unwrap();
    std::fs::write(td.path().join("ck.json"), r#"["a"]"#).unwrap();

    let catalog = Arc::new(MockCatalog::new().with_track("b", track("B", "X", "I-B")));
    let mut engine = Enricher::builder(st).options(options(10)).catalog(catalog.clone()).build();

    let outcome = engine.run(&ids(&["a", "b"]), pending()).await.unwrap();
    assert_eq!(outcome.summary().already_done, 1);
    assert_eq!(outcome.summary().processed, 1);
    assert_eq!(catalog.requested_ids(), ids(&["b"]));

    let out = read_output(td.path());
    assert_eq!(out["a"]["track_name"], "Kept");
    assert_eq!(out["b"]["track_name"], "B");
}

#[tokio::test]
async fn fill_missing_never_overwrites_existing_values() {
    let td = tempdir().unwrap();
    std::fs::write(
        td.path().join("in.json"),
        r#"{"a": {"mbid": "m-a", "genre_mb": "jazz", "bpm": 100.0, "mood_happy": 0.2,
                  "highlevel": {"old": true}}}"#,
    )
    .unwrap();
    let crowd = Arc::new(MockCrowd::new().with_info(
        "m-a",
        CrowdInfo { genre: Some("metal".into()), rating_value: Some(2.0), rating_votes: Some(1) },
    ));
    let features = Arc::new(MockFeatures::new().with_low("m-a", low_doc(140.0)).with_high("m-a", high_doc("pop")));

    let mut engine = Enricher::builder(store(td.path()))
        .crowd(crowd.clone())
        .features(features)
        .build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();

    let out = read_output(td.path());
    assert_eq!(out["a"]["genre_mb"], "jazz");
    assert_eq!(out["a"]["rating_value"], 2.0);
    assert_eq!(out["a"]["bpm"], 100.0);
    assert_eq!(out["a"]["loudness"], 0.9);
    // highlevel is replaced wholesale and the flat leftovers go with it
    assert_eq!(out["a"]["highlevel"]["genre_rosamerica"]["value"], "pop");
    assert!(out["a"]["highlevel"].get("old").is_none());
    assert!(out["a"].get("mood_happy").is_none());
    // existing mbid is never re-resolved
    assert_eq!(crowd.lookup_count(), 0);
}

#[tokio::test]
async fn refresh_policy_overwrites_with_new_values() {
    let td = tempdir().unwrap();
    std::fs::write(td.path().join("in.json"), r#"{"a": {"mbid": "m-a", "bpm": 100.0}}"#).unwrap();
    let features = Arc::new(MockFeatures::new().with_low("m-a", low_doc(140.0)));

    let mut engine = Enricher::builder(store(td.path()))
        .rules(MergeRules::default().with_policy(Field::Bpm, MergePolicy::Refresh))
        .features(features)
        .build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert_eq!(read_output(td.path())["a"]["bpm"], 140.0);
}

#[tokio::test]
async fn shared_secondary_key_is_resolved_and_fetched_once() {
    let td = tempdir().unwrap();
    let catalog = Arc::new(
        MockCatalog::new()
            .with_track("a", track("Same", "Band", "ISRC-1"))
            .with_track("b", track("Same", "Band", "ISRC-1")),
    );
    let crowd = Arc::new(
        MockCrowd::new()
            .with_isrc("ISRC-1", "m-1")
            .with_info("m-1", CrowdInfo { genre: Some("indie".into()), ..CrowdInfo::default() }),
    );
    let features = Arc::new(MockFeatures::new().with_low("m-1", low_doc(100.0)));

    let mut engine = Enricher::builder(store(td.path()))
        .catalog(catalog)
        .crowd(crowd.clone())
        .features(features.clone())
        .build();
    engine.run(&ids(&["a", "b"]), pending()).await.unwrap();

    assert_eq!(crowd.lookup_count(), 1);
    assert_eq!(crowd.info_requests(), ids(&["m-1"]));
    assert_eq!(features.requested_keys(FeatureLevel::Low), ids(&["m-1"]));
    let out = read_output(td.path());
    assert_eq!(out["a"], out["b"]);
    assert_eq!(out["b"]["genre_mb"], "indie");
}

#[tokio::test]
async fn failed_feature_requests_leave_fields_and_still_finish() {
    let td = tempdir().unwrap();
    std::fs::write(
        td.path().join("in.json"),
        r#"{"a": {"mbid": "m-a", "highlevel": {"keep": 1}, "bpm": 77.0}}"#,
    )
    .unwrap();
    let features = Arc::new(MockFeatures { failing: true, ..MockFeatures::new() });

    let mut engine = Enricher::builder(store(td.path())).features(features).build();
    let outcome = engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let out = read_output(td.path());
    assert_eq!(out["a"]["highlevel"], json!({"keep": 1}));
    assert_eq!(out["a"]["bpm"], 77.0);
}

#[tokio::test]
async fn known_not_found_lookups_are_skipped_on_later_runs() {
    let td = tempdir().unwrap();
    let db = td.path().join("lookups.db");
    std::fs::write(td.path().join("in.json"), r#"{"a": {"isrc": "NOPE"}}"#).unwrap();

    let first = Arc::new(MockCrowd::new());
    let mut engine = Enricher::builder(store(td.path())).crowd(first.clone()).lookup_db(&db).build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert_eq!(first.lookup_count(), 1);

    let second = Arc::new(MockCrowd::new());
    let mut engine = Enricher::builder(store(td.path())).crowd(second.clone()).lookup_db(&db).build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert_eq!(second.lookup_count(), 0);

    let third = Arc::new(MockCrowd::new().with_isrc("NOPE", "m-late"));
    let mut engine = Enricher::builder(store(td.path()))
        .options(EngineOptions { retry_not_found: true, ..EngineOptions::default() })
        .crowd(third.clone())
        .lookup_db(&db)
        .build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert_eq!(third.lookup_count(), 1);
    assert_eq!(read_output(td.path())["a"]["mbid"], "m-late");
}

#[tokio::test]
async fn lookup_errors_are_not_remembered() {
    let td = tempdir().unwrap();
    let db = td.path().join("lookups.db");
    std::fs::write(td.path().join("in.json"), r#"{"a": {"isrc": "I-A"}}"#).unwrap();

    let failing = Arc::new(MockCrowd { failing: true, ..MockCrowd::new() });
    let mut engine = Enricher::builder(store(td.path())).crowd(failing).lookup_db(&db).build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();

    let healthy = Arc::new(MockCrowd::new().with_isrc("I-A", "m-a"));
    let mut engine = Enricher::builder(store(td.path())).crowd(healthy.clone()).lookup_db(&db).build();
    engine.run(&ids(&["a"]), pending()).await.unwrap();
    assert_eq!(healthy.lookup_count(), 1);
    assert_eq!(read_output(td.path())["a"]["mbid"], "m-a");
}

/// Catalog that asks for a shutdown on its n-th call and then never answers.
struct StopOnCall {
    n: usize,
    calls: AtomicUsize,
    stop: watch::Sender<bool>,
    tracks: HashMap<String, CatalogTrack>,
}

#[async_trait]
impl CatalogService for StopOnCall {
    fn name(&self) -> &str {
        "stop-on-call"
    }

    async fn fetch_tracks(&self, ids: &[String]) -> FetchOutcome<HashMap<String, CatalogTrack>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.n {
            let _ = self.stop.send(true);
            pending::<()>().await;
        }
        FetchOutcome::Data(
            ids.iter()
                .filter_map(|id| self.tracks.get(id).map(|t| (id.clone(), t.clone())))
                .collect(),
        )
    }
}

#[tokio::test]
async fn interrupt_saves_progress_and_resume_finishes() {
    let td = tempdir().unwrap();
    let (tx, mut rx) = watch::channel(false);
    let tracks: HashMap<String, CatalogTrack> = ["a", "b", "c"]
        .iter()
        .map(|id| (id.to_string(), track(&format!("Song {}", id), "Band", "I")))
        .collect();
    let stopper = Arc::new(StopOnCall { n: 2, calls: AtomicUsize::new(0), stop: tx, tracks: tracks.clone() });

    let mut engine = Enricher::builder(store(td.path()))
        .options(options(1))
        .catalog(stopper)
        .build();
    let shutdown = async move {
        let _ = rx.changed().await;
    };
    let outcome = engine.run(&ids(&["a", "b", "c"]), shutdown).await.unwrap();

    let RunOutcome::Interrupted(summary) = outcome else { panic!("expected interrupt") };
    assert_eq!(summary.processed, 1);
    let done: Vec<String> =
        serde_json::from_str(&std::fs::read_to_string(td.path().join("ck.json")).unwrap()).unwrap();
    assert_eq!(done, ids(&["a"]));
    let out = read_output(td.path());
    assert_eq!(out["a"]["track_name"], "Song a");
    // the interrupted batch is persisted without being marked done
    assert!(out["b"]["track_name"].is_null());

    let mut catalog = MockCatalog::new();
    catalog.tracks = tracks.clone();
    let catalog = Arc::new(catalog);
    let mut engine = Enricher::builder(store(td.path()))
        .options(options(1))
        .catalog(catalog.clone())
        .build();
    let outcome = engine.run(&ids(&["a", "b", "c"]), pending()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(catalog.requested_ids(), ids(&["b", "c"]));
    assert_eq!(read_output(td.path())["c"]["track_name"], "Song c");
    assert!(!td.path().join("ck.json").exists());

    // same final dataset as a run that was never interrupted
    let clean = tempdir().unwrap();
    let mut uninterrupted = MockCatalog::new();
    uninterrupted.tracks = tracks;
    let mut engine = Enricher::builder(store(clean.path()))
        .options(options(1))
        .catalog(Arc::new(uninterrupted))
        .build();
    engine.run(&ids(&["a", "b", "c"]), pending()).await.unwrap();
    assert_eq!(read_output(clean.path()), read_output(td.path()));
}

#[tokio::test]
async fn unwritable_checkpoint_aborts_the_run() {
    let td = tempdir().unwrap();
    let blocker = td.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let st = CheckpointStore::new(blocker.join("in.json"), blocker.join("out.json"), blocker.join("ck.json"));

    let mut engine = Enricher::builder(st).build();
    assert!(engine.run(&ids(&["a"]), pending()).await.is_err());
}
