//! Property tests P1 (idempotence) and P2 (beacon gating) from spec §8,
//! run against a `RecordingStore` test double that counts `stage` /
//! `commit` / `publish` calls instead of touching real git state — the
//! properties only concern how often the Synchronizer *decides* to
//! persist, not what the persisted bytes look like (that's covered by
//! the `wasync-store` and `scenarios.rs` tests).

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use serde_json::json;

use wasync_engine::{sync_world, Registries};
use wasync_source::FixtureSource;
use wasync_store::{StoreError, VersionedStore};
use wasync_types::{Identifier, Payload, TrackChanges, WorldConfig};

struct RecordingStore {
    working_tree: PathBuf,
    stage_calls: Cell<u32>,
    commit_calls: Cell<u32>,
    publish_calls: Cell<u32>,
    written: RefCell<std::collections::HashMap<String, Payload>>,
}

impl RecordingStore {
    fn new(working_tree: PathBuf) -> Self {
        Self {
            working_tree,
            stage_calls: Cell::new(0),
            commit_calls: Cell::new(0),
            publish_calls: Cell::new(0),
            written: RefCell::new(std::collections::HashMap::new()),
        }
    }
}

impl VersionedStore for RecordingStore {
    fn working_tree(&self) -> &Path {
        &self.working_tree
    }
    fn checkout(&mut self, _branch: &str) -> wasync_store::Result<()> {
        Ok(())
    }
    fn validate(&self) -> wasync_store::Result<()> {
        Ok(())
    }
    fn write_object(&mut self, id: &Identifier, payload: &Payload) -> wasync_store::Result<()> {
        self.written.borrow_mut().insert(id.to_string(), payload.clone());
        self.stage(Path::new(id.as_str()))
    }
    fn stage(&mut self, _relative_path: &Path) -> wasync_store::Result<()> {
        self.stage_calls.set(self.stage_calls.get() + 1);
        Ok(())
    }
    fn commit(&mut self, _title: &str, _body: &str) -> wasync_store::Result<Option<String>> {
        let n = self.commit_calls.get() + 1;
        self.commit_calls.set(n);
        Ok(Some(format!("commit-{n}")))
    }
    fn publish(&mut self) -> wasync_store::Result<()> {
        self.publish_calls.set(self.publish_calls.get() + 1);
        Ok(())
    }
}

fn world_only(url: &str) -> WorldConfig {
    WorldConfig {
        url: url.to_string(),
        track_changes: TrackChanges { world: true, categories: false, articles: false },
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    // P1: a tick against an upstream whose payloads are unchanged from the
    // last sync performs zero stage/commit/publish calls.
    #[test]
    fn p1_noop_tick_calls_nothing(title in "[a-zA-Z0-9 ]{0,16}") {
        let rt = runtime();
        let dir = tempfile::tempdir().unwrap();
        let world_id = Identifier::parse("11111111-1111-1111-1111-111111111111").unwrap();

        let source = FixtureSource::new("user-1");
        source.add_world(world_id.clone(), "https://worldanvil.com/w/demo");
        source.set_world_payload(world_id.clone(), 0, json!({"entityClass": "world"}));
        source.set_world_payload(world_id.clone(), 1, json!({"entityClass": "world", "title": title}));

        let registries = Registries::open(dir.path());
        registries.ensure_initialized().unwrap();
        let mut store = RecordingStore::new(dir.path().to_path_buf());
        let world = world_only("https://worldanvil.com/w/demo");

        rt.block_on(sync_world(&source, &mut store, &registries, &world)).unwrap();
        let (commits_after_first, publishes_after_first) = (store.commit_calls.get(), store.publish_calls.get());

        rt.block_on(sync_world(&source, &mut store, &registries, &world)).unwrap();
        prop_assert_eq!(store.commit_calls.get(), commits_after_first);
        prop_assert_eq!(store.publish_calls.get(), publishes_after_first);
    }

    // P2: beacon-only drift updates the beacon registry but never commits
    // the payload file or the track registry.
    #[test]
    fn p2_beacon_only_drift_updates_beacon_reg_without_committing(
        beacon_noise in "[a-zA-Z0-9]{1,12}",
        track_title in "[a-zA-Z0-9 ]{0,16}",
    ) {
        let rt = runtime();
        let dir = tempfile::tempdir().unwrap();
        let world_id = Identifier::parse("11111111-1111-1111-1111-111111111111").unwrap();

        let source = FixtureSource::new("user-1");
        source.add_world(world_id.clone(), "https://worldanvil.com/w/demo");
        source.set_world_payload(world_id.clone(), 0, json!({"entityClass": "world"}));
        source.set_world_payload(world_id.clone(), 1, json!({"entityClass": "world", "title": track_title.clone()}));

        let registries = Registries::open(dir.path());
        registries.ensure_initialized().unwrap();
        let mut store = RecordingStore::new(dir.path().to_path_buf());
        let world = world_only("https://worldanvil.com/w/demo");

        rt.block_on(sync_world(&source, &mut store, &registries, &world)).unwrap();
        let beacon_before = registries.beacon.get(world_id.as_str()).unwrap();
        let track_before = registries.track.get(world_id.as_str()).unwrap();
        let commits_before = store.commit_calls.get();

        // Track-depth payload is untouched; only the cheap beacon-depth
        // payload drifts (still a different hash, since the field changes).
        source.set_world_payload(world_id.clone(), 0, json!({"entityClass": "world", "noise": beacon_noise}));

        rt.block_on(sync_world(&source, &mut store, &registries, &world)).unwrap();

        let beacon_after = registries.beacon.get(world_id.as_str()).unwrap();
        let track_after = registries.track.get(world_id.as_str()).unwrap();
        prop_assert_ne!(beacon_after, beacon_before);
        prop_assert_eq!(track_after, track_before);
        prop_assert_eq!(store.commit_calls.get(), commits_before);
    }
}
