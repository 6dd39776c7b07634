#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-engine** – The synchronization engine: the core state machine.
//!
//! Ties together the Hasher, the three persistent registries, the
//! `ObjectSource` capability, and the `VersionedStore` capability into the
//! two-tier beacon/track change-detection protocol, file-index
//! reconciliation, and per-kind commit/publish batching described by the
//! daemon's design. This crate is deliberately the largest in the
//! workspace — it is the "hard part" the rest of the crates exist to
//! support.
//!
//! `TrackContext` is rebuilt fresh at the top of every world iteration
//! (no shared mutable state carried between ticks), and `Kind` dispatch
//! goes through `wasync_source::get` rather than three separate call
//! sites, per the redesign guidance this system was built against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use wasync_registry::{Registry, RegistryError};
use wasync_source::{ObjectSource, SourceError};
use wasync_store::{StoreError, VersionedStore};
use wasync_types::{Depth, DepthPair, DepthTable, Identifier, Kind, Payload, WorldConfig, UNCATEGORIZED};

/// Errors the Synchronizer cannot recover from within a single (world,
/// kind) resolution — registry corruption or store I/O failure. Upstream
/// `ObjectSource` failures are handled inline (logged, retried next tick
/// or skipped per-child) and never surface here; see [`SourceError::is_retryable`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// A registry operation failed (I/O or corrupt on-disk state).
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A store operation failed (write, stage, commit, or publish).
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Enumerating the upstream while building a [`TrackContext`] failed;
    /// aborts this world for the tick, same policy as a mid-kind failure.
    #[error("failed to enumerate upstream while building track context: {0}")]
    Source(#[from] SourceError),
    /// The configured world URL was not found among the worlds the
    /// authenticated principal owns.
    #[error("world with url '{0}' was not found among the authenticated principal's worlds")]
    WorldNotFound(String),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

//─────────────────────────────
//  State machine
//─────────────────────────────

/// States a single (world, kind, identifier) resolution passes through.
/// Every edge is logged at `info`; any non-terminal state reverts to
/// `Idle` on error (the caller simply stops advancing it — there is no
/// explicit rollback, since nothing was persisted past the last
/// successfully completed step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing has happened yet for this identifier this tick.
    Idle,
    /// The beacon-depth payload has been fetched and compared.
    BeaconFetched,
    /// The track-depth payload has been fetched and compared.
    TrackFetched,
    /// The payload has been written to the working tree and the track
    /// registry updated.
    Applied,
    /// The object and registry files are staged into the store's index.
    Staged,
    /// A commit covering this identifier's kind has been created.
    Committed,
    /// The commit has been pushed upstream.
    Published,
}

impl SyncState {
    fn log_transition(self, to: SyncState, world: &Identifier, kind: Kind, id: &Identifier) {
        info!(%world, %kind, %id, from = ?self, to = ?to, "sync state transition");
    }
}

fn transition(state: &mut SyncState, to: SyncState, world: &Identifier, kind: Kind, id: &Identifier) {
    state.log_transition(to, world, kind, id);
    *state = to;
}

//─────────────────────────────
//  Commit builder
//─────────────────────────────

/// Accumulates staged paths and commit-body lines for one pending commit.
///
/// Seeded with the three registry file names per spec §4.5 — every commit
/// the Synchronizer makes touches the registries, since a registry entry
/// changing is exactly what triggered the commit in the first place.
/// Cleared after a successful [`VersionedStore::commit`].
#[derive(Debug, Default)]
struct CommitBuilder {
    staged: Vec<PathBuf>,
    body: String,
}

impl CommitBuilder {
    fn seeded(registry_names: &[&str]) -> Self {
        Self {
            staged: registry_names.iter().map(PathBuf::from).collect(),
            body: String::new(),
        }
    }

    fn stage(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.staged.contains(&path) {
            self.staged.push(path);
        }
    }

    fn note(&mut self, line: impl AsRef<str>) {
        self.body.push_str(line.as_ref());
        self.body.push('\n');
    }

    fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn flush(&mut self, registry_names: &[&str]) {
        self.staged = registry_names.iter().map(PathBuf::from).collect();
        self.body.clear();
    }
}

//─────────────────────────────
//  Registry bundle
//─────────────────────────────

const BEACON_HASH_REG: &str = "beacon_hash_reg";
const TRACK_HASH_REG: &str = "track_hash_reg";
const FILE_INDEX: &str = "file_index";

/// The three persistent registries a working tree is backed by, opened
/// together so callers never have to remember the three fixed file names.
pub struct Registries {
    /// Identifier → cheap beacon-depth hash.
    pub beacon: Registry,
    /// Identifier → full track-depth hash.
    pub track: Registry,
    /// Identifier → kind tag (`"world"` | `"category"` | `"article"`).
    pub file_index: Registry,
}

impl Registries {
    /// Open (without creating) the three registries beneath `working_tree`.
    pub fn open(working_tree: impl AsRef<Path>) -> Self {
        let dir = working_tree.as_ref();
        Self {
            beacon: Registry::new(dir, BEACON_HASH_REG),
            track: Registry::new(dir, TRACK_HASH_REG),
            file_index: Registry::new(dir, FILE_INDEX),
        }
    }

    /// Create empty registry files for a fresh working tree. Idempotent.
    pub fn ensure_initialized(&self) -> Result<()> {
        self.beacon.ensure_initialized()?;
        self.track.ensure_initialized()?;
        self.file_index.ensure_initialized()?;
        Ok(())
    }
}

//─────────────────────────────
//  TrackContext
//─────────────────────────────

/// Per-world, per-tick runtime context: a plain value rebuilt fresh at the
/// top of every world iteration rather than a stateful object carried
/// across ticks.
#[derive(Debug, Clone)]
pub struct TrackContext {
    /// The authenticated principal's identity.
    pub principal: String,
    /// The resolved identifier of the configured world.
    pub world_id: Identifier,
    /// The world's configured URL (echoed into commit-body lines).
    pub world_url: String,
    /// Category identifiers within the world, populated only if
    /// `track_changes.categories` is set.
    pub categories: Vec<Identifier>,
    /// Article identifiers keyed by category id (or the sentinel
    /// [`UNCATEGORIZED`]), populated only if `track_changes.articles` is
    /// set. Every category this world tracks, plus the sentinel, has an
    /// entry even if empty.
    pub articles: HashMap<String, Vec<Identifier>>,
    /// Beacon/track depth pair for each kind.
    pub depths: HashMap<Kind, DepthPair>,
}

impl TrackContext {
    /// Look up the depth pair for a kind, falling back to the default
    /// table if this context somehow omits it (defensive; `build`
    /// always populates all three).
    pub fn depths_for(&self, kind: Kind) -> DepthPair {
        self.depths.get(&kind).copied().unwrap_or_else(|| DepthTable::for_kind(kind))
    }
}

/// Resolve a [`TrackContext`] for `world` by enumerating the upstream:
/// principal identity, the world's identifier (matched by URL), and,
/// gated by `world.track_changes`, its categories and articles.
pub async fn build_track_context(source: &dyn ObjectSource, world: &WorldConfig) -> Result<TrackContext> {
    let principal = source.identity().await.map_err(into_logged)?;
    let worlds = source.list_worlds(&principal).await.map_err(into_logged)?;
    let matched = worlds
        .into_iter()
        .find(|w| w.url == world.url)
        .ok_or_else(|| EngineError::WorldNotFound(world.url.clone()))?;

    let mut categories = Vec::new();
    let mut articles: HashMap<String, Vec<Identifier>> = HashMap::new();

    if world.track_changes.categories || world.track_changes.articles {
        let cats = source.list_categories(&matched.id).await.map_err(into_logged)?;
        categories = cats.into_iter().map(|c| c.id).collect();
    }

    if world.track_changes.articles {
        let mut category_ids: Vec<String> = categories.iter().map(|c| c.to_string()).collect();
        category_ids.push(UNCATEGORIZED.to_string());
        for cat in category_ids {
            let found = source
                .list_articles(&matched.id, &cat)
                .await
                .map_err(into_logged)?;
            articles.insert(cat, found.into_iter().map(|a| a.id).collect());
        }
    }

    let mut depths = HashMap::new();
    for kind in Kind::ORDER {
        depths.insert(kind, DepthTable::for_kind(kind));
    }

    Ok(TrackContext {
        principal,
        world_id: matched.id,
        world_url: matched.url,
        categories,
        articles,
        depths,
    })
}

fn into_logged(err: SourceError) -> EngineError {
    warn!(error = %err, retryable = err.is_retryable(), "failed to build track context, aborting world for this tick");
    EngineError::Source(err)
}

//─────────────────────────────
//  Per-kind resolution
//─────────────────────────────

/// A single object to resolve: its identifier and the URL echoed into the
/// commit-body line (world/category/article payloads all carry their own
/// `url` field upstream, but the commit line format in spec §6 uses the
/// *configured* world URL for every kind, matching the original
/// `TrackWorld.resolve_world`'s use of `content['url']`).
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The candidate's identifier.
    pub id: Identifier,
    /// The URL logged in the commit body line for this candidate.
    pub url: String,
}

/// Outcome of resolving one kind for one world this tick.
#[derive(Debug, Default)]
pub struct KindReport {
    /// Identifiers whose track-depth payload changed and was applied.
    pub changed: Vec<Identifier>,
    /// The commit id, if a commit was made (`None` means no track-level
    /// change occurred in this kind this tick).
    pub commit: Option<String>,
}

/// Run the two-tier beacon/track change-detection protocol over every
/// candidate of `kind`, writing changed payloads through `store` and
/// persisting registry state through `registries`, then commit and
/// publish once for the whole kind if anything changed.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_kind(
    source: &dyn ObjectSource,
    store: &mut dyn VersionedStore,
    registries: &Registries,
    world_id: &Identifier,
    kind: Kind,
    depth_pair: DepthPair,
    candidates: &[Candidate],
    commit_title: &str,
) -> Result<KindReport> {
    let mut builder = CommitBuilder::seeded(&[BEACON_HASH_REG, TRACK_HASH_REG, FILE_INDEX]);
    let mut changed = Vec::new();

    for candidate in candidates {
        let mut state = SyncState::Idle;
        if let Err(should_abort) =
            resolve_one(source, store, registries, world_id, kind, depth_pair, candidate, &mut builder, &mut state).await?
        {
            if should_abort {
                warn!(%world_id, %kind, id = %candidate.id, "aborting kind for this world this tick");
                break;
            }
        } else {
            changed.push(candidate.id.clone());
        }
    }

    if builder.is_empty() {
        debug!(%world_id, %kind, "no track-level change this tick, no commit");
        return Ok(KindReport { changed, commit: None });
    }

    for path in &builder.staged {
        store.stage(path)?;
    }
    let commit = store.commit(commit_title, &builder.body)?;
    if let Some(oid) = &commit {
        if let Err(e) = store.publish() {
            warn!(%world_id, %kind, commit = %oid, error = %e, "publish failed, local commit stands for next tick");
        }
    }
    builder.flush(&[BEACON_HASH_REG, TRACK_HASH_REG, FILE_INDEX]);

    Ok(KindReport { changed, commit })
}

/// Resolve a single candidate. Returns `Ok(Ok(()))` if a track-level
/// change was applied, `Ok(Err(should_abort))` if nothing changed or the
/// candidate was skipped/failed (`should_abort` distinguishes a
/// retryable-everything-else failure, which aborts the remaining
/// candidates in this kind, from an unchanged or `NotFound` candidate,
/// which simply moves on to the next one).
#[allow(clippy::too_many_arguments)]
async fn resolve_one(
    source: &dyn ObjectSource,
    store: &mut dyn VersionedStore,
    registries: &Registries,
    world_id: &Identifier,
    kind: Kind,
    depth_pair: DepthPair,
    candidate: &Candidate,
    builder: &mut CommitBuilder,
    state: &mut SyncState,
) -> Result<std::result::Result<(), bool>> {
    let id = &candidate.id;

    // Step 1: beacon compare.
    let beacon_payload = match fetch(source, kind, id, depth_pair.beacon).await {
        Ok(p) => p,
        Err(NotFoundOrAbort::NotFound) => {
            warn!(%world_id, %kind, %id, "beacon fetch not found, skipping candidate");
            return Ok(Err(false));
        }
        Err(NotFoundOrAbort::Abort(e)) => {
            warn!(%world_id, %kind, %id, error = %e, "beacon fetch failed");
            return Ok(Err(true));
        }
    };
    transition(state, SyncState::BeaconFetched, world_id, kind, id);

    if registries.beacon.compare_against_entry(id.as_str(), &beacon_payload)? {
        debug!(%world_id, %kind, %id, "beacon unchanged, stopping");
        return Ok(Err(false));
    }

    // Step 2: beacon update.
    registries.beacon.update_entry(id.as_str(), &beacon_payload)?;
    builder.stage(BEACON_HASH_REG);

    // Step 3: track compare.
    let track_payload = match fetch(source, kind, id, depth_pair.track).await {
        Ok(p) => p,
        Err(NotFoundOrAbort::NotFound) => {
            warn!(%world_id, %kind, %id, "track fetch not found, skipping candidate");
            return Ok(Err(false));
        }
        Err(NotFoundOrAbort::Abort(e)) => {
            warn!(%world_id, %kind, %id, error = %e, "track fetch failed");
            return Ok(Err(true));
        }
    };
    transition(state, SyncState::TrackFetched, world_id, kind, id);

    if registries.track.compare_against_entry(id.as_str(), &track_payload)? {
        debug!(%world_id, %kind, %id, "beacon changed but tracked fields did not, no commit");
        return Ok(Err(false));
    }

    // Step 4: track apply.
    store.write_object(id, &track_payload)?;
    transition(state, SyncState::Applied, world_id, kind, id);

    registries.track.update_entry(id.as_str(), &track_payload)?;
    builder.stage(TRACK_HASH_REG);
    builder.stage(id.as_str());
    transition(state, SyncState::Staged, world_id, kind, id);

    builder.note(format!(
        "{id}: {url}, beacon gran: {bd}, track_gran: {td}",
        url = candidate.url,
        bd = depth_pair.beacon,
        td = depth_pair.track,
    ));

    Ok(Ok(()))
}

enum NotFoundOrAbort {
    NotFound,
    Abort(SourceError),
}

async fn fetch(
    source: &dyn ObjectSource,
    kind: Kind,
    id: &Identifier,
    depth: Depth,
) -> std::result::Result<Payload, NotFoundOrAbort> {
    wasync_source::get(source, kind, id, depth).await.map_err(|e| match e {
        SourceError::NotFound(_) => NotFoundOrAbort::NotFound,
        other => NotFoundOrAbort::Abort(other),
    })
}

//─────────────────────────────
//  File-index reconciliation
//─────────────────────────────

/// Build the set of identifiers this daemon intends to track for `ctx`
/// this tick, tagged by kind.
pub fn desired_file_index(ctx: &TrackContext) -> HashMap<String, serde_json::Value> {
    let mut desired = HashMap::new();
    desired.insert(ctx.world_id.to_string(), serde_json::json!(Kind::World.to_string()));
    for cat in &ctx.categories {
        desired.insert(cat.to_string(), serde_json::json!(Kind::Category.to_string()));
    }
    for ids in ctx.articles.values() {
        for article in ids {
            desired.insert(article.to_string(), serde_json::json!(Kind::Article.to_string()));
        }
    }
    desired
}

/// Reconcile the stored file index against `desired`. If the merged
/// result differs from what is currently stored, persist it, stage it,
/// and commit+publish a standalone `"File index updated"` snapshot
/// (spec invariant P6: this commit touches only `file_index`, since the
/// three registry files are always implicitly staged but unmodified here).
pub fn reconcile_file_index(
    store: &mut dyn VersionedStore,
    registries: &Registries,
    desired: HashMap<String, serde_json::Value>,
) -> Result<bool> {
    if registries.file_index.compare_against_registry(&desired)? {
        debug!("file index unchanged");
        return Ok(false);
    }
    registries.file_index.update_registry(desired)?;
    // The CommitBuilder's seed list always carries the three registry
    // files (spec §4.5); a file-index-only tick still "touches" the
    // other two even though their content does not change.
    store.stage(Path::new(BEACON_HASH_REG))?;
    store.stage(Path::new(TRACK_HASH_REG))?;
    store.stage(Path::new(FILE_INDEX))?;
    let commit = store.commit("File index updated", "")?;
    if commit.is_some() {
        if let Err(e) = store.publish() {
            warn!(error = %e, "publish of file index update failed, local commit stands for next tick");
        }
    }
    info!("file index updated");
    Ok(true)
}

//─────────────────────────────
//  World orchestration
//─────────────────────────────

/// Everything that happened while synchronizing one world this tick.
#[derive(Debug, Default)]
pub struct WorldReport {
    /// Whether the file index was reconciled (a commit was made).
    pub file_index_updated: bool,
    /// Outcome of the world kind.
    pub world: KindReport,
    /// Outcome of the category kind, if tracked.
    pub categories: Option<KindReport>,
    /// Outcome of the article kind, if tracked.
    pub articles: Option<KindReport>,
}

/// Synchronize one configured world for one tick: file-index
/// reconciliation, then `world → categories → articles` in order, each a
/// self-contained commit boundary.
pub async fn sync_world(
    source: &dyn ObjectSource,
    store: &mut dyn VersionedStore,
    registries: &Registries,
    world: &WorldConfig,
) -> Result<WorldReport> {
    let ctx = build_track_context(source, world).await?;
    info!(world = %ctx.world_id, principal = %ctx.principal, "track context built");

    let mut report = WorldReport::default();

    let desired = desired_file_index(&ctx);
    report.file_index_updated = reconcile_file_index(store, registries, desired)?;

    let world_candidates = vec![Candidate { id: ctx.world_id.clone(), url: ctx.world_url.clone() }];
    report.world = resolve_kind(
        source,
        store,
        registries,
        &ctx.world_id,
        Kind::World,
        ctx.depths_for(Kind::World),
        &world_candidates,
        Kind::World.commit_title(),
    )
    .await?;

    if world.track_changes.categories {
        let candidates: Vec<Candidate> = ctx
            .categories
            .iter()
            .map(|id| Candidate { id: id.clone(), url: ctx.world_url.clone() })
            .collect();
        report.categories = Some(
            resolve_kind(
                source,
                store,
                registries,
                &ctx.world_id,
                Kind::Category,
                ctx.depths_for(Kind::Category),
                &candidates,
                Kind::Category.commit_title(),
            )
            .await?,
        );
    }

    if world.track_changes.articles {
        let mut candidates = Vec::new();
        for ids in ctx.articles.values() {
            for id in ids {
                candidates.push(Candidate { id: id.clone(), url: ctx.world_url.clone() });
            }
        }
        report.articles = Some(
            resolve_kind(
                source,
                store,
                registries,
                &ctx.world_id,
                Kind::Article,
                ctx.depths_for(Kind::Article),
                &candidates,
                Kind::Article.commit_title(),
            )
            .await?,
        );
    }

    Ok(report)
}
