#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-source** – Capability interface to the upstream
//! content-management service.
//!
//! This crate defines only the shape of the upstream: the [`ObjectSource`]
//! trait, the error taxonomy upstream failures map into, and a
//! [`FixtureSource`] test double used by the Synchronizer's own test suite
//! and by integration scenarios elsewhere in the workspace. A concrete
//! HTTP-backed client is a narrow external collaborator outside this
//! repository's scope (see spec's Non-goals) — anything satisfying
//! [`ObjectSource`] plugs into the Synchronizer unchanged.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use wasync_types::{Depth, Identifier, Kind, Payload};

/// Errors an [`ObjectSource`] call can fail with, mirroring the upstream's
/// own HTTP error taxonomy plus a local `BadRequest` for boundary
/// validation failures that never reach the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Input failed local validation (bad UUID grammar, depth out of
    /// range) before any network call was attempted.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Transport-level failure (DNS, TLS, timeout, connection refused).
    #[error("connection error: {0}")]
    Connection(String),
    /// The upstream returned a 5xx-class failure.
    #[error("upstream internal server error: {0}")]
    InternalServer(String),
    /// The configured credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The credentials are valid but lack permission for the resource.
    #[error("access forbidden: {0}")]
    AccessForbidden(String),
    /// The requested resource does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was well-formed but the upstream could not process it.
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    /// A catch-all for upstream failures that don't fit another kind.
    #[error("request failed: {0}")]
    Failed(String),
}

impl SourceError {
    /// `true` for every kind except [`SourceError::NotFound`] — per spec,
    /// the Synchronizer retries everything else on the next tick and only
    /// tolerates `NotFound` by skipping the affected child.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::NotFound(_))
    }
}

/// Result alias for ObjectSource operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// A world as returned by world enumeration: its identifier and canonical
/// URL (used to resolve a [`wasync_types::WorldConfig`] entry to an id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSummary {
    /// The world's identifier.
    pub id: Identifier,
    /// The world's canonical URL.
    pub url: String,
}

/// A category as returned by category enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySummary {
    /// The category's identifier.
    pub id: Identifier,
}

/// An article as returned by article enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleSummary {
    /// The article's identifier.
    pub id: Identifier,
}

/// Capability interface to the upstream content-management service.
///
/// Implementations are expected to map their own transport-level error
/// taxonomy onto [`SourceError`] at the boundary; callers never see a
/// transport-specific error type.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Resolve the principal (user) identity behind the configured
    /// credentials.
    async fn identity(&self) -> Result<String>;

    /// Enumerate the worlds owned by `principal`.
    async fn list_worlds(&self, principal: &str) -> Result<Vec<WorldSummary>>;

    /// Enumerate the categories within `world`.
    async fn list_categories(&self, world: &Identifier) -> Result<Vec<CategorySummary>>;

    /// Enumerate the articles within `world` and `category`.
    ///
    /// `category` is either a real category identifier or the literal
    /// sentinel [`wasync_types::UNCATEGORIZED`] (`"-1"`), which every
    /// caller must additionally query to pick up articles with no
    /// assigned category.
    async fn list_articles(&self, world: &Identifier, category: &str) -> Result<Vec<ArticleSummary>>;

    /// Fetch a world payload at the requested depth.
    async fn get_world(&self, id: &Identifier, depth: Depth) -> Result<Payload>;

    /// Fetch a category payload at the requested depth.
    async fn get_category(&self, id: &Identifier, depth: Depth) -> Result<Payload>;

    /// Fetch an article payload at the requested depth.
    async fn get_article(&self, id: &Identifier, depth: Depth) -> Result<Payload>;
}

/// Dispatch a `get` call by [`Kind`] rather than calling
/// `get_world`/`get_category`/`get_article` directly.
///
/// Replaces the upstream's dict-of-callables ("apimethods_mapping")
/// dispatch pattern with a single function over a closed enum, per the
/// redesign guidance: a new `Kind` can never silently miss a dispatch
/// table entry because the match is exhaustive.
pub async fn get(source: &dyn ObjectSource, kind: Kind, id: &Identifier, depth: Depth) -> Result<Payload> {
    debug!(%kind, %id, %depth, "dispatching ObjectSource fetch");
    match kind {
        Kind::World => source.get_world(id, depth).await,
        Kind::Category => source.get_category(id, depth).await,
        Kind::Article => source.get_article(id, depth).await,
    }
}

//─────────────────────────────
//  Test double
//─────────────────────────────

/// An in-memory [`ObjectSource`] double for tests and end-to-end
/// scenarios. Payloads are keyed by `(identifier, depth)` so a test can
/// independently vary beacon- and track-depth content to exercise the
/// two-tier change-detection protocol.
#[derive(Debug, Default)]
pub struct FixtureSource {
    principal: RwLock<String>,
    worlds: RwLock<Vec<WorldSummary>>,
    categories: RwLock<HashMap<Identifier, Vec<CategorySummary>>>,
    articles: RwLock<HashMap<(Identifier, String), Vec<ArticleSummary>>>,
    world_payloads: RwLock<HashMap<(Identifier, i8), Payload>>,
    category_payloads: RwLock<HashMap<(Identifier, i8), Payload>>,
    article_payloads: RwLock<HashMap<(Identifier, i8), Payload>>,
    missing: RwLock<std::collections::HashSet<Identifier>>,
}

impl FixtureSource {
    /// Construct an empty fixture with the given authenticated principal.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: RwLock::new(principal.into()),
            ..Default::default()
        }
    }

    /// Register a world, making it discoverable by [`ObjectSource::list_worlds`].
    pub fn add_world(&self, id: Identifier, url: impl Into<String>) {
        self.worlds.write().unwrap().push(WorldSummary { id, url: url.into() });
    }

    /// Register a category under `world`.
    pub fn add_category(&self, world: Identifier, id: Identifier) {
        self.categories
            .write()
            .unwrap()
            .entry(world)
            .or_default()
            .push(CategorySummary { id });
    }

    /// Register an article under `world` and `category` (use
    /// [`wasync_types::UNCATEGORIZED`] for uncategorized articles).
    pub fn add_article(&self, world: Identifier, category: impl Into<String>, id: Identifier) {
        self.articles
            .write()
            .unwrap()
            .entry((world, category.into()))
            .or_default()
            .push(ArticleSummary { id });
    }

    /// Set (or replace) the payload a world returns at `depth`.
    pub fn set_world_payload(&self, id: Identifier, depth: i8, payload: Payload) {
        self.world_payloads.write().unwrap().insert((id, depth), payload);
    }

    /// Set (or replace) the payload a category returns at `depth`.
    pub fn set_category_payload(&self, id: Identifier, depth: i8, payload: Payload) {
        self.category_payloads.write().unwrap().insert((id, depth), payload);
    }

    /// Set (or replace) the payload an article returns at `depth`.
    pub fn set_article_payload(&self, id: Identifier, depth: i8, payload: Payload) {
        self.article_payloads.write().unwrap().insert((id, depth), payload);
    }

    /// Make subsequent fetches for `id` (any kind) fail with `NotFound`.
    pub fn mark_missing(&self, id: Identifier) {
        self.missing.write().unwrap().insert(id);
    }

    fn check_missing(&self, id: &Identifier) -> Result<()> {
        if self.missing.read().unwrap().contains(id) {
            return Err(SourceError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectSource for FixtureSource {
    async fn identity(&self) -> Result<String> {
        Ok(self.principal.read().unwrap().clone())
    }

    async fn list_worlds(&self, _principal: &str) -> Result<Vec<WorldSummary>> {
        Ok(self.worlds.read().unwrap().clone())
    }

    async fn list_categories(&self, world: &Identifier) -> Result<Vec<CategorySummary>> {
        Ok(self
            .categories
            .read()
            .unwrap()
            .get(world)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_articles(&self, world: &Identifier, category: &str) -> Result<Vec<ArticleSummary>> {
        Ok(self
            .articles
            .read()
            .unwrap()
            .get(&(world.clone(), category.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_world(&self, id: &Identifier, depth: Depth) -> Result<Payload> {
        self.check_missing(id)?;
        self.world_payloads
            .read()
            .unwrap()
            .get(&(id.clone(), depth.value()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("world {id} at depth {depth}")))
    }

    async fn get_category(&self, id: &Identifier, depth: Depth) -> Result<Payload> {
        self.check_missing(id)?;
        self.category_payloads
            .read()
            .unwrap()
            .get(&(id.clone(), depth.value()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("category {id} at depth {depth}")))
    }

    async fn get_article(&self, id: &Identifier, depth: Depth) -> Result<Payload> {
        self.check_missing(id)?;
        self.article_payloads
            .read()
            .unwrap()
            .get(&(id.clone(), depth.value()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("article {id} at depth {depth}")))
    }
}
