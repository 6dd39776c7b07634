#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-types** – Shared primitive data structures for the wasync
//! synchronization daemon.
//!
//! The crate is dependency-light and sits at the bottom of the crate graph:
//! every other `wasync-*` crate depends on it, and it depends on nothing
//! beyond `serde`/`serde_json` and `thiserror`. It makes no assumptions
//! about I/O, hashing, or persistence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

//─────────────────────────────
//  Identifier
//─────────────────────────────

/// The all-zero UUID that represents "no entity" and the empty payload.
pub const NULL_IDENTIFIER: &str = "00000000-0000-0000-0000-000000000000";

/// The sentinel category id the upstream uses for uncategorized articles.
pub const UNCATEGORIZED: &str = "-1";

/// Errors raised while constructing or validating a [`Identifier`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    /// The input did not match the canonical 8-4-4-4-12 hex grammar.
    #[error("'{0}' is not a canonical UUID (expected 8-4-4-4-12 hex)")]
    MalformedUuid(String),
}

/// A canonical, case-insensitive 36-character UUID identifying a world,
/// category, or article.
///
/// Stored normalized to lowercase so that two textually different but
/// equivalent identifiers compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// The sentinel identifier representing "no entity".
    pub fn null() -> Self {
        Self(NULL_IDENTIFIER.to_string())
    }

    /// Validate and construct an identifier from its canonical text form.
    ///
    /// Accepts any case but normalizes storage to lowercase.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        if !is_canonical_uuid(raw) {
            return Err(IdentifierError::MalformedUuid(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// Borrow the identifier as plain text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the sentinel null identifier.
    pub fn is_null(&self) -> bool {
        self.0 == NULL_IDENTIFIER
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

fn is_canonical_uuid(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

//─────────────────────────────
//  Depth
//─────────────────────────────

/// Errors raised while constructing a [`Depth`] or [`DepthPair`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepthError {
    /// The value fell outside the valid `[-1, 9]` range.
    #[error("depth {0} is out of range [-1, 9]")]
    OutOfRange(i8),
    /// The beacon depth exceeded the track depth (invariant I5).
    #[error("beacon depth {beacon} exceeds track depth {track}")]
    BeaconExceedsTrack {
        /// The offending beacon depth.
        beacon: i8,
        /// The track depth it was compared against.
        track: i8,
    },
}

/// Fetch depth requested from the ObjectSource: an integer in `[-1, 9]`.
/// Higher values request more fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct Depth(i8);

impl Depth {
    /// Construct a depth, validating the `[-1, 9]` range.
    pub fn new(value: i8) -> Result<Self, DepthError> {
        if !(-1..=9).contains(&value) {
            return Err(DepthError::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// The raw integer value.
    pub fn value(self) -> i8 {
        self.0
    }
}

impl TryFrom<i8> for Depth {
    type Error = DepthError;
    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Depth> for i8 {
    fn from(depth: Depth) -> Self {
        depth.0
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Beacon and track depths for a single kind, with the `beacon <= track`
/// invariant (spec invariant I5) enforced at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthPair {
    /// Cheap depth used to short-circuit change detection.
    pub beacon: Depth,
    /// Full depth persisted to the working tree.
    pub track: Depth,
}

impl DepthPair {
    /// Construct a depth pair, rejecting `beacon > track`.
    pub fn new(beacon: Depth, track: Depth) -> Result<Self, DepthError> {
        if beacon > track {
            return Err(DepthError::BeaconExceedsTrack {
                beacon: beacon.value(),
                track: track.value(),
            });
        }
        Ok(Self { beacon, track })
    }
}

/// The default depth table for the three object kinds, per the currently
/// deployed configuration (world/categories beacon at 0, articles beacon at
/// -1; track at 1 for all three).
pub struct DepthTable;

impl DepthTable {
    /// Default beacon/track pair for [`Kind::World`].
    pub fn world() -> DepthPair {
        DepthPair::new(Depth::new(0).unwrap(), Depth::new(1).unwrap()).unwrap()
    }

    /// Default beacon/track pair for [`Kind::Category`].
    pub fn category() -> DepthPair {
        DepthPair::new(Depth::new(0).unwrap(), Depth::new(1).unwrap()).unwrap()
    }

    /// Default beacon/track pair for [`Kind::Article`].
    pub fn article() -> DepthPair {
        DepthPair::new(Depth::new(-1).unwrap(), Depth::new(1).unwrap()).unwrap()
    }

    /// Look up the default depth pair for a given kind.
    pub fn for_kind(kind: Kind) -> DepthPair {
        match kind {
            Kind::World => Self::world(),
            Kind::Category => Self::category(),
            Kind::Article => Self::article(),
        }
    }
}

//─────────────────────────────
//  Kind
//─────────────────────────────

/// The three object kinds the daemon tracks, in processing order
/// (`World` before `Category` before `Article`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// A world (the root container).
    World,
    /// A category within a world.
    Category,
    /// An article within a world, possibly uncategorized.
    Article,
}

impl Kind {
    /// All kinds, in the order the Synchronizer resolves them.
    pub const ORDER: [Kind; 3] = [Kind::World, Kind::Category, Kind::Article];

    /// The commit title used when this kind has at least one change.
    pub fn commit_title(self) -> &'static str {
        match self {
            Kind::World => "World update",
            Kind::Category => "Categories update",
            Kind::Article => "Articles update",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::World => "world",
            Kind::Category => "category",
            Kind::Article => "article",
        };
        f.write_str(s)
    }
}

//─────────────────────────────
//  Payload
//─────────────────────────────

/// Structured data returned by the ObjectSource for an identifier at a
/// given depth: nested mappings and sequences of primitives.
///
/// Represented as `serde_json::Value` to match the untyped payloads the
/// upstream API actually returns; the Hasher (in `wasync-hash`) is the only
/// component that cares about its exact serialized form.
pub type Payload = serde_json::Value;

//─────────────────────────────
//  World configuration
//─────────────────────────────

/// Per-kind tracking toggles for a single configured world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackChanges {
    /// Track world-level changes. Always effectively true: a world is the
    /// entry point for every other kind, but the flag is kept for parity
    /// with the upstream configuration grammar.
    #[serde(default)]
    pub world: bool,
    /// Track category-level changes.
    #[serde(default)]
    pub categories: bool,
    /// Track article-level changes.
    #[serde(default)]
    pub articles: bool,
}

/// A single configured world: its canonical URL and which kinds to track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    /// The upstream URL used to resolve this world's identifier.
    pub url: String,
    /// Which object kinds to track for this world.
    pub track_changes: TrackChanges,
}
