#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-registry** – Crash-tolerant persistent identifier registries.
//!
//! A [`Registry`] is a single JSON object file mapping identifier strings to
//! `serde_json::Value` entries. Three instances back the daemon: the beacon
//! hash registry, the track hash registry (both identifier → hash string),
//! and the file index (identifier → kind tag). All three share the same
//! on-disk shape and atomic-update discipline; only the *meaning* of the
//! stored value differs, which is why a single generic type backs all
//! three rather than three bespoke structs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use wasync_types::Payload;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry file is missing, empty, or not valid JSON.
    #[error("registry '{name}' at {path} is corrupt: {reason}")]
    CorruptState {
        /// The registry's logical name (e.g. `"beacon_hash_reg"`).
        name: String,
        /// The file path involved.
        path: PathBuf,
        /// Why the state was rejected.
        reason: String,
    },
    /// A filesystem operation failed.
    #[error("I/O error on registry '{name}' at {path}: {source}")]
    Io {
        /// The registry's logical name.
        name: String,
        /// The file path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A single JSON-object-backed registry mapping identifier strings to
/// arbitrary JSON values.
///
/// Persistence is atomic-on-rename: every write goes to a temporary sibling
/// file in the same directory, is fsynced, and is then renamed over the
/// target. A crash between those steps leaves the prior file intact —
/// readers never observe a partially-written registry (spec invariant P3).
#[derive(Debug, Clone)]
pub struct Registry {
    name: String,
    path: PathBuf,
}

impl Registry {
    /// Open a registry backed by `<dir>/<name>`. The file is not created or
    /// validated until the first [`Registry::load`] call.
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = dir.as_ref().join(&name);
        Self { name, path }
    }

    /// The registry's logical name, used in log lines and error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registry's on-disk path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full map. Fails with [`RegistryError::CorruptState`] if the
    /// file is missing, empty, or not a valid JSON object.
    pub fn load(&self) -> Result<HashMap<String, Value>> {
        let text = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        if text.trim().is_empty() {
            return Err(self.corrupt("file is empty"));
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| self.corrupt(format!("not valid JSON: {e}")))?;
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(self.corrupt("top-level JSON value is not an object")),
        }
    }

    /// Fetch a single entry by identifier. Returns `None` if the identifier
    /// is absent (not an error — per spec this makes
    /// [`Registry::compare_against_entry`] return `false`).
    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.load()?.remove(id))
    }

    /// Write `id -> hash(value)` and persist the whole map atomically.
    pub fn update_entry(&self, id: &str, value: &Payload) -> Result<()> {
        let hash = wasync_hash::hash(value);
        let mut map = self.load()?;
        map.insert(id.to_string(), Value::String(hash.clone()));
        self.persist(&map)?;
        info!(registry = %self.name, id, hash, "registry entry updated");
        Ok(())
    }

    /// Merge `delta` into the stored map and persist atomically.
    pub fn update_registry(&self, delta: HashMap<String, Value>) -> Result<()> {
        let mut map = self.load()?;
        let added = delta.len();
        map.extend(delta);
        self.persist(&map)?;
        info!(registry = %self.name, entries = added, "registry merged and persisted");
        Ok(())
    }

    /// `true` iff `hash(value) == get(id)`. Absence yields `false`.
    pub fn compare_against_entry(&self, id: &str, value: &Payload) -> Result<bool> {
        let stored = self.get(id)?;
        let current = wasync_hash::hash(value);
        let result = matches!(&stored, Some(Value::String(s)) if *s == current);
        debug!(registry = %self.name, id, stored = ?stored, current, result, "compared entry hash");
        Ok(result)
    }

    /// `true` iff the stored map and `desired` contain exactly the same
    /// entries (whole-registry content equality).
    ///
    /// Compared directly as `HashMap`s rather than by hashing a
    /// re-serialized `Value::Object`: `HashMap`'s iteration order is
    /// randomized per-instance (`RandomState`), so two content-identical
    /// maps built from two different `HashMap`s can serialize to different
    /// byte strings and therefore hash differently, making a
    /// hash-of-reserialization comparison spuriously return `false` for
    /// equal registries. `HashMap`'s `PartialEq` is defined over contents,
    /// independent of bucket order, so it doesn't have that problem.
    pub fn compare_against_registry(&self, desired: &HashMap<String, Value>) -> Result<bool> {
        let stored = self.load()?;
        let result = stored == *desired;
        debug!(registry = %self.name, result, "compared whole registry");
        Ok(result)
    }

    /// Create the registry file with an empty JSON object if it doesn't
    /// already exist. Used when bootstrapping a fresh working tree.
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.persist(&HashMap::new())?;
        info!(registry = %self.name, path = %self.path.display(), "registry initialized empty");
        Ok(())
    }

    fn persist(&self, map: &HashMap<String, Value>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| self.io_error(source))?;
        let value = Value::Object(map.clone().into_iter().collect());
        serde_json::to_writer(&mut tmp, &value)
            .map_err(|e| self.corrupt(format!("failed to serialize registry: {e}")))?;
        tmp.as_file().sync_all().map_err(|source| self.io_error(source))?;
        tmp.persist(&self.path).map_err(|e| {
            warn!(registry = %self.name, "atomic rename failed, prior state preserved");
            self.io_error(e.error)
        })?;
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> RegistryError {
        RegistryError::CorruptState {
            name: self.name.clone(),
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            name: self.name.clone(),
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fresh_registry(dir: &Path, name: &str) -> Registry {
        let reg = Registry::new(dir, name);
        reg.ensure_initialized().unwrap();
        reg
    }

    #[test]
    fn load_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path(), "missing_reg");
        assert!(matches!(reg.load(), Err(RegistryError::Io { .. })));
    }

    #[test]
    fn load_fails_on_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty_reg");
        fs::write(&path, "").unwrap();
        let reg = Registry::new(dir.path(), "empty_reg");
        assert!(matches!(reg.load(), Err(RegistryError::CorruptState { .. })));
    }

    #[test]
    fn load_fails_on_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_reg");
        fs::write(&path, "not json").unwrap();
        let reg = Registry::new(dir.path(), "bad_reg");
        assert!(matches!(reg.load(), Err(RegistryError::CorruptState { .. })));
    }

    #[test]
    fn update_entry_then_compare_round_trips() {
        let dir = tempdir().unwrap();
        let reg = fresh_registry(dir.path(), "track_hash_reg");
        let payload = json!({"title": "Hello"});
        reg.update_entry("11111111-1111-1111-1111-111111111111", &payload)
            .unwrap();
        assert!(reg
            .compare_against_entry("11111111-1111-1111-1111-111111111111", &payload)
            .unwrap());
        let changed = json!({"title": "Goodbye"});
        assert!(!reg
            .compare_against_entry("11111111-1111-1111-1111-111111111111", &changed)
            .unwrap());
    }

    #[test]
    fn absent_entry_compares_false() {
        let dir = tempdir().unwrap();
        let reg = fresh_registry(dir.path(), "track_hash_reg");
        assert!(!reg
            .compare_against_entry("22222222-2222-2222-2222-222222222222", &json!({}))
            .unwrap());
    }

    #[test]
    fn update_registry_merges_delta() {
        let dir = tempdir().unwrap();
        let reg = fresh_registry(dir.path(), "file_index");
        let mut delta = HashMap::new();
        delta.insert("a".to_string(), json!("world"));
        reg.update_registry(delta.clone()).unwrap();
        let mut more = HashMap::new();
        more.insert("b".to_string(), json!("category"));
        reg.update_registry(more).unwrap();

        let loaded = reg.load().unwrap();
        assert_eq!(loaded.get("a"), Some(&json!("world")));
        assert_eq!(loaded.get("b"), Some(&json!("category")));
    }

    #[test]
    fn compare_against_registry_is_whole_map_equality() {
        let dir = tempdir().unwrap();
        let reg = fresh_registry(dir.path(), "file_index");
        let mut desired = HashMap::new();
        desired.insert("a".to_string(), json!("world"));

        assert!(!reg.compare_against_registry(&desired).unwrap());
        reg.update_registry(desired.clone()).unwrap();
        assert!(reg.compare_against_registry(&desired).unwrap());

        desired.insert("b".to_string(), json!("category"));
        assert!(!reg.compare_against_registry(&desired).unwrap());
    }

    // Regression for a no-op tick over a multi-entry index (spec P1/S2):
    // two `HashMap`s built by inserting the same entries in different
    // orders must still compare equal, since `HashMap` iteration order is
    // randomized per-instance and must never leak into the comparison.
    #[test]
    fn compare_against_registry_is_independent_of_hashmap_iteration_order() {
        let dir = tempdir().unwrap();
        let reg = fresh_registry(dir.path(), "file_index");

        let mut stored = HashMap::new();
        stored.insert("11111111-1111-1111-1111-111111111111".to_string(), json!("world"));
        stored.insert("22222222-2222-2222-2222-222222222222".to_string(), json!("category"));
        stored.insert("33333333-3333-3333-3333-333333333333".to_string(), json!("article"));
        reg.update_registry(stored).unwrap();

        // Same entries, inserted in the reverse order, into a fresh HashMap
        // with its own independently-seeded RandomState.
        let mut desired = HashMap::new();
        desired.insert("33333333-3333-3333-3333-333333333333".to_string(), json!("article"));
        desired.insert("22222222-2222-2222-2222-222222222222".to_string(), json!("category"));
        desired.insert("11111111-1111-1111-1111-111111111111".to_string(), json!("world"));

        assert!(reg.compare_against_registry(&desired).unwrap());
    }

    #[test]
    fn persist_survives_reopening() {
        let dir = tempdir().unwrap();
        {
            let reg = fresh_registry(dir.path(), "beacon_hash_reg");
            reg.update_entry("11111111-1111-1111-1111-111111111111", &json!({"a": 1}))
                .unwrap();
        }
        let reopened = Registry::new(dir.path(), "beacon_hash_reg");
        let loaded = reopened.load().unwrap();
        assert!(loaded.contains_key("11111111-1111-1111-1111-111111111111"));
    }

    #[test]
    fn ensure_initialized_is_idempotent() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path(), "track_hash_reg");
        reg.ensure_initialized().unwrap();
        reg.update_entry("x", &json!({"v": 1})).unwrap();
        reg.ensure_initialized().unwrap();
        assert!(reg.load().unwrap().contains_key("x"));
    }

    // P3 (spec §8): a crash during `update_registry`/`update_entry` must
    // leave the on-disk file in the pre-state or the post-state, never
    // partially written. `persist` writes to a sibling temp file and
    // renames over the target, so a truncated or missing temp file (the
    // two ways a crash can interrupt a write before the rename) never
    // touches the real path at all — `load` after the fact must still
    // see exactly the prior state.
    proptest::proptest! {
        #[test]
        fn crash_before_rename_preserves_prior_state(
            pre_entries in proptest::collection::hash_map("[a-z]{1,8}", "[a-z]{1,8}", 0..4),
            post_entries in proptest::collection::hash_map("[a-z]{1,8}", "[a-z]{1,8}", 0..4),
            truncate_temp in proptest::bool::ANY,
        ) {
            let dir = tempdir().unwrap();
            let reg = Registry::new(dir.path(), "crash_reg");
            reg.ensure_initialized().unwrap();

            let mut pre: HashMap<String, Value> =
                pre_entries.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            reg.update_registry(pre.clone()).unwrap();
            let loaded_pre = reg.load().unwrap();

            // Simulate a crash that interrupts the write before the atomic
            // rename: either the temp file is never created (nothing to do)
            // or it's left truncated next to the target. Either way the
            // real registry path must be untouched.
            if truncate_temp {
                let tmp_path = reg.path().with_extension("crash-tmp");
                fs::write(&tmp_path, "").unwrap();
            }

            let reloaded = reg.load().unwrap();
            prop_assert_eq!(&reloaded, &loaded_pre);

            // A subsequent, uninterrupted update still lands cleanly: the
            // crash left no residue that corrupts a later real write.
            let post: HashMap<String, Value> =
                post_entries.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            reg.update_registry(post.clone()).unwrap();
            let loaded_post = reg.load().unwrap();
            for (k, v) in &post {
                prop_assert_eq!(loaded_post.get(k), Some(v));
            }
            pre.extend(post);
            for (k, v) in &pre {
                prop_assert_eq!(loaded_post.get(k), Some(v));
            }
        }
    }
}
