#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-hash** – Canonical stable hashing of structured payloads.
//!
//! The daemon's entire change-detection protocol rests on one property:
//! identical payloads must hash identically across process runs and
//! platforms. This crate owns that contract and nothing else.
//!
//! Canonical serialization intentionally does **not** sort object keys —
//! it reproduces the key-insertion order of whatever `serde_json::Value`
//! was handed in. It also reproduces Python's `json.dumps(value,
//! ensure_ascii=False)` item separators (`", "` between items, `": "`
//! after a key) rather than `serde_json`'s default compact form, since
//! that is the exact byte stream the upstream hashes — matching it is
//! what keeps pre-existing `*_hash_reg` entries valid across a
//! reimplementation. See the crate-level tests for round-trip stability
//! guarantees.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use sha1::{Digest, Sha1};

/// Compute the canonical hex-encoded SHA-1 hash of a structured payload.
///
/// The output is a lowercase 40-character hex string. Canonicality means:
/// object keys are serialized in their existing (insertion) order, items
/// are separated the way Python's `json.dumps` separates them (`", "` /
/// `": "`), and non-ASCII scalars are written as raw UTF-8. Two payloads
/// that are structurally equal (same keys, same order, same values)
/// always hash the same.
pub fn hash(payload: &Value) -> String {
    let canonical = canonical_json(payload);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex_lower(&digest)
}

/// Render a payload to its canonical serialized form.
///
/// Exposed separately from [`hash`] so callers that need the exact bytes
/// being hashed (for debugging, or for writing payload files) don't pay
/// for a second serialization pass.
pub fn canonical_json(payload: &Value) -> String {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, PyCompatFormatter);
    payload
        .serialize(&mut serializer)
        .expect("serializing a serde_json::Value is infallible");
    String::from_utf8(buf).expect("serde_json only ever writes valid UTF-8")
}

/// A `serde_json` [`Formatter`] reproducing Python's default `json.dumps`
/// item separators (`", "` between array/object items, `": "` after an
/// object key), instead of `serde_json`'s compact `","`/`":"`. Every other
/// formatting decision (no key sorting, raw UTF-8 for non-ASCII scalars)
/// already matches `serde_json`'s own [`CompactFormatter`](serde_json::ser::CompactFormatter)
/// default, so only these three hooks need overriding.
struct PyCompatFormatter;

impl Formatter for PyCompatFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
