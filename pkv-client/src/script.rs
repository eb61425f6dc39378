//! # Script Cache
//!
//! Purpose: Remember which script bodies the server is believed to have
//! cached, so repeat invocations can send the 40-byte hash instead of the
//! body.
//!
//! ## Design Principles
//! 1. **Optimistic**: An entry only means "assumed loaded"; the executor
//!    falls back to EVAL when the server disagrees.
//! 2. **Explicit Scope**: Entries are keyed by a scope key derived from
//!    `ScriptScope`, so per-connection tracking is a config switch.
//! 3. **Idempotent Updates**: Concurrent promotions of the same hash are
//!    plain overwrites; no cross-caller locking is required.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use sha1::{Digest, Sha1};

/// SHA-1 digest of a script body, the server's script cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHash([u8; 20]);

impl ScriptHash {
    /// Hashes a script body.
    pub fn of(body: &[u8]) -> Self {
        let digest = Sha1::digest(body);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        ScriptHash(out)
    }

    /// Parses a 40-character hex digest as returned by `SCRIPT LOAD`.
    pub fn from_hex(hex_digest: &[u8]) -> Option<Self> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(hex_digest, &mut out).ok()?;
        Some(ScriptHash(out))
    }

    /// Lowercase hex form, as sent with EVALSHA.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self.to_hex())
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A script body paired with its precomputed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: Bytes,
    hash: ScriptHash,
}

impl Script {
    pub fn new(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let hash = ScriptHash::of(&body);
        Script { body, hash }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn hash(&self) -> ScriptHash {
        self.hash
    }
}

/// Believed server-side state of one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// Never run, or forgotten after a flush.
    Unknown,
    /// EVAL or SCRIPT LOAD succeeded since the last flush.
    AssumedLoaded,
}

/// How widely a successful load is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptScope {
    /// One entry per hash for every connection in the pool. Right for a
    /// single server, where the script cache is global.
    #[default]
    Pool,
    /// One entry per hash per pooled connection. Use when pooled
    /// connections may land on different nodes.
    Connection,
}

/// Scope key shared by all connections under `ScriptScope::Pool`.
/// Pool-assigned connection ids start at 1, so it never collides.
const POOL_SCOPE: u64 = 0;

/// Thread-safe map of (scope, hash) → `ScriptState`.
#[derive(Debug, Default)]
pub struct ScriptCache {
    scope: ScriptScope,
    entries: RwLock<HashMap<(u64, ScriptHash), ScriptState>>,
}

impl ScriptCache {
    pub fn new(scope: ScriptScope) -> Self {
        ScriptCache {
            scope,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> ScriptScope {
        self.scope
    }

    fn key(&self, conn_id: u64, hash: ScriptHash) -> (u64, ScriptHash) {
        match self.scope {
            ScriptScope::Pool => (POOL_SCOPE, hash),
            ScriptScope::Connection => (conn_id, hash),
        }
    }

    /// Returns the believed state of `hash` as seen from connection `conn_id`.
    pub fn state(&self, conn_id: u64, hash: ScriptHash) -> ScriptState {
        self.entries
            .read()
            .get(&self.key(conn_id, hash))
            .copied()
            .unwrap_or(ScriptState::Unknown)
    }

    pub fn mark_loaded(&self, conn_id: u64, hash: ScriptHash) {
        let key = self.key(conn_id, hash);
        self.entries.write().insert(key, ScriptState::AssumedLoaded);
    }

    pub fn mark_unknown(&self, conn_id: u64, hash: ScriptHash) {
        let key = self.key(conn_id, hash);
        self.entries.write().remove(&key);
    }

    /// Resets every entry to Unknown.
    pub fn flush(&self) {
        self.entries.write().clear();
    }

    /// Drops per-connection entries for a destroyed connection.
    pub fn forget_connection(&self, conn_id: u64) {
        if self.scope == ScriptScope::Connection {
            self.entries.write().retain(|(scope, _), _| *scope != conn_id);
        }
    }

    /// Number of entries believed loaded.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
