//! # Parameter Objects
//!
//! Immutable optional-field records for commands with many optional
//! arguments. Fields may be set in any order; `add_params` always emits them
//! in the fixed protocol order listed on each type, so two objects with the
//! same present fields encode to identical tokens.
//!
//! ## Usage
//!
//! ```rust
//! use pkv_common::params::{DuplicatePolicy, TsIncrByParams};
//! use pkv_common::args::encode;
//!
//! let params = TsIncrByParams::new()
//!     .label("sensor", "t1")
//!     .duplicate_policy(DuplicatePolicy::Last)
//!     .retention(60_000);
//! let args = encode(params);
//! assert_eq!(args.len(), 7);
//! ```

use bytes::Bytes;

use crate::args::{CommandArguments, IntoArg, Params};
use crate::keyword::Keyword;

/// Chunk encoding for a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    Compressed,
    Uncompressed,
}

impl IntoArg for EncodingFormat {
    fn into_arg(self) -> Bytes {
        Bytes::from_static(match self {
            EncodingFormat::Compressed => b"COMPRESSED",
            EncodingFormat::Uncompressed => b"UNCOMPRESSED",
        })
    }
}

/// Policy applied when a sample for an existing timestamp arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Block,
    First,
    Last,
    Min,
    Max,
    Sum,
}

impl IntoArg for DuplicatePolicy {
    fn into_arg(self) -> Bytes {
        Bytes::from_static(match self {
            DuplicatePolicy::Block => b"BLOCK",
            DuplicatePolicy::First => b"FIRST",
            DuplicatePolicy::Last => b"LAST",
            DuplicatePolicy::Min => b"MIN",
            DuplicatePolicy::Max => b"MAX",
            DuplicatePolicy::Sum => b"SUM",
        })
    }
}

/// Optional arguments of `TS.INCRBY` / `TS.DECRBY`.
///
/// Emission order: TIMESTAMP, RETENTION, ENCODING, CHUNK_SIZE,
/// DUPLICATE_POLICY, IGNORE, LABELS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TsIncrByParams {
    timestamp: Option<i64>,
    retention: Option<u64>,
    encoding: Option<EncodingFormat>,
    chunk_size: Option<u64>,
    duplicate_policy: Option<DuplicatePolicy>,
    ignore: Option<(u64, f64)>,
    labels: Option<Vec<(String, String)>>,
}

impl TsIncrByParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit sample timestamp in milliseconds.
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Retention period in milliseconds, applied if the series is created.
    pub fn retention(mut self, retention_ms: u64) -> Self {
        self.retention = Some(retention_ms);
        self
    }

    pub fn encoding(mut self, encoding: EncodingFormat) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    /// Drops samples within both thresholds of the previous one.
    pub fn ignore(mut self, max_time_diff: u64, max_val_diff: f64) -> Self {
        self.ignore = Some((max_time_diff, max_val_diff));
        self
    }

    /// Replaces all labels with `labels`, keeping their iteration order.
    pub fn labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut list = Vec::new();
        for (label, value) in labels {
            upsert_label(&mut list, label.into(), value.into());
        }
        self.labels = Some(list);
        self
    }

    /// Adds one label. Re-adding a label replaces its value in place.
    pub fn label(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        let list = self.labels.get_or_insert_with(Vec::new);
        upsert_label(list, label.into(), value.into());
        self
    }
}

fn upsert_label(list: &mut Vec<(String, String)>, label: String, value: String) {
    match list.iter_mut().find(|(existing, _)| *existing == label) {
        Some(entry) => entry.1 = value,
        None => list.push((label, value)),
    }
}

impl Params for TsIncrByParams {
    fn add_params(self, args: &mut CommandArguments) {
        if let Some(timestamp) = self.timestamp {
            args.add(Keyword::Timestamp).add(timestamp);
        }
        if let Some(retention) = self.retention {
            args.add(Keyword::Retention).add(retention);
        }
        if let Some(encoding) = self.encoding {
            args.add(Keyword::Encoding).add(encoding);
        }
        if let Some(chunk_size) = self.chunk_size {
            args.add(Keyword::ChunkSize).add(chunk_size);
        }
        if let Some(policy) = self.duplicate_policy {
            args.add(Keyword::DuplicatePolicy).add(policy);
        }
        if let Some((max_time_diff, max_val_diff)) = self.ignore {
            args.add(Keyword::Ignore).add(max_time_diff).add(max_val_diff);
        }
        if let Some(labels) = self.labels {
            args.add(Keyword::Labels);
            for (label, value) in labels {
                args.add(label).add(value);
            }
        }
    }
}

/// Write condition for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// Only set when the key does not exist.
    Nx,
    /// Only set when the key already exists.
    Xx,
}

/// Expiration option for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetExpiry {
    /// Seconds from now.
    Ex(u64),
    /// Milliseconds from now.
    Px(u64),
    /// Unix time in seconds.
    ExAt(u64),
    /// Unix time in milliseconds.
    PxAt(u64),
    /// Retain the existing TTL.
    KeepTtl,
}

/// Optional arguments of `SET`.
///
/// Emission order: NX|XX, GET, EX|PX|EXAT|PXAT|KEEPTTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetParams {
    condition: Option<SetCondition>,
    get: bool,
    expiry: Option<SetExpiry>,
}

impl SetParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nx(mut self) -> Self {
        self.condition = Some(SetCondition::Nx);
        self
    }

    pub fn xx(mut self) -> Self {
        self.condition = Some(SetCondition::Xx);
        self
    }

    /// Return the previous value.
    pub fn get(mut self) -> Self {
        self.get = true;
        self
    }

    pub fn expiry(mut self, expiry: SetExpiry) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// True when `GET` was requested and the reply is the old value.
    pub fn returns_previous(&self) -> bool {
        self.get
    }
}

impl Params for SetParams {
    fn add_params(self, args: &mut CommandArguments) {
        match self.condition {
            Some(SetCondition::Nx) => {
                args.add(Keyword::Nx);
            }
            Some(SetCondition::Xx) => {
                args.add(Keyword::Xx);
            }
            None => {}
        }
        if self.get {
            args.add(Keyword::Get);
        }
        match self.expiry {
            Some(SetExpiry::Ex(seconds)) => {
                args.add(Keyword::Ex).add(seconds);
            }
            Some(SetExpiry::Px(millis)) => {
                args.add(Keyword::Px).add(millis);
            }
            Some(SetExpiry::ExAt(seconds)) => {
                args.add(Keyword::ExAt).add(seconds);
            }
            Some(SetExpiry::PxAt(millis)) => {
                args.add(Keyword::PxAt).add(millis);
            }
            Some(SetExpiry::KeepTtl) => {
                args.add(Keyword::KeepTtl);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::encode;

    fn as_strings(args: &CommandArguments) -> Vec<String> {
        args.iter()
            .map(|token| String::from_utf8_lossy(token).into_owned())
            .collect()
    }

    #[test]
    fn empty_params_emit_nothing() {
        assert!(encode(TsIncrByParams::new()).is_empty());
        assert!(encode(SetParams::new()).is_empty());
    }

    #[test]
    fn ts_params_follow_protocol_order() {
        let params = TsIncrByParams::new()
            .label("room", "kitchen")
            .ignore(5, 0.5)
            .duplicate_policy(DuplicatePolicy::Sum)
            .chunk_size(4096)
            .encoding(EncodingFormat::Uncompressed)
            .retention(60_000)
            .timestamp(1_700_000_000_000);

        assert_eq!(
            as_strings(&encode(params)),
            [
                "TIMESTAMP",
                "1700000000000",
                "RETENTION",
                "60000",
                "ENCODING",
                "UNCOMPRESSED",
                "CHUNK_SIZE",
                "4096",
                "DUPLICATE_POLICY",
                "SUM",
                "IGNORE",
                "5",
                "0.5",
                "LABELS",
                "room",
                "kitchen",
            ]
        );
    }

    #[test]
    fn population_order_does_not_change_encoding() {
        let first = TsIncrByParams::new()
            .timestamp(10)
            .retention(20)
            .chunk_size(30)
            .ignore(1, 2.5);
        let second = TsIncrByParams::new()
            .ignore(1, 2.5)
            .chunk_size(30)
            .retention(20)
            .timestamp(10);
        assert_eq!(encode(first), encode(second));

        let set_a = SetParams::new().expiry(SetExpiry::Px(1500)).get().nx();
        let set_b = SetParams::new().nx().get().expiry(SetExpiry::Px(1500));
        assert_eq!(encode(set_a), encode(set_b));
    }

    #[test]
    fn labels_keep_insertion_order() {
        let zyx = TsIncrByParams::new().label("z", "1").label("y", "2").label("x", "3");
        assert_eq!(
            as_strings(&encode(zyx)),
            ["LABELS", "z", "1", "y", "2", "x", "3"]
        );

        let xyz = TsIncrByParams::new().label("x", "3").label("y", "2").label("z", "1");
        assert_eq!(
            as_strings(&encode(xyz)),
            ["LABELS", "x", "3", "y", "2", "z", "1"]
        );
    }

    #[test]
    fn relabel_replaces_value_in_place() {
        let params = TsIncrByParams::new()
            .label("a", "1")
            .label("b", "2")
            .label("a", "9");
        assert_eq!(as_strings(&encode(params)), ["LABELS", "a", "9", "b", "2"]);

        let replaced = TsIncrByParams::new()
            .label("old", "x")
            .labels([("k1", "v1"), ("k2", "v2")]);
        assert_eq!(
            as_strings(&encode(replaced)),
            ["LABELS", "k1", "v1", "k2", "v2"]
        );
    }

    #[test]
    fn set_params_flags_and_expiry() {
        let params = SetParams::new().xx().expiry(SetExpiry::KeepTtl);
        assert_eq!(as_strings(&encode(params)), ["XX", "KEEPTTL"]);

        let params = SetParams::new().expiry(SetExpiry::ExAt(1_700_000_000));
        assert_eq!(as_strings(&encode(params)), ["EXAT", "1700000000"]);
    }
}
