// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Key/value data model shared by every datastore backend.
//!
//! Keys are slash-delimited paths (`/registry/...`). Every successful
//! mutation stamps the affected key with a cluster-wide revision drawn from a
//! single monotonically increasing counter; historic revisions of a key stay
//! readable until the compactor prunes them.

use serde::{Deserialize, Serialize};

/// A single key/value record at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which this key was last created.
    pub create_revision: i64,
    /// Revision of the mutation that produced this record.
    pub mod_revision: i64,
    /// Per-key mutation count, starting at 1 on create.
    pub version: i64,
    /// Attached lease ID, or zero.
    pub lease: i64,
}

/// Kind of change carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// A change event generated inside the mutation transaction.
///
/// For a `Create`, `prev_kv` is `None`. For a `Delete`, `kv` is the tombstone
/// (empty value, `mod_revision` set to the deleting revision) and `prev_kv`
/// the last live record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// Revision at which this event was committed.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// Compute the exclusive upper bound of a prefix scan.
///
/// Mirrors the range-end convention of the wire protocol: increment the last
/// byte of the prefix. An empty prefix scans the whole keyspace; the returned
/// sentinel `\0` with an empty prefix means "no upper bound" to the SQL layer.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last < 0xff {
            *last += 1;
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes.pop();
    }
    // Prefix was empty or all 0xff: scan to the end of the keyspace.
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end_increments_last_byte() {
        assert_eq!(prefix_range_end("/registry/"), "/registry0");
        assert_eq!(prefix_range_end("/a"), "/b");
    }

    #[test]
    fn test_prefix_range_end_empty_prefix_is_unbounded() {
        assert_eq!(prefix_range_end(""), "");
    }

    #[test]
    fn test_event_revision_tracks_mod_revision() {
        let event = Event {
            kind: EventKind::Update,
            kv: KeyValue {
                key: "/a".to_string(),
                mod_revision: 42,
                ..Default::default()
            },
            prev_kv: None,
        };
        assert_eq!(event.revision(), 42);
    }
}
