//! redb table definitions for the Flotilla state store.
//!
//! Keys are slash-delimited paths (`guests/{id}/metadata`). Values in the
//! `nodes` table are JSON-serialized [`StoredNode`](crate::store) envelopes
//! carrying the raw value, its version and its expiry.

use redb::TableDefinition;

/// Key-value nodes keyed by full path.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Store bookkeeping (currently just the write index).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last assigned version.
pub const INDEX_KEY: &str = "index";
