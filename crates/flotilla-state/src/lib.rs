//! flotilla-state — versioned key-value store for Flotilla.
//!
//! Backed by [redb](https://docs.rs/redb), provides the coordination store
//! every other crate builds on: slash-delimited keys, opaque string values,
//! a store-assigned version stamp on every write, TTL expiry, and change
//! notification.
//!
//! # Architecture
//!
//! Every write bumps a single monotonically increasing index and stamps the
//! written node with it. Conditional writes (`create`, `compare_and_swap`,
//! `compare_and_delete`) run their check and their write inside one redb
//! write transaction, so they are atomic with respect to each other.
//!
//! Expired nodes are invisible to reads and conditional writes; the rows
//! themselves are removed by [`StateStore::purge_expired`].
//!
//! Consumers depend on the [`KeyValueStore`] trait rather than on
//! [`StateStore`] so another coordination backend can be plugged in.

pub mod error;
pub mod kv;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use kv::{EventKind, KeyValueStore, Node, SharedStore, Version, WatchEvent, now_ms};
pub use store::StateStore;
