//! The coordination store interface.
//!
//! [`KeyValueStore`] is the seam between the coordination layer and its
//! backing store. Everything above this crate talks to a
//! [`SharedStore`] and never to a concrete backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use crate::error::StateResult;

/// Store-assigned version stamp. Opaque to callers beyond equality.
pub type Version = u64;

/// Shared handle to a coordination store.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// A live key with its value and version metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: String,
    /// Index of the write that produced this value.
    pub version: Version,
    /// Unix milliseconds after which the node is treated as absent.
    pub expires_at_ms: Option<u64>,
}

impl Node {
    /// Whether the node's lease has run out at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    /// Time left on the node's lease, `None` for nodes without a TTL.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        let at = self.expires_at_ms?;
        Some(Duration::from_millis(at.saturating_sub(now_ms())))
    }

    /// The key relative to `prefix`, or `None` if the node is outside it.
    pub fn relative_key<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        self.key.strip_prefix(prefix)
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Set,
    Delete,
    Expire,
}

/// Change notification emitted after every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    pub version: Version,
}

impl WatchEvent {
    /// True if the event removed the key (delete or expiry).
    pub fn is_removal(&self) -> bool {
        matches!(self.kind, EventKind::Delete | EventKind::Expire)
    }
}

/// Versioned key-value store with TTLs and change notification.
///
/// Conditional operations are atomic per key:
/// - `create` fails with `AlreadyExists` if a live node is present.
/// - `compare_and_swap` / `compare_and_delete` fail with `NotFound` if the
///   key is absent or expired, and with `Conflict` if its version differs.
pub trait KeyValueStore: Send + Sync {
    /// Read a single live node.
    fn get(&self, key: &str) -> StateResult<Option<Node>>;

    /// All live nodes whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> StateResult<Vec<Node>>;

    /// Unconditional write.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<Node>;

    /// Write only if the key is absent.
    fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<Node>;

    /// Write only if the key's current version is `prev_version`.
    fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_version: Version,
    ) -> StateResult<Node>;

    /// Delete only if the key's current version is `prev_version`.
    fn compare_and_delete(&self, key: &str, prev_version: Version) -> StateResult<()>;

    /// Unconditional delete. Returns true if a live node was removed.
    fn delete(&self, key: &str) -> StateResult<bool>;

    /// Index of the most recent write.
    fn current_version(&self) -> StateResult<Version>;

    /// Subscribe to change notifications for every key.
    ///
    /// Subscribe before the read you want to be notified about, so no event
    /// between the read and the wait is missed.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
