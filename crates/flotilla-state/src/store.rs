//! StateStore — redb-backed versioned key-value store.
//!
//! Every node is JSON-serialized into redb's `&[u8]` value column together
//! with its version and expiry. The store supports both on-disk and
//! in-memory backends (the latter for testing and standalone runs).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::{EventKind, KeyValueStore, Node, Version, WatchEvent, now_ms};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Capacity of the change-notification channel.
const WATCH_CAPACITY: usize = 1024;

/// On-disk envelope for a node.
#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    value: String,
    version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

/// Thread-safe versioned store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Wrap the store in the shared trait-object handle.
    pub fn shared(self) -> crate::kv::SharedStore {
        Arc::new(self)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Remove every node whose lease has run out, emitting `Expire` events.
    ///
    /// Returns the number of nodes removed.
    pub fn purge_expired(&self) -> StateResult<usize> {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let purged = (|| -> StateResult<(Vec<String>, Version)> {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let node = decode_node(key.value(), value.value())?;
                if node.is_expired_at(now) {
                    expired.push(node.key);
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            let version = meta
                .get(INDEX_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            Ok((expired, version))
        })();

        let (expired, version) = match purged {
            Ok(purged) => purged,
            Err(e) => {
                let _ = txn.abort();
                return Err(e);
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        for key in &expired {
            self.notify(key, EventKind::Expire, version);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired nodes purged");
        }
        Ok(expired.len())
    }

    /// Write `value` at `key` if `check` accepts the current live node.
    fn put_with<F>(&self, key: &str, value: &str, ttl: Option<Duration>, check: F) -> StateResult<Node>
    where
        F: FnOnce(Option<&Node>) -> StateResult<()>,
    {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written = (|| -> StateResult<Node> {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current = {
                let guard = table.get(key).map_err(map_err!(Read))?;
                decode_live(key, guard.as_ref().map(|g| g.value()), now)?
            };
            check(current.as_ref())?;

            let node = Node {
                key: key.to_string(),
                value: value.to_string(),
                version: bump_index(&txn)?,
                expires_at_ms: ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
            };
            let bytes = encode_node(&node)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            Ok(node)
        })();

        let node = match written {
            Ok(node) => node,
            Err(e) => {
                let _ = txn.abort();
                return Err(e);
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = node.version, "node written");
        self.notify(key, EventKind::Set, node.version);
        Ok(node)
    }

    /// Remove `key` if `check` returns true for the current live node.
    fn remove_with<F>(&self, key: &str, check: F) -> StateResult<bool>
    where
        F: FnOnce(Option<&Node>) -> StateResult<bool>,
    {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = (|| -> StateResult<Option<Version>> {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current = {
                let guard = table.get(key).map_err(map_err!(Read))?;
                decode_live(key, guard.as_ref().map(|g| g.value()), now)?
            };
            if !check(current.as_ref())? {
                return Ok(None);
            }
            let version = bump_index(&txn)?;
            table.remove(key).map_err(map_err!(Write))?;
            Ok(Some(version))
        })();

        match removed {
            Ok(Some(version)) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(%key, version, "node deleted");
                self.notify(key, EventKind::Delete, version);
                Ok(true)
            }
            Ok(None) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(false)
            }
            Err(e) => {
                let _ = txn.abort();
                Err(e)
            }
        }
    }

    fn notify(&self, key: &str, kind: EventKind, version: Version) {
        // No subscribers is not an error.
        let _ = self.events.send(WatchEvent {
            key: key.to_string(),
            kind,
            version,
        });
    }
}

impl KeyValueStore for StateStore {
    fn get(&self, key: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let guard = table.get(key).map_err(map_err!(Read))?;
        decode_live(key, guard.as_ref().map(|g| g.value()), now_ms())
    }

    fn list(&self, prefix: &str) -> StateResult<Vec<Node>> {
        let now = now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let node = decode_node(key, value.value())?;
            if !node.is_expired_at(now) {
                results.push(node);
            }
        }
        Ok(results)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<Node> {
        self.put_with(key, value, ttl, |_| Ok(()))
    }

    fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<Node> {
        self.put_with(key, value, ttl, |current| match current {
            Some(_) => Err(StateError::AlreadyExists(key.to_string())),
            None => Ok(()),
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_version: Version,
    ) -> StateResult<Node> {
        self.put_with(key, value, ttl, |current| check_version(key, current, prev_version))
    }

    fn compare_and_delete(&self, key: &str, prev_version: Version) -> StateResult<()> {
        self.remove_with(key, |current| {
            check_version(key, current, prev_version).map(|_| true)
        })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        self.remove_with(key, |current| Ok(current.is_some()))
    }

    fn current_version(&self) -> StateResult<Version> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let version = table
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(version)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

/// Gate a conditional write on the live node's version.
fn check_version(key: &str, current: Option<&Node>, expected: Version) -> StateResult<()> {
    match current {
        None => Err(StateError::NotFound(key.to_string())),
        Some(node) if node.version != expected => Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            found: node.version,
        }),
        Some(_) => Ok(()),
    }
}

/// Advance and return the write index.
fn bump_index(txn: &WriteTransaction) -> StateResult<Version> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let next = meta
        .get(INDEX_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn encode_node(node: &Node) -> StateResult<Vec<u8>> {
    let stored = StoredNode {
        value: node.value.clone(),
        version: node.version,
        expires_at_ms: node.expires_at_ms,
    };
    serde_json::to_vec(&stored).map_err(map_err!(Serialize))
}

fn decode_node(key: &str, bytes: &[u8]) -> StateResult<Node> {
    let stored: StoredNode = serde_json::from_slice(bytes).map_err(map_err!(Deserialize))?;
    Ok(Node {
        key: key.to_string(),
        value: stored.value,
        version: stored.version,
        expires_at_ms: stored.expires_at_ms,
    })
}

/// Decode a raw row, hiding it if its lease has run out.
fn decode_live(key: &str, bytes: Option<&[u8]>, now: u64) -> StateResult<Option<Node>> {
    match bytes {
        Some(bytes) => {
            let node = decode_node(key, bytes)?;
            Ok((!node.is_expired_at(now)).then_some(node))
        }
        None => Ok(None),
    }
}
