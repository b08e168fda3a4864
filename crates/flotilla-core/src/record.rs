//! Optimistic persistence protocol shared by every entity.
//!
//! - `refresh` reads the record and captures its version. A missing record
//!   leaves the entity untouched.
//! - `save` validates, encodes, then writes with compare-and-swap on the
//!   captured version, or create-only when nothing has been captured yet.
//!   A lost race surfaces as `Conflict` (or `AlreadyExists`); the caller
//!   refreshes and retries.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use flotilla_state::{Node, Version};

use crate::context::Context;
use crate::error::{Error, Result};

/// Store handle plus the version the entity was last read or written at.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    ctx: Context,
    version: Option<Version>,
}

impl RecordMeta {
    pub fn new(ctx: Context) -> Self {
        Self { ctx, version: None }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// `None` until the record has been loaded or saved.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }
}

/// A persisted entity kind.
pub trait Entity {
    /// Top-level key segment, e.g. `guests`.
    const KIND: &'static str;

    /// Interchange form written to the store.
    type Record: Serialize + DeserializeOwned;

    fn id(&self) -> &str;

    fn to_record(&self) -> Self::Record;

    /// Overwrite the entity's fields from a decoded record.
    fn apply_record(&mut self, record: Self::Record) -> Result<()>;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Store key holding the record.
    fn key(&self) -> String {
        metadata_key(Self::KIND, self.id())
    }
}

/// `<kind>/<id>/metadata`
pub fn metadata_key(kind: &str, id: &str) -> String {
    format!("{kind}/{id}/metadata")
}

/// `<kind>/<id>/`, the prefix of an entity's record and child keys.
pub fn entity_prefix(kind: &str, id: &str) -> String {
    format!("{kind}/{id}/")
}

/// Reload `entity` from the store.
///
/// Returns false, leaving the entity as it was, if no record exists.
pub fn refresh<E: Entity>(entity: &mut E) -> Result<bool> {
    let key = entity.key();
    let node = entity.meta().ctx().store().get(&key)?;
    match node {
        Some(node) => {
            apply_node(entity, &node)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Decode `node` into `entity` and capture its version.
pub fn apply_node<E: Entity>(entity: &mut E, node: &Node) -> Result<()> {
    let record: E::Record = serde_json::from_str(&node.value).map_err(|e| Error::Decode {
        key: node.key.clone(),
        reason: e.to_string(),
    })?;
    entity.apply_record(record)?;
    entity.meta_mut().set_version(Some(node.version));
    Ok(())
}

/// Validate and write `entity`, gated on its captured version.
pub fn save<E: Entity>(entity: &mut E, ttl: Option<Duration>) -> Result<()> {
    entity.validate()?;

    let key = entity.key();
    let value =
        serde_json::to_string(&entity.to_record()).map_err(|e| Error::Encode(e.to_string()))?;
    let store = entity.meta().ctx().store().clone();

    let node = match entity.meta().version() {
        Some(version) => store.compare_and_swap(&key, &value, ttl, version)?,
        None => store.create(&key, &value, ttl)?,
    };
    entity.meta_mut().set_version(Some(node.version));
    debug!(%key, version = node.version, "record saved");
    Ok(())
}

/// Delete `entity`'s record, gated on its captured version.
pub fn remove<E: Entity>(entity: &mut E) -> Result<()> {
    let version = entity.meta().version().ok_or_else(|| Error::NotFound {
        kind: E::KIND,
        id: entity.id().to_string(),
    })?;
    let key = entity.key();
    entity
        .meta()
        .ctx()
        .store()
        .compare_and_delete(&key, version)?;
    entity.meta_mut().set_version(None);
    debug!(%key, "record removed");
    Ok(())
}

/// IDs of every entity of `kind` with a record, in ID order.
pub fn list_ids(ctx: &Context, kind: &str) -> Result<Vec<String>> {
    let prefix = format!("{kind}/");
    let ids = ctx
        .store()
        .list(&prefix)?
        .iter()
        .filter_map(|node| node.relative_key(&prefix)?.strip_suffix("/metadata"))
        .filter(|id| !id.contains('/'))
        .map(str::to_string)
        .collect();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use flotilla_state::StateStore;

    #[derive(Debug, Serialize, Deserialize)]
    struct WidgetRecord {
        id: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    }

    struct Widget {
        meta: RecordMeta,
        id: String,
        metadata: BTreeMap<String, String>,
    }

    impl Entity for Widget {
        const KIND: &'static str = "widgets";
        type Record = WidgetRecord;

        fn id(&self) -> &str {
            &self.id
        }

        fn to_record(&self) -> WidgetRecord {
            WidgetRecord {
                id: self.id.clone(),
                metadata: self.metadata.clone(),
            }
        }

        fn apply_record(&mut self, record: WidgetRecord) -> Result<()> {
            self.metadata = record.metadata;
            Ok(())
        }

        fn meta(&self) -> &RecordMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut RecordMeta {
            &mut self.meta
        }
    }

    fn widget(ctx: &Context, id: &str) -> Widget {
        Widget {
            meta: RecordMeta::new(ctx.clone()),
            id: id.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn test_ctx() -> Context {
        Context::new(StateStore::open_in_memory().unwrap().shared())
    }

    #[test]
    fn save_then_refresh_round_trips() {
        let ctx = test_ctx();
        let mut w = widget(&ctx, "w1");
        w.metadata.insert("color".into(), "blue".into());
        save(&mut w, None).unwrap();

        let mut loaded = widget(&ctx, "w1");
        assert!(refresh(&mut loaded).unwrap());
        assert_eq!(loaded.metadata["color"], "blue");
        assert_eq!(loaded.meta.version(), w.meta.version());
    }

    #[test]
    fn refresh_missing_is_noop() {
        let ctx = test_ctx();
        let mut w = widget(&ctx, "ghost");
        w.metadata.insert("k".into(), "v".into());

        assert!(!refresh(&mut w).unwrap());
        assert_eq!(w.metadata["k"], "v");
        assert_eq!(w.meta.version(), None);
    }

    #[test]
    fn second_create_is_already_exists() {
        let ctx = test_ctx();
        save(&mut widget(&ctx, "w1"), None).unwrap();

        let err = save(&mut widget(&ctx, "w1"), None).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn stale_save_conflicts_until_refreshed() {
        let ctx = test_ctx();
        let mut a = widget(&ctx, "w1");
        save(&mut a, None).unwrap();

        let mut b = widget(&ctx, "w1");
        refresh(&mut b).unwrap();
        b.metadata.insert("owner".into(), "b".into());
        save(&mut b, None).unwrap();

        a.metadata.insert("owner".into(), "a".into());
        let err = save(&mut a, None).unwrap_err();
        assert!(err.is_conflict());

        refresh(&mut a).unwrap();
        assert_eq!(a.metadata["owner"], "b");
        a.metadata.insert("owner".into(), "a".into());
        save(&mut a, None).unwrap();
        assert!(a.meta.version() > b.meta.version());
    }

    #[test]
    fn undecodable_record_is_decode_error() {
        let ctx = test_ctx();
        ctx.store().set("widgets/w1/metadata", "not json", None).unwrap();

        let err = refresh(&mut widget(&ctx, "w1")).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn remove_requires_captured_version() {
        let ctx = test_ctx();
        let mut w = widget(&ctx, "w1");
        assert!(remove(&mut w).unwrap_err().is_not_found());

        save(&mut w, None).unwrap();
        remove(&mut w).unwrap();
        assert!(ctx.store().get("widgets/w1/metadata").unwrap().is_none());
    }

    #[test]
    fn list_ids_skips_child_keys() {
        let ctx = test_ctx();
        save(&mut widget(&ctx, "b"), None).unwrap();
        save(&mut widget(&ctx, "a"), None).unwrap();
        ctx.store().set("widgets/a/parts/p1", "", None).unwrap();

        assert_eq!(list_ids(&ctx, "widgets").unwrap(), vec!["a", "b"]);
    }
}
