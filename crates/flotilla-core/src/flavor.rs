//! Flavor — the resource footprint of a guest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::record::{self, Entity, RecordMeta};
use crate::types::{Resources, new_id};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlavorRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub resources: Resources,
}

#[derive(Debug, Clone)]
pub struct Flavor {
    meta: RecordMeta,
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub resources: Resources,
}

impl Context {
    pub fn new_flavor(&self) -> Flavor {
        Flavor {
            meta: RecordMeta::new(self.clone()),
            id: new_id(),
            metadata: BTreeMap::new(),
            resources: Resources::default(),
        }
    }

    pub fn flavor(&self, id: &str) -> Result<Flavor> {
        let mut flavor = self.new_flavor();
        flavor.id = id.to_string();
        if !record::refresh(&mut flavor)? {
            return Err(Error::NotFound {
                kind: "flavor",
                id: id.to_string(),
            });
        }
        Ok(flavor)
    }
}

impl Flavor {
    pub fn refresh(&mut self) -> Result<()> {
        record::refresh(self)?;
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        record::save(self, None)
    }
}

impl Entity for Flavor {
    const KIND: &'static str = "flavors";
    type Record = FlavorRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> FlavorRecord {
        FlavorRecord {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            resources: self.resources,
        }
    }

    fn apply_record(&mut self, record: FlavorRecord) -> Result<()> {
        self.metadata = record.metadata;
        self.resources = record.resources;
        Ok(())
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::StateStore;

    #[test]
    fn resources_are_flattened_into_record() {
        let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
        let mut f = ctx.new_flavor();
        f.resources = Resources::new(1024, 10, 2);
        f.save().unwrap();

        let raw = ctx.store().get(&f.key()).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw.value).unwrap();
        assert_eq!(json["memory"], 1024);
        assert_eq!(json["cpu"], 2);

        let loaded = ctx.flavor(&f.id).unwrap();
        assert_eq!(loaded.resources, f.resources);
    }
}
