//! Network — an ordered collection of subnets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use flotilla_state::StateError;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::record::{self, Entity, RecordMeta};
use crate::subnet::Subnet;
use crate::types::new_id;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Network {
    meta: RecordMeta,
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

impl Context {
    pub fn new_network(&self) -> Network {
        Network {
            meta: RecordMeta::new(self.clone()),
            id: new_id(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn network(&self, id: &str) -> Result<Network> {
        let mut network = self.new_network();
        network.id = id.to_string();
        if !record::refresh(&mut network)? {
            return Err(Error::NotFound {
                kind: "network",
                id: id.to_string(),
            });
        }
        Ok(network)
    }
}

impl Network {
    pub fn refresh(&mut self) -> Result<()> {
        record::refresh(self)?;
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        record::save(self, None)
    }

    fn subnets_prefix(&self) -> String {
        format!("networks/{}/subnets/", self.id)
    }

    /// Add `subnet` to the network and record the membership on the subnet.
    ///
    /// Adding a subnet twice keeps its original position.
    pub fn add_subnet(&self, subnet: &mut Subnet) -> Result<()> {
        let key = format!("{}{}", self.subnets_prefix(), subnet.id);
        match self.meta.ctx().store().create(&key, "", None) {
            Ok(_) | Err(StateError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        subnet.network_id = self.id.clone();
        subnet.save()?;
        info!(network = %self.id, subnet = %subnet.id, "subnet added to network");
        Ok(())
    }

    /// Drop a subnet from the network. Returns false if it was not a member.
    pub fn remove_subnet(&self, subnet_id: &str) -> Result<bool> {
        let key = format!("{}{subnet_id}", self.subnets_prefix());
        Ok(self.meta.ctx().store().delete(&key)?)
    }

    /// Member subnet IDs in the order they were added.
    pub fn subnets(&self) -> Result<Vec<String>> {
        let prefix = self.subnets_prefix();
        let mut members = self.meta.ctx().store().list(&prefix)?;
        members.sort_by_key(|node| node.version);
        Ok(members
            .iter()
            .filter_map(|node| node.relative_key(&prefix))
            .map(str::to_string)
            .collect())
    }
}

impl Entity for Network {
    const KIND: &'static str = "networks";
    type Record = NetworkRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> NetworkRecord {
        NetworkRecord {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    fn apply_record(&mut self, record: NetworkRecord) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::StateStore;

    #[test]
    fn subnets_keep_insertion_order() {
        let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
        let mut n = ctx.new_network();
        n.save().unwrap();

        let mut ids = Vec::new();
        for cidr in ["10.0.2.0/24", "10.0.1.0/24", "10.0.3.0/24"] {
            let mut s = ctx.new_subnet(cidr.parse().unwrap());
            n.add_subnet(&mut s).unwrap();
            ids.push(s.id.clone());
        }
        assert_eq!(n.subnets().unwrap(), ids);

        let s = ctx.subnet(&ids[0]).unwrap();
        assert_eq!(s.network_id, n.id);

        assert!(n.remove_subnet(&ids[1]).unwrap());
        assert!(!n.remove_subnet(&ids[1]).unwrap());
        assert_eq!(n.subnets().unwrap(), vec![ids[0].clone(), ids[2].clone()]);
    }

    #[test]
    fn missing_network_is_not_found() {
        let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
        assert!(ctx.network("nope").unwrap_err().is_not_found());
    }
}
