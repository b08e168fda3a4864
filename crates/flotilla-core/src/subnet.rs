//! Subnet — an IPv4 range and its address reservations.
//!
//! Reservations are child keys `subnets/<id>/addresses/<ip>` holding the
//! owner's ID. Each is written create-if-absent, so two owners can never
//! hold the same address no matter how many processes race.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flotilla_state::StateError;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::record::{self, Entity, RecordMeta};
use crate::types::{display_or_empty, new_id, parse_ip};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "network", default)]
    pub network_id: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(rename = "start")]
    pub start_range: String,
    #[serde(rename = "end")]
    pub end_range: String,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    meta: RecordMeta,
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub network_id: String,
    pub cidr: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    /// First address handed out (inclusive).
    pub start_range: Ipv4Addr,
    /// Last address handed out (inclusive).
    pub end_range: Ipv4Addr,
}

impl Context {
    /// A new, unsaved subnet over `cidr`.
    ///
    /// The allocation range defaults to every host address in the CIDR.
    pub fn new_subnet(&self, cidr: Ipv4Net) -> Subnet {
        Subnet::blank(self, new_id(), cidr)
    }

    pub fn subnet(&self, id: &str) -> Result<Subnet> {
        let mut subnet = Subnet::blank(self, id.to_string(), Ipv4Net::from(Ipv4Addr::UNSPECIFIED));
        if !record::refresh(&mut subnet)? {
            return Err(Error::NotFound {
                kind: "subnet",
                id: id.to_string(),
            });
        }
        Ok(subnet)
    }
}

impl Subnet {
    fn blank(ctx: &Context, id: String, cidr: Ipv4Net) -> Self {
        let cidr = cidr.trunc();
        let mut hosts = cidr.hosts();
        let start_range = hosts.next().unwrap_or(cidr.network());
        let end_range = hosts.next_back().unwrap_or(start_range);
        Self {
            meta: RecordMeta::new(ctx.clone()),
            id,
            metadata: BTreeMap::new(),
            network_id: String::new(),
            cidr,
            gateway: None,
            start_range,
            end_range,
        }
    }

    pub fn version(&self) -> Option<flotilla_state::Version> {
        self.meta.version()
    }

    pub fn refresh(&mut self) -> Result<()> {
        record::refresh(self)?;
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        record::save(self, None)
    }

    fn ctx(&self) -> &Context {
        self.meta.ctx()
    }

    fn addresses_prefix(&self) -> String {
        format!("subnets/{}/addresses/", self.id)
    }

    fn address_key(&self, ip: Ipv4Addr) -> String {
        format!("subnets/{}/addresses/{ip}", self.id)
    }

    /// Reserved addresses and their owners.
    pub fn addresses(&self) -> Result<BTreeMap<Ipv4Addr, String>> {
        let prefix = self.addresses_prefix();
        let mut reserved = BTreeMap::new();
        for node in self.ctx().store().list(&prefix)? {
            let Some(ip) = node.relative_key(&prefix) else {
                continue;
            };
            let ip: Ipv4Addr = ip.parse().map_err(|_| Error::Decode {
                key: node.key.clone(),
                reason: "not an IPv4 address".into(),
            })?;
            reserved.insert(ip, node.value);
        }
        Ok(reserved)
    }

    /// Addresses in the allocation range that are neither reserved nor the
    /// gateway, in ascending order.
    pub fn available_addresses(&self) -> Result<Vec<Ipv4Addr>> {
        let reserved: BTreeSet<Ipv4Addr> = self.addresses()?.into_keys().collect();
        Ok(self.candidates().filter(|ip| !reserved.contains(ip)).collect())
    }

    /// Whether at least one address can still be reserved.
    pub fn has_available_address(&self) -> Result<bool> {
        let reserved: BTreeSet<Ipv4Addr> = self.addresses()?.into_keys().collect();
        Ok(self.candidates().any(|ip| !reserved.contains(&ip)))
    }

    fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.start_range)..=u32::from(self.end_range))
            .map(Ipv4Addr::from)
            .filter(move |ip| Some(*ip) != self.gateway)
    }

    /// Address held by `owner` in this subnet, if any.
    pub fn address_of(&self, owner: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self
            .addresses()?
            .into_iter()
            .find(|(_, holder)| holder == owner)
            .map(|(ip, _)| ip))
    }

    /// Reserve an address for `owner`, lowest free address first.
    ///
    /// If `owner` already holds an address in this subnet, that reservation
    /// is rewritten in place and returned instead of taking a second one.
    /// The rewrite gives it a fresh version, so a reconciliation sweep
    /// working from an older snapshot leaves it alone.
    pub fn reserve_address(&self, owner: &str) -> Result<Ipv4Addr> {
        let reserved = self.addresses()?;
        if let Some((ip, _)) = reserved.iter().find(|(_, holder)| holder.as_str() == owner) {
            if self.renew_reservation(*ip, owner)? {
                debug!(subnet = %self.id, %owner, %ip, "owner already holds an address");
                return Ok(*ip);
            }
        }

        for ip in self.candidates().filter(|ip| !reserved.contains_key(ip)) {
            match self.ctx().store().create(&self.address_key(ip), owner, None) {
                Ok(_) => {
                    info!(subnet = %self.id, %owner, %ip, "address reserved");
                    return Ok(ip);
                }
                // Lost the race for this address; try the next one.
                Err(StateError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::NoAvailableAddress(self.id.clone()))
    }

    /// Re-stamp `owner`'s reservation of `ip`. False if it was swept or
    /// changed hands since it was listed.
    fn renew_reservation(&self, ip: Ipv4Addr, owner: &str) -> Result<bool> {
        let key = self.address_key(ip);
        let store = self.ctx().store();
        let Some(node) = store.get(&key)? else {
            return Ok(false);
        };
        if node.value != owner {
            return Ok(false);
        }
        match store.compare_and_swap(&key, owner, None, node.version) {
            Ok(_) => Ok(true),
            Err(StateError::NotFound(_) | StateError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the reservation for `ip`. Returns false if it was not reserved.
    pub fn release_address(&self, ip: Ipv4Addr) -> Result<bool> {
        let released = self.ctx().store().delete(&self.address_key(ip))?;
        if released {
            info!(subnet = %self.id, %ip, "address released");
        }
        Ok(released)
    }

    /// Drop the reservation for `ip` only while `owner` still holds it.
    pub fn release_address_if_owner(&self, ip: Ipv4Addr, owner: &str) -> Result<bool> {
        let key = self.address_key(ip);
        let store = self.ctx().store();
        let Some(node) = store.get(&key)? else {
            return Ok(false);
        };
        if node.value != owner {
            return Ok(false);
        }
        match store.compare_and_delete(&key, node.version) {
            Ok(()) => {
                info!(subnet = %self.id, %owner, %ip, "address released");
                Ok(true)
            }
            Err(StateError::NotFound(_) | StateError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Entity for Subnet {
    const KIND: &'static str = "subnets";
    type Record = SubnetRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> SubnetRecord {
        SubnetRecord {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            network_id: self.network_id.clone(),
            cidr: self.cidr.to_string(),
            gateway: display_or_empty(self.gateway.as_ref()),
            start_range: self.start_range.to_string(),
            end_range: self.end_range.to_string(),
        }
    }

    fn apply_record(&mut self, record: SubnetRecord) -> Result<()> {
        let cidr: Ipv4Net = record
            .cidr
            .parse()
            .map_err(|_| Error::Invalid(format!("invalid subnet cidr: {:?}", record.cidr)))?;
        let start = parse_ip("range start", &record.start_range)?
            .ok_or_else(|| Error::Invalid(format!("subnet {} has no range start", self.id)))?;
        let end = parse_ip("range end", &record.end_range)?
            .ok_or_else(|| Error::Invalid(format!("subnet {} has no range end", self.id)))?;

        self.gateway = parse_ip("gateway", &record.gateway)?;
        self.cidr = cidr.trunc();
        self.start_range = start;
        self.end_range = end;
        self.metadata = record.metadata;
        self.network_id = record.network_id;
        Ok(())
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn validate(&self) -> Result<()> {
        if u32::from(self.start_range) > u32::from(self.end_range) {
            return Err(Error::Invalid(format!(
                "subnet {} range start {} is after end {}",
                self.id, self.start_range, self.end_range
            )));
        }
        for ip in [self.start_range, self.end_range] {
            if !self.cidr.contains(&ip) {
                return Err(Error::Invalid(format!(
                    "subnet {} range address {ip} is outside {}",
                    self.id, self.cidr
                )));
            }
        }
        if let Some(gateway) = self.gateway {
            if !self.cidr.contains(&gateway) {
                return Err(Error::Invalid(format!(
                    "subnet {} gateway {gateway} is outside {}",
                    self.id, self.cidr
                )));
            }
        }
        Ok(())
    }
}
