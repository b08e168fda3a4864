//! Hypervisor — a physical host, its joined subnets and assigned guests.
//!
//! Besides the record at `hypervisors/<id>/metadata`, a hypervisor owns:
//! - `hypervisors/<id>/heartbeat` — TTL'd liveness key
//! - `hypervisors/<id>/subnets/<subnet>` — joined subnet, value is the bridge
//! - `hypervisors/<id>/guests/<guest>` — membership marker for a placed guest

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::record::{self, Entity, RecordMeta, entity_prefix};
use crate::subnet::Subnet;
use crate::types::{MacAddr, Resources, display_or_empty, epoch_secs, new_id, parse_ip, parse_mac};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HypervisorRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub total_resources: Resources,
    #[serde(default)]
    pub available_resources: Resources,
}

#[derive(Debug, Clone)]
pub struct Hypervisor {
    meta: RecordMeta,
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub mac: Option<MacAddr>,
    pub total_resources: Resources,
    pub available_resources: Resources,
    /// Subnet ID → bridge, as of the last refresh.
    subnets: BTreeMap<String, String>,
    /// Assigned guest IDs, as of the last refresh.
    guests: BTreeSet<String>,
    /// Heartbeat present at the last refresh.
    alive: bool,
}

impl Context {
    pub fn new_hypervisor(&self) -> Hypervisor {
        Hypervisor::blank(self, new_id())
    }

    /// Load a hypervisor with its subnets, guests and liveness.
    pub fn hypervisor(&self, id: &str) -> Result<Hypervisor> {
        let mut hv = Hypervisor::blank(self, id.to_string());
        hv.refresh()?;
        if hv.meta.version().is_none() {
            return Err(Error::NotFound {
                kind: "hypervisor",
                id: id.to_string(),
            });
        }
        Ok(hv)
    }

    /// Run `f` on every hypervisor in ID order, stopping at the first error.
    pub fn for_each_hypervisor<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Hypervisor) -> Result<()>,
    {
        for id in record::list_ids(self, Hypervisor::KIND)? {
            match self.hypervisor(&id) {
                Ok(hv) => f(hv)?,
                Err(Error::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Hypervisor {
    fn blank(ctx: &Context, id: String) -> Self {
        Self {
            meta: RecordMeta::new(ctx.clone()),
            id,
            metadata: BTreeMap::new(),
            ip: None,
            netmask: None,
            gateway: None,
            mac: None,
            total_resources: Resources::default(),
            available_resources: Resources::default(),
            subnets: BTreeMap::new(),
            guests: BTreeSet::new(),
            alive: false,
        }
    }

    pub fn ctx(&self) -> &Context {
        self.meta.ctx()
    }

    pub fn version(&self) -> Option<flotilla_state::Version> {
        self.meta.version()
    }

    /// `hypervisors/<hypervisor>/guests/<guest>`
    pub fn guest_key(hypervisor_id: &str, guest_id: &str) -> String {
        format!("hypervisors/{hypervisor_id}/guests/{guest_id}")
    }

    fn subnet_key(&self, subnet_id: &str) -> String {
        format!("hypervisors/{}/subnets/{subnet_id}", self.id)
    }

    fn heartbeat_key(&self) -> String {
        format!("hypervisors/{}/heartbeat", self.id)
    }

    /// Reload the record and every derived view in one listing.
    ///
    /// A missing record leaves the record fields unchanged; the subnet,
    /// guest and liveness views always reflect the store.
    pub fn refresh(&mut self) -> Result<()> {
        let prefix = entity_prefix(Self::KIND, &self.id);
        let nodes = self.ctx().store().list(&prefix)?;

        self.subnets.clear();
        self.guests.clear();
        self.alive = false;

        for node in &nodes {
            let Some(rel) = node.relative_key(&prefix) else {
                continue;
            };
            match rel.split_once('/') {
                None if rel == "metadata" => record::apply_node(self, node)?,
                None if rel == "heartbeat" => self.alive = true,
                Some(("subnets", subnet)) => {
                    self.subnets.insert(subnet.to_string(), node.value.clone());
                }
                Some(("guests", guest)) => {
                    self.guests.insert(guest.to_string());
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        record::save(self, None)
    }

    /// Joined subnets: subnet ID → bridge.
    pub fn subnets(&self) -> &BTreeMap<String, String> {
        &self.subnets
    }

    /// IDs of guests assigned to this hypervisor.
    pub fn guests(&self) -> &BTreeSet<String> {
        &self.guests
    }

    /// Whether a heartbeat was present at the last refresh.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Join `subnet`, reachable through `bridge`.
    pub fn add_subnet(&mut self, subnet: &Subnet, bridge: &str) -> Result<()> {
        if bridge.is_empty() {
            return Err(Error::Invalid(format!(
                "hypervisor {} subnet {} needs a bridge",
                self.id, subnet.id
            )));
        }
        self.ctx()
            .store()
            .set(&self.subnet_key(&subnet.id), bridge, None)?;
        self.subnets.insert(subnet.id.clone(), bridge.to_string());
        info!(hypervisor = %self.id, subnet = %subnet.id, %bridge, "subnet joined");
        Ok(())
    }

    /// Leave a subnet. Returns false if it was not joined.
    pub fn remove_subnet(&mut self, subnet_id: &str) -> Result<bool> {
        let removed = self.ctx().store().delete(&self.subnet_key(subnet_id))?;
        self.subnets.remove(subnet_id);
        Ok(removed)
    }

    /// Announce liveness for `ttl`.
    pub fn heartbeat(&mut self, ttl: Duration) -> Result<()> {
        let stamp = epoch_secs().to_string();
        self.ctx()
            .store()
            .set(&self.heartbeat_key(), &stamp, Some(ttl))?;
        self.alive = true;
        debug!(hypervisor = %self.id, ?ttl, "heartbeat");
        Ok(())
    }

    /// Drop `guest`'s membership marker. Returns false if there was none.
    ///
    /// The guest's own placement and address are left to the caller.
    pub fn remove_guest(&mut self, guest: &Guest) -> Result<bool> {
        let removed = self
            .ctx()
            .store()
            .delete(&Self::guest_key(&self.id, &guest.id))?;
        self.guests.remove(&guest.id);
        if removed {
            info!(hypervisor = %self.id, guest = %guest.id, "guest removed from hypervisor");
        }
        Ok(removed)
    }

    /// Sum of the flavors of every assigned guest.
    pub fn guests_usage(&self) -> Result<Resources> {
        let ctx = self.ctx();
        let mut usage = Resources::default();
        for guest_id in &self.guests {
            let guest = match ctx.guest(guest_id) {
                Ok(guest) => guest,
                // Marker left behind by a crashed placement or destroy.
                Err(Error::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            usage += ctx.flavor(&guest.flavor_id)?.resources;
        }
        Ok(usage)
    }

    /// Set total capacity and recompute what is left after assigned guests.
    pub fn update_resources(&mut self, total: Resources) -> Result<()> {
        let usage = self.guests_usage()?;
        self.total_resources = total;
        self.available_resources = total.saturating_sub(&usage);
        self.save()?;
        debug!(
            hypervisor = %self.id,
            total = ?self.total_resources,
            available = ?self.available_resources,
            "resources updated"
        );
        Ok(())
    }

    /// Record that this hypervisor now hosts `guest_id`.
    pub(crate) fn add_guest_marker(&mut self, guest_id: &str) -> Result<()> {
        self.ctx()
            .store()
            .set(&Self::guest_key(&self.id, guest_id), guest_id, None)?;
        self.guests.insert(guest_id.to_string());
        Ok(())
    }
}

impl Entity for Hypervisor {
    const KIND: &'static str = "hypervisors";
    type Record = HypervisorRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> HypervisorRecord {
        HypervisorRecord {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            ip: display_or_empty(self.ip.as_ref()),
            netmask: display_or_empty(self.netmask.as_ref()),
            gateway: display_or_empty(self.gateway.as_ref()),
            mac: display_or_empty(self.mac.as_ref()),
            total_resources: self.total_resources,
            available_resources: self.available_resources,
        }
    }

    fn apply_record(&mut self, record: HypervisorRecord) -> Result<()> {
        self.ip = parse_ip("ip", &record.ip)?;
        self.netmask = parse_ip("netmask", &record.netmask)?;
        self.gateway = parse_ip("gateway", &record.gateway)?;
        self.mac = parse_mac(&record.mac)?;
        self.metadata = record.metadata;
        self.total_resources = record.total_resources;
        self.available_resources = record.available_resources;
        Ok(())
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
}
