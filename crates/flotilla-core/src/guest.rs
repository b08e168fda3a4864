//! Guest — a virtual machine and its placement.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::record::{self, Entity, RecordMeta};
use crate::subnet::Subnet;
use crate::types::{MacAddr, display_or_empty, new_id, parse_ip, parse_mac};

/// Where a guest runs: hypervisor, subnet, address and bridge, all or nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub hypervisor_id: String,
    pub subnet_id: String,
    pub ip: Ipv4Addr,
    pub bridge: String,
}

/// Stored form of a guest. Unplaced guests carry empty placement fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "flavor", default)]
    pub flavor_id: String,
    #[serde(rename = "hypervisor", default)]
    pub hypervisor_id: String,
    #[serde(rename = "network", default)]
    pub network_id: String,
    #[serde(rename = "subnet", default)]
    pub subnet_id: String,
    #[serde(rename = "fwgroup", default)]
    pub fwgroup_id: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub bridge: String,
}

/// A virtual machine.
#[derive(Debug, Clone)]
pub struct Guest {
    meta: RecordMeta,
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    /// Guest type, e.g. `kvm`.
    pub kind: String,
    pub flavor_id: String,
    pub network_id: String,
    pub fwgroup_id: String,
    pub mac: Option<MacAddr>,
    placement: Option<Placement>,
}

impl Context {
    /// A new, unsaved guest with a fresh ID.
    pub fn new_guest(&self) -> Guest {
        Guest::blank(self, new_id())
    }

    /// Load a guest by ID.
    pub fn guest(&self, id: &str) -> Result<Guest> {
        let mut guest = Guest::blank(self, id.to_string());
        if !record::refresh(&mut guest)? {
            return Err(Error::NotFound {
                kind: "guest",
                id: id.to_string(),
            });
        }
        Ok(guest)
    }

    /// Run `f` on every guest in ID order, stopping at the first error.
    pub fn for_each_guest<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Guest) -> Result<()>,
    {
        for id in record::list_ids(self, Guest::KIND)? {
            match self.guest(&id) {
                Ok(guest) => f(guest)?,
                // Deleted between the listing and the read.
                Err(Error::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Guest {
    fn blank(ctx: &Context, id: String) -> Self {
        Self {
            meta: RecordMeta::new(ctx.clone()),
            id,
            metadata: BTreeMap::new(),
            kind: String::new(),
            flavor_id: String::new(),
            network_id: String::new(),
            fwgroup_id: String::new(),
            mac: None,
            placement: None,
        }
    }

    pub fn ctx(&self) -> &Context {
        self.meta.ctx()
    }

    pub fn version(&self) -> Option<flotilla_state::Version> {
        self.meta.version()
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    pub fn is_placed(&self) -> bool {
        self.placement.is_some()
    }

    pub(crate) fn set_placement(&mut self, placement: Option<Placement>) {
        self.placement = placement;
    }

    /// Reload from the store. A missing record leaves the guest unchanged.
    pub fn refresh(&mut self) -> Result<()> {
        record::refresh(self)?;
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        record::save(self, None)
    }

    /// Delete the record, then free the guest's address and drop its
    /// hypervisor marker.
    ///
    /// The record goes first and is version-gated: if it changed since it was
    /// loaded the destroy fails with `Conflict` and the placement stays
    /// intact. A crash after the delete leaves an address and marker whose
    /// owner is gone, which the reconciliation sweep removes. The address is
    /// only released while it still belongs to this guest.
    pub fn destroy(&mut self) -> Result<()> {
        let placement = self.placement.clone();
        record::remove(self)?;
        self.placement = None;

        if let Some(placement) = placement {
            let ctx = self.ctx().clone();
            match ctx.subnet(&placement.subnet_id) {
                Ok(subnet) => {
                    subnet.release_address_if_owner(placement.ip, &self.id)?;
                }
                Err(Error::NotFound { .. }) => {
                    warn!(guest = %self.id, subnet = %placement.subnet_id, "guest subnet gone");
                }
                Err(e) => return Err(e),
            }
            let marker = Hypervisor::guest_key(&placement.hypervisor_id, &self.id);
            ctx.store().delete(&marker)?;
        }

        info!(guest = %self.id, "guest destroyed");
        Ok(())
    }

    /// Whether the guest's placement points at `subnet` and `ip`.
    pub(crate) fn holds_address(&self, subnet: &Subnet, ip: Ipv4Addr) -> bool {
        self.placement
            .as_ref()
            .is_some_and(|p| p.subnet_id == subnet.id && p.ip == ip)
    }
}

impl Entity for Guest {
    const KIND: &'static str = "guests";
    type Record = GuestRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> GuestRecord {
        let placement = self.placement.as_ref();
        GuestRecord {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            kind: self.kind.clone(),
            flavor_id: self.flavor_id.clone(),
            hypervisor_id: placement.map(|p| p.hypervisor_id.clone()).unwrap_or_default(),
            network_id: self.network_id.clone(),
            subnet_id: placement.map(|p| p.subnet_id.clone()).unwrap_or_default(),
            fwgroup_id: self.fwgroup_id.clone(),
            mac: display_or_empty(self.mac.as_ref()),
            ip: display_or_empty(placement.map(|p| &p.ip)),
            bridge: placement.map(|p| p.bridge.clone()).unwrap_or_default(),
        }
    }

    fn apply_record(&mut self, record: GuestRecord) -> Result<()> {
        let ip = parse_ip("guest", &record.ip)?;
        let placement = match (
            record.hypervisor_id.is_empty(),
            record.subnet_id.is_empty(),
            ip,
            record.bridge.is_empty(),
        ) {
            (true, true, None, true) => None,
            (false, false, Some(ip), false) => Some(Placement {
                hypervisor_id: record.hypervisor_id,
                subnet_id: record.subnet_id,
                ip,
                bridge: record.bridge,
            }),
            _ => {
                return Err(Error::Invalid(format!(
                    "guest {} has a partial placement",
                    self.id
                )));
            }
        };

        self.mac = parse_mac(&record.mac)?;
        self.metadata = record.metadata;
        self.kind = record.kind;
        self.flavor_id = record.flavor_id;
        self.network_id = record.network_id;
        self.fwgroup_id = record.fwgroup_id;
        self.placement = placement;
        debug!(guest = %self.id, placed = self.placement.is_some(), "guest loaded");
        Ok(())
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Invalid("guest id is empty".into()));
        }
        if let Some(p) = &self.placement {
            if p.hypervisor_id.is_empty() || p.subnet_id.is_empty() || p.bridge.is_empty() {
                return Err(Error::Invalid(format!(
                    "guest {} has a partial placement",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
