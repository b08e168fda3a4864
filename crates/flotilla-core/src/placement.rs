//! Placement engine — assign a guest to a hypervisor subnet.
//!
//! Placement touches three records (subnet address, hypervisor marker,
//! guest) without a cross-key transaction. The commit order is:
//!
//! 1. reserve an address (create-if-absent, owner = guest ID)
//! 2. write the hypervisor's guest marker
//! 3. save the guest with its placement (CAS)
//!
//! A failure in 2 or 3 rolls back what was written. A crash in between
//! leaves a reservation or marker with no matching guest placement; the
//! reconciliation sweep removes those once they are older than the
//! previous sweep.

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use flotilla_state::{StateError, Version};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::guest::{Guest, Placement};
use crate::hypervisor::Hypervisor;
use crate::network::Network;
use crate::record::{self, Entity};
use crate::subnet::Subnet;

impl Hypervisor {
    /// Place `guest` on this hypervisor.
    ///
    /// The first subnet, in the guest network's order, that this hypervisor
    /// has joined and that still has a free address wins. On any error the
    /// guest is left unplaced.
    pub fn add_guest(&mut self, guest: &mut Guest) -> Result<()> {
        if let Some(p) = guest.placement() {
            return Err(Error::Invalid(format!(
                "guest {} is already placed on hypervisor {}",
                guest.id, p.hypervisor_id
            )));
        }

        let network = self.ctx().network(&guest.network_id)?;
        let Some((subnet, bridge)) = self.select_subnet(&network, &guest.id)? else {
            warn!(hypervisor = %self.id, guest = %guest.id, network = %network.id, "no suitable subnet");
            return Err(Error::NoSuitableSubnet {
                guest: guest.id.clone(),
                hypervisor: self.id.clone(),
            });
        };

        let ip = subnet.reserve_address(&guest.id)?;
        guest.set_placement(Some(Placement {
            hypervisor_id: self.id.clone(),
            subnet_id: subnet.id.clone(),
            ip,
            bridge,
        }));

        if let Err(e) = self.commit_guest(guest) {
            warn!(hypervisor = %self.id, guest = %guest.id, error = %e, "placement failed, rolling back");
            self.roll_back(guest, &subnet, ip);
            guest.set_placement(None);
            return Err(e);
        }

        info!(
            hypervisor = %self.id,
            guest = %guest.id,
            subnet = %subnet.id,
            %ip,
            "guest placed"
        );
        Ok(())
    }

    fn select_subnet(&self, network: &Network, guest_id: &str) -> Result<Option<(Subnet, String)>> {
        for subnet_id in network.subnets()? {
            let Some(bridge) = self.subnets().get(&subnet_id) else {
                continue;
            };
            let subnet = match self.ctx().subnet(&subnet_id) {
                Ok(subnet) => subnet,
                Err(Error::NotFound { .. }) => {
                    warn!(network = %network.id, subnet = %subnet_id, "network lists missing subnet");
                    continue;
                }
                Err(e) => return Err(e),
            };
            // A retried placement may already hold an address here.
            if subnet.address_of(guest_id)?.is_some() || subnet.has_available_address()? {
                debug!(hypervisor = %self.id, subnet = %subnet_id, "subnet selected");
                return Ok(Some((subnet, bridge.clone())));
            }
        }
        Ok(None)
    }

    fn commit_guest(&mut self, guest: &mut Guest) -> Result<()> {
        self.add_guest_marker(&guest.id)?;
        guest.save()
    }

    /// Best-effort undo of a partial placement.
    fn roll_back(&mut self, guest: &Guest, subnet: &Subnet, ip: Ipv4Addr) {
        if let Err(e) = self.remove_guest(guest) {
            warn!(hypervisor = %self.id, guest = %guest.id, error = %e, "failed to remove guest marker");
        }
        if let Err(e) = subnet.release_address_if_owner(ip, &guest.id) {
            warn!(subnet = %subnet.id, %ip, error = %e, "failed to release address");
        }
    }
}

/// Release reservations in `subnet_id` whose owner is gone or placed
/// elsewhere. Only reservations written at or before `before` are touched.
///
/// Returns the number of addresses released.
pub fn reconcile_subnet(ctx: &Context, subnet_id: &str, before: Version) -> Result<usize> {
    let subnet = ctx.subnet(subnet_id)?;
    let prefix = format!("subnets/{subnet_id}/addresses/");
    let mut released = 0;

    for node in ctx.store().list(&prefix)? {
        if node.version > before {
            continue;
        }
        let Some(ip) = node.relative_key(&prefix).and_then(|ip| ip.parse::<Ipv4Addr>().ok())
        else {
            continue;
        };
        let orphaned = match ctx.guest(&node.value) {
            Ok(guest) => !guest.holds_address(&subnet, ip),
            Err(Error::NotFound { .. }) => true,
            Err(e) => return Err(e),
        };
        if orphaned && delete_if_unchanged(ctx, &node.key, node.version)? {
            info!(subnet = %subnet_id, %ip, owner = %node.value, "orphaned address released");
            released += 1;
        }
    }
    Ok(released)
}

/// Remove guest markers on `hypervisor_id` for guests that are gone or
/// placed elsewhere. Only markers written at or before `before` are touched.
///
/// Returns the number of markers removed.
pub fn reconcile_hypervisor(ctx: &Context, hypervisor_id: &str, before: Version) -> Result<usize> {
    let prefix = format!("hypervisors/{hypervisor_id}/guests/");
    let mut removed = 0;

    for node in ctx.store().list(&prefix)? {
        if node.version > before {
            continue;
        }
        let Some(guest_id) = node.relative_key(&prefix) else {
            continue;
        };
        let orphaned = match ctx.guest(guest_id) {
            Ok(guest) => guest
                .placement()
                .is_none_or(|p| p.hypervisor_id != hypervisor_id),
            Err(Error::NotFound { .. }) => true,
            Err(e) => return Err(e),
        };
        if orphaned && delete_if_unchanged(ctx, &node.key, node.version)? {
            info!(hypervisor = %hypervisor_id, guest = %guest_id, "orphaned guest marker removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Sweep every subnet and hypervisor. Returns the number of keys removed.
pub fn reconcile_all(ctx: &Context, before: Version) -> Result<usize> {
    let mut cleaned = 0;
    for subnet_id in record::list_ids(ctx, Subnet::KIND)? {
        match reconcile_subnet(ctx, &subnet_id, before) {
            Ok(n) => cleaned += n,
            Err(Error::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    for hypervisor_id in record::list_ids(ctx, Hypervisor::KIND)? {
        cleaned += reconcile_hypervisor(ctx, &hypervisor_id, before)?;
    }
    Ok(cleaned)
}

fn delete_if_unchanged(ctx: &Context, key: &str, version: Version) -> Result<bool> {
    match ctx.store().compare_and_delete(key, version) {
        Ok(()) => Ok(true),
        Err(StateError::NotFound(_) | StateError::Conflict { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
