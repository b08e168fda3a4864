//! Hypervisor agent — keeps this host's record, resources and heartbeat fresh.
//!
//! On every tick the agent:
//! 1. Reloads the hypervisor record and its guest markers
//! 2. Recomputes available resources from the configured total
//! 3. Writes the heartbeat with its TTL

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use flotilla_core::{Context, Error, Hypervisor, Result};

use crate::config::HypervisorSection;

/// Attempts at a resource update before the tick gives up on conflicts.
const UPDATE_RETRIES: usize = 3;

/// Load this hypervisor, creating its record on first start.
pub fn register(ctx: &Context, section: &HypervisorSection) -> Result<Hypervisor> {
    match ctx.hypervisor(&section.id) {
        Ok(hv) => return Ok(hv),
        Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    let mut hv = ctx.new_hypervisor();
    hv.id = section.id.clone();
    hv.total_resources = section.resources;
    hv.available_resources = section.resources;
    match hv.save() {
        Ok(()) => {
            info!(hypervisor = %hv.id, "hypervisor registered");
            Ok(hv)
        }
        // Registered concurrently by another process.
        Err(e) if e.is_already_exists() => ctx.hypervisor(&section.id),
        Err(e) => Err(e),
    }
}

/// One heartbeat tick.
pub fn beat(hv: &mut Hypervisor, section: &HypervisorSection) -> Result<()> {
    hv.refresh()?;
    let mut attempt = 0;
    loop {
        match hv.update_resources(section.resources) {
            Ok(()) => break,
            Err(e) if e.is_conflict() && attempt + 1 < UPDATE_RETRIES => {
                attempt += 1;
                debug!(hypervisor = %hv.id, attempt, "hypervisor record changed, refreshing");
                hv.refresh()?;
            }
            Err(e) => return Err(e),
        }
    }
    hv.heartbeat(Duration::from_secs(section.heartbeat_ttl_secs))
}

/// Heartbeat every interval until shutdown.
pub async fn run_heartbeat(ctx: Context, section: HypervisorSection, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(section.heartbeat_interval_secs);
    info!(hypervisor = %section.id, ?interval, "heartbeat loop starting");

    let mut hv = None;
    loop {
        if hv.is_none() {
            match register(&ctx, &section) {
                Ok(registered) => hv = Some(registered),
                Err(e) => error!(hypervisor = %section.id, error = %e, "registration failed"),
            }
        }
        if let Some(hv) = hv.as_mut() {
            if let Err(e) = beat(hv, &section) {
                error!(hypervisor = %section.id, error = %e, "heartbeat failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(hypervisor = %section.id, "heartbeat loop stopped");
}
