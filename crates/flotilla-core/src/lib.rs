//! flotilla-core — fleet entities and the placement engine.
//!
//! Every entity (Guest, Hypervisor, Network, Subnet, Flavor) is a JSON
//! record at `<kind>/<id>/metadata` in the coordination store, tagged with
//! the store version it was last read or written at. Writes are
//! compare-and-swap on that version, so concurrent writers get a
//! `Conflict` instead of silently clobbering each other.
//!
//! # Components
//!
//! - **`record`** — the refresh / validate / save protocol (`Entity` trait)
//! - **`context`** — the store handle every entity is constructed with
//! - **`guest`**, **`hypervisor`**, **`network`**, **`subnet`**, **`flavor`** — entity kinds
//! - **`placement`** — `Hypervisor::add_guest` and the reconciliation sweep

pub mod context;
pub mod error;
pub mod flavor;
pub mod guest;
pub mod hypervisor;
pub mod network;
pub mod placement;
pub mod record;
pub mod subnet;
pub mod types;

pub use context::Context;
pub use error::{Error, Result};
pub use flavor::{Flavor, FlavorRecord};
pub use guest::{Guest, GuestRecord, Placement};
pub use hypervisor::{Hypervisor, HypervisorRecord};
pub use network::{Network, NetworkRecord};
pub use placement::{reconcile_all, reconcile_hypervisor, reconcile_subnet};
pub use record::{Entity, RecordMeta};
pub use subnet::{Subnet, SubnetRecord};
pub use types::{MacAddr, Resources};
