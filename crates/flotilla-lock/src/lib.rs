//! flotilla-lock — TTL-bounded mutual exclusion over the versioned store.
//!
//! A lock is a single key created with a lease. Holding it means having
//! observed the version the successful create produced; every refresh and
//! release is a compare-and-swap (or compare-and-delete) gated on that
//! version, so a handle whose lease expired and was taken over by someone
//! else can never touch the new holder's key.
//!
//! ```text
//! acquire ──create-if-absent──▶ held(version)
//!    │                             │ refresh: CAS(version) → held(version')
//!    │ exists, wait                │ release: CAD(version) → not held
//!    ▼                             │ expired:  KeyNotFound → not held
//! wait for delete / lease expiry   ▼
//!    └──▶ one more create ──▶ held | AlreadyHeld
//! ```

pub mod error;
pub mod lock;

pub use error::{LockError, LockResult};
pub use lock::{Lock, acquire};
