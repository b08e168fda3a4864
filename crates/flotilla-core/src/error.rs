//! Core error types.

use flotilla_state::StateError;
use thiserror::Error;

/// Errors from entity persistence and placement.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("no subnet on hypervisor {hypervisor} can take guest {guest}")]
    NoSuitableSubnet { guest: String, hypervisor: String },

    #[error("no available address in subnet {0}")]
    NoAvailableAddress(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl Error {
    /// True if a version-gated write lost to a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::State(e) if e.is_conflict())
    }

    /// True if a create-only write found an existing record.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::State(e) if e.is_already_exists())
    }

    /// True for a missing entity or a missing store key.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::State(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
