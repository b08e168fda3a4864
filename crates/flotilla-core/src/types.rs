//! Value types shared across entity records.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = Error;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Invalid(format!("invalid MAC address: {s:?}"));
        let separator = if s.contains('-') { '-' } else { ':' };

        let mut bytes = [0u8; 6];
        let mut parts = s.split(separator);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Memory / disk / CPU footprint or capacity.
///
/// Memory and disk are in MiB; cpu is a core count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub cpu: u32,
}

impl Resources {
    pub fn new(memory: u64, disk: u64, cpu: u32) -> Self {
        Self { memory, disk, cpu }
    }

    /// Whether every dimension of `self` is at least `need`.
    pub fn covers(&self, need: &Resources) -> bool {
        self.memory >= need.memory && self.disk >= need.disk && self.cpu >= need.cpu
    }

    /// `self - other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            memory: self.memory.checked_sub(other.memory)?,
            disk: self.disk.checked_sub(other.disk)?,
            cpu: self.cpu.checked_sub(other.cpu)?,
        })
    }

    /// `self - other`, clamping each dimension at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            cpu: self.cpu.saturating_sub(other.cpu),
        }
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            memory: self.memory.saturating_add(rhs.memory),
            disk: self.disk.saturating_add(rhs.disk),
            cpu: self.cpu.saturating_add(rhs.cpu),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

/// Fresh entity ID (UUID v4).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parse an optional address field; the empty string means unset.
pub(crate) fn parse_ip(field: &str, value: &str) -> Result<Option<Ipv4Addr>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| Error::Invalid(format!("invalid {field} address: {value:?}")))
}

pub(crate) fn parse_mac(value: &str) -> Result<Option<MacAddr>> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some)
}

pub(crate) fn display_or_empty<T: fmt::Display>(value: Option<&T>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}
