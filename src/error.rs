//! Error taxonomy for bus access, readout framing and configuration.
//!
//! Per-channel [`BusError`]s and framing faults are contained inside the
//! readout engine and only logged; [`DaqError`] is what crosses module
//! boundaries.

use crate::{BusStatus, WordTag};
use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// A single failed bus transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus fault at {address:#010x} (am {address_modifier:#04x}): {status}")]
    Fault {
        address: u32,
        address_modifier: u8,
        status: BusStatus,
    },
    #[error("short transfer at {address:#010x}: {transferred} of {requested} bytes")]
    ShortTransfer {
        address: u32,
        requested: i32,
        transferred: i32,
    },
}

impl BusError {
    /// True when the transport reports the module cannot be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            BusError::Fault { status, .. } => status.is_unreachable(),
            BusError::ShortTransfer { .. } => false,
        }
    }

    pub fn address(&self) -> u32 {
        match self {
            BusError::Fault { address, .. } | BusError::ShortTransfer { address, .. } => *address,
        }
    }
}

/// Failures of a single catalogue or register-map accessor call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown key '{0}'")]
    UnknownKey(String),
    #[error("index {index} out of range (catalog holds {len} entries)")]
    InvalidIndex { index: usize, len: usize },
    #[error("'{key}' holds a {expected} value, got {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("{device}: expected {expected:?} word at {address:#010x}, read {found:#010x}")]
    Framing {
        device: String,
        address: u32,
        expected: WordTag,
        found: u32,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("data id {data_id:#010x} assigned to both {first} and {second}")]
    IdentifierCollision {
        data_id: u32,
        first: String,
        second: String,
    },

    #[error("{first} and {second} both claim crate {crate_num} slot {slot}")]
    DuplicateLocation {
        crate_num: u32,
        slot: u32,
        first: String,
        second: String,
    },

    #[error("{0} has no negotiated data id")]
    MissingDataId(String),

    #[error("device {device} is offline")]
    DeviceOffline { device: String },

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("event buffer overrun: {reserved} words reserved")]
    BufferOverrun { reserved: usize },

    #[error("register {register} read back {read:#x}, wrote {wrote:#x}")]
    VerifyMismatch {
        register: &'static str,
        wrote: u32,
        read: u32,
    },

    #[error("programmable logic load failed: {0}")]
    ProgrammingFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode settings: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

impl DaqError {
    /// True for errors after which the device should stop being polled.
    pub fn is_offline(&self) -> bool {
        match self {
            DaqError::DeviceOffline { .. } => true,
            DaqError::Bus(e) => e.is_unreachable(),
            _ => false,
        }
    }
}
