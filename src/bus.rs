//! Backplane bus transport contract.
//!
//! A [`BusTransport`] performs one synchronous transaction per call and
//! reports the number of bytes moved, or a negative errno-style code. It never
//! retries; retry and skip policy belongs to the caller. Timeouts are enforced
//! by the transport itself.

use crate::BusError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;

/// A16 non-privileged access.
pub const AM_A16: u8 = 0x29;
/// A24 non-privileged data access (standard single cycle).
pub const AM_A24: u8 = 0x39;
/// A32 non-privileged data access.
pub const AM_A32: u8 = 0x09;

/// Transfer width of a single transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Long = 4,
}

impl Width {
    pub fn bytes(self) -> i32 {
        self as i32
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Long => 0xffff_ffff,
        }
    }
}

/// Decoded negative return code of a failed transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BusStatus {
    BusError,
    Timeout,
    NoDevice,
    BadAddress,
    Busy,
    Other(i32),
}

impl From<i32> for BusStatus {
    fn from(code: i32) -> Self {
        match code.saturating_neg() {
            libc::EIO => Self::BusError,
            libc::ETIMEDOUT => Self::Timeout,
            libc::ENODEV | libc::ENXIO => Self::NoDevice,
            libc::EFAULT => Self::BadAddress,
            libc::EBUSY => Self::Busy,
            _ => Self::Other(code),
        }
    }
}

impl BusStatus {
    /// The raw (negative) transport code.
    pub fn code(self) -> i32 {
        match self {
            Self::BusError => -libc::EIO,
            Self::Timeout => -libc::ETIMEDOUT,
            Self::NoDevice => -libc::ENODEV,
            Self::BadAddress => -libc::EFAULT,
            Self::Busy => -libc::EBUSY,
            Self::Other(code) => code,
        }
    }

    /// The module did not answer at all; polling it again is pointless until
    /// it is reinitialised.
    pub fn is_unreachable(self) -> bool {
        self == Self::NoDevice
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errno = self.code().saturating_neg();
        write!(f, "{}", io::Error::from_raw_os_error(errno))
    }
}

/// Synchronous bus access at an address and address modifier.
///
/// Both calls return exactly `width.bytes()` on success and a negative code on
/// failure. Implementations must have no other side effects so that a
/// deterministic double can stand in for the hardware.
pub trait BusTransport: Send {
    fn read(&mut self, address: u32, address_modifier: u8, width: Width) -> (i32, u32);

    fn write(&mut self, address: u32, address_modifier: u8, width: Width, value: u32) -> i32;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn read(&mut self, address: u32, address_modifier: u8, width: Width) -> (i32, u32) {
        (**self).read(address, address_modifier, width)
    }

    fn write(&mut self, address: u32, address_modifier: u8, width: Width, value: u32) -> i32 {
        (**self).write(address, address_modifier, width, value)
    }
}

fn classify(address: u32, address_modifier: u8, width: Width, result: i32) -> Result<(), BusError> {
    if result == width.bytes() {
        Ok(())
    } else if result < 0 {
        Err(BusError::Fault {
            address,
            address_modifier,
            status: BusStatus::from(result),
        })
    } else {
        Err(BusError::ShortTransfer {
            address,
            requested: width.bytes(),
            transferred: result,
        })
    }
}

/// Read one value, turning short transfers and negative codes into a [`BusError`].
pub fn read_checked(
    bus: &mut dyn BusTransport,
    address: u32,
    address_modifier: u8,
    width: Width,
) -> Result<u32, BusError> {
    let (result, value) = bus.read(address, address_modifier, width);
    classify(address, address_modifier, width, result)?;
    Ok(value & width.mask())
}

/// Write one value, turning short transfers and negative codes into a [`BusError`].
pub fn write_checked(
    bus: &mut dyn BusTransport,
    address: u32,
    address_modifier: u8,
    width: Width,
    value: u32,
) -> Result<(), BusError> {
    let result = bus.write(address, address_modifier, width, value & width.mask());
    classify(address, address_modifier, width, result)
}

/// One recorded transaction of a [`ScriptedBus`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transaction {
    Read {
        address: u32,
        address_modifier: u8,
        width: Width,
    },
    Write {
        address: u32,
        address_modifier: u8,
        width: Width,
        value: u32,
    },
}

/// A queued response for the next read at an address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scripted {
    Value(u32),
    Fail(i32),
    Short(i32),
}

/// Deterministic transport double.
///
/// Reads first consume the response queue of the address, then fall back to
/// a persistent failure if one is injected, then to the register file.
/// Writes land in the register file unless the address is failing.
#[derive(Debug, Default)]
pub struct ScriptedBus {
    registers: HashMap<u32, u32>,
    queues: HashMap<u32, VecDeque<Scripted>>,
    failures: HashMap<u32, i32>,
    log: Vec<Transaction>,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_register(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);
    }

    pub fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn queue_value(&mut self, address: u32, value: u32) {
        self.queue(address, Scripted::Value(value));
    }

    pub fn queue_values(&mut self, address: u32, values: impl IntoIterator<Item = u32>) {
        for v in values {
            self.queue_value(address, v);
        }
    }

    pub fn queue(&mut self, address: u32, response: Scripted) {
        self.queues.entry(address).or_default().push_back(response);
    }

    /// Fail every transaction at `address` with `code` until cleared.
    pub fn fail_always(&mut self, address: u32, code: i32) {
        self.failures.insert(address, code);
    }

    pub fn clear_failure(&mut self, address: u32) {
        self.failures.remove(&address);
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn reads_at(&self, address: u32) -> usize {
        self.log
            .iter()
            .filter(|t| matches!(t, Transaction::Read { address: a, .. } if *a == address))
            .count()
    }

    pub fn writes_to(&self, address: u32) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|t| match t {
                Transaction::Write {
                    address: a, value, ..
                } if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }
}

impl BusTransport for ScriptedBus {
    fn read(&mut self, address: u32, address_modifier: u8, width: Width) -> (i32, u32) {
        self.log.push(Transaction::Read {
            address,
            address_modifier,
            width,
        });
        if let Some(response) = self.queues.get_mut(&address).and_then(|q| q.pop_front()) {
            return match response {
                Scripted::Value(v) => (width.bytes(), v & width.mask()),
                Scripted::Fail(code) => (code, 0),
                Scripted::Short(n) => (n, 0),
            };
        }
        if let Some(&code) = self.failures.get(&address) {
            return (code, 0);
        }
        (width.bytes(), self.register(address) & width.mask())
    }

    fn write(&mut self, address: u32, address_modifier: u8, width: Width, value: u32) -> i32 {
        self.log.push(Transaction::Write {
            address,
            address_modifier,
            width,
            value,
        });
        if let Some(&code) = self.failures.get(&address) {
            return code;
        }
        self.registers.insert(address, value & width.mask());
        width.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_code() {
        assert_eq!(BusStatus::from(-libc::EIO), BusStatus::BusError);
        assert_eq!(BusStatus::from(-libc::ENXIO), BusStatus::NoDevice);
        assert_eq!(BusStatus::from(-9999), BusStatus::Other(-9999));
        assert!(BusStatus::from(-libc::ENODEV).is_unreachable());
        assert!(!BusStatus::Timeout.is_unreachable());
        assert_eq!(BusStatus::from(BusStatus::Timeout.code()), BusStatus::Timeout);
    }

    #[test]
    fn checked_read_classifies_failures() {
        let mut bus = ScriptedBus::new();
        bus.set_register(0x100, 0x1234_5678);
        bus.queue(0x100, Scripted::Fail(-libc::EIO));
        bus.queue(0x100, Scripted::Short(1));

        let err = read_checked(&mut bus, 0x100, AM_A24, Width::Word).unwrap_err();
        assert!(matches!(
            err,
            BusError::Fault {
                status: BusStatus::BusError,
                ..
            }
        ));
        let err = read_checked(&mut bus, 0x100, AM_A24, Width::Word).unwrap_err();
        assert_eq!(
            err,
            BusError::ShortTransfer {
                address: 0x100,
                requested: 2,
                transferred: 1
            }
        );
        assert_eq!(read_checked(&mut bus, 0x100, AM_A24, Width::Word).unwrap(), 0x5678);
        assert_eq!(bus.reads_at(0x100), 3);
    }

    #[test]
    fn persistent_failure_and_writes() {
        let mut bus = ScriptedBus::new();
        write_checked(&mut bus, 0x20, AM_A16, Width::Long, 7).unwrap();
        assert_eq!(bus.register(0x20), 7);

        bus.fail_always(0x20, -libc::ENODEV);
        let err = write_checked(&mut bus, 0x20, AM_A16, Width::Long, 9).unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(bus.register(0x20), 7);

        bus.clear_failure(0x20);
        write_checked(&mut bus, 0x20, AM_A16, Width::Long, 9).unwrap();
        assert_eq!(bus.writes_to(0x20), vec![7, 9, 9]);
    }

    #[test]
    fn status_text_comes_from_the_os() {
        let text = BusStatus::Timeout.to_string();
        assert!(!text.is_empty());
        assert_ne!(text, BusStatus::BusError.to_string());
    }
}
