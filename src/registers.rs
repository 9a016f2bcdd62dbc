use crate::{read_checked, BusTransport, ConfigError, DacScale, Width};
use log::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        self != Access::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != Access::ReadOnly
    }
}

/// How an engineering value maps onto the raw register contents.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Conversion {
    Raw,
    Dac(DacScale),
    /// `raw = round(value / step) & mask`.
    Scaled { step: f64, mask: u32 },
    /// The hardware counts down: `raw = !round(value / step) & mask`.
    Complement { step: f64, mask: u32 },
}

impl Conversion {
    pub fn encode(&self, value: f64) -> u32 {
        match *self {
            Conversion::Raw => value.round() as u32,
            Conversion::Dac(scale) => scale.millivolts_to_raw(value),
            Conversion::Scaled { step, mask } => ((value / step).round() as u32) & mask,
            Conversion::Complement { step, mask } => !((value / step).round() as u32) & mask,
        }
    }

    pub fn decode(&self, raw: u32) -> f64 {
        match *self {
            Conversion::Raw => raw as f64,
            Conversion::Dac(scale) => scale.raw_to_millivolts(raw),
            Conversion::Scaled { step, mask } => (raw & mask) as f64 * step,
            Conversion::Complement { step, mask } => (!raw & mask) as f64 * step,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub offset: u32,
    pub width: Width,
    pub access: Access,
    pub conversion: Conversion,
}

impl Register {
    const fn new(name: &'static str, offset: u32, access: Access, conversion: Conversion) -> Self {
        Self {
            name,
            offset,
            width: Width::Long,
            access,
            conversion,
        }
    }
}

/// Static, ordered register catalogue of one device type.
#[derive(Clone, Copy, Debug)]
pub struct RegisterMap {
    registers: &'static [Register],
}

impl RegisterMap {
    pub const fn new(registers: &'static [Register]) -> Self {
        Self { registers }
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn by_index(&self, index: usize) -> Result<&'static Register, ConfigError> {
        self.registers.get(index).ok_or(ConfigError::InvalidIndex {
            index,
            len: self.registers.len(),
        })
    }

    pub fn by_name(&self, name: &str) -> Result<&'static Register, ConfigError> {
        self.registers
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownKey(name.to_owned()))
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ConfigError> {
        self.registers
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownKey(name.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Register> {
        self.registers.iter()
    }

    /// Read every readable register and log the values in one block.
    pub fn log_dump(&self, device: &str, bus: &mut dyn BusTransport, base: u32, address_modifier: u8) {
        let mut dump = String::new();
        for reg in self.iter().filter(|r| r.access.readable()) {
            match read_checked(bus, base + reg.offset, address_modifier, reg.width) {
                Ok(value) => dump.push_str(&format!("{}: {:#010x}\n", reg.name, value)),
                Err(e) => dump.push_str(&format!("{}: <{}>\n", reg.name, e)),
            }
        }
        if dump.ends_with('\n') {
            dump.pop();
        }
        info!("{} registers:\n{}", device, dump);
    }
}

/// Registers of the master trigger card, in catalogue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtcReg {
    Control,
    Serial,
    DacCount,
    SoftGt,
    PedestalWidth,
    CoarseDelay,
    FineDelay,
    ThresholdModulation,
    PedestalCrateMask,
    Prescale,
    PulserRate,
    MemoryAddress,
    ReadPointer,
    Lockout,
    GtWordMask,
    Xilinx,
    GtCrateMask,
    GtId,
    Clock50Low,
    Clock50High,
    Clock10Low,
    Clock10High,
}

impl MtcReg {
    pub fn register(self) -> &'static Register {
        &MTC_REGISTER_TABLE[self as usize]
    }
}

use Access::*;

static MTC_REGISTER_TABLE: [Register; 22] = [
    Register::new("ControlReg", 0x00, ReadWrite, Conversion::Raw),
    Register::new("SerialReg", 0x04, ReadWrite, Conversion::Raw),
    Register::new("DacCntReg", 0x08, ReadWrite, Conversion::Raw),
    Register::new("SoftGtReg", 0x0c, WriteOnly, Conversion::Raw),
    Register::new(
        "PedWidthReg",
        0x10,
        ReadWrite,
        Conversion::Complement {
            step: 5.0,
            mask: 0xff,
        },
    ),
    Register::new(
        "CoarseDelayReg",
        0x14,
        ReadWrite,
        Conversion::Complement {
            step: 10.0,
            mask: 0xff,
        },
    ),
    Register::new(
        "FineDelayReg",
        0x18,
        ReadWrite,
        Conversion::Scaled {
            step: 0.1,
            mask: 0xff,
        },
    ),
    Register::new("ThreshModReg", 0x1c, ReadWrite, Conversion::Raw),
    Register::new("PmskReg", 0x20, ReadWrite, Conversion::Raw),
    Register::new(
        "ScaleReg",
        0x24,
        ReadWrite,
        Conversion::Complement {
            step: 1.0,
            mask: 0xffff,
        },
    ),
    Register::new("PulserReg", 0x28, ReadWrite, Conversion::Raw),
    Register::new("BwrAddOutReg", 0x2c, ReadWrite, Conversion::Raw),
    Register::new("BbaReg", 0x30, ReadWrite, Conversion::Raw),
    Register::new(
        "GtLockReg",
        0x34,
        ReadWrite,
        Conversion::Complement {
            step: 20.0,
            mask: 0xff,
        },
    ),
    Register::new("MaskReg", 0x38, ReadWrite, Conversion::Raw),
    Register::new("XilinxReg", 0x3c, ReadWrite, Conversion::Raw),
    Register::new("GmskReg", 0x40, ReadWrite, Conversion::Raw),
    Register::new("OcGtReg", 0x80, ReadOnly, Conversion::Raw),
    Register::new("C50_0_31Reg", 0x84, ReadOnly, Conversion::Raw),
    Register::new("C50_32_42Reg", 0x88, ReadOnly, Conversion::Raw),
    Register::new("C10_0_31Reg", 0x8c, ReadWrite, Conversion::Raw),
    Register::new("C10_32_52Reg", 0x90, ReadWrite, Conversion::Raw),
];

pub static MTC_REGISTERS: RegisterMap = RegisterMap::new(&MTC_REGISTER_TABLE);
