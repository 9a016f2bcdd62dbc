//! Software stand-in for a crate of ADC cards and a trigger card.
//!
//! Behaves like the hardware closely enough for the run controller and the
//! CLI: channels become ready at random, the output FIFO fills with framed
//! blocks and answers with the not-valid tag once empty, the trigger card
//! counts GTs and runs its 10 MHz clock. Unknown addresses act as plain
//! registers.

use crate::{
    mtc::{control, serial, xilinx, CLOCK10_HIGH_MASK, GT_ID_MASK},
    BusTransport, Caen965Layout, MtcReg, Width, WordTag, BLOCK_READY, CHANNEL_READY,
};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};

/// Address window decoded by one ADC card.
pub const ADC_WINDOW: u32 = 0x1_0000;
/// Address window decoded by the trigger card.
pub const MTC_WINDOW: u32 = 0x100;
/// Largest block the simulated FIFO produces.
pub const MAX_SIM_BLOCK: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimSettings {
    pub seed: u64,
    /// Probability that any single read fails with a bus error.
    pub fault_rate: f64,
    /// Probability that a polled source has something new.
    pub event_rate: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            fault_rate: 0.0,
            event_rate: 0.2,
        }
    }
}

#[derive(Debug)]
struct SimAdc {
    base: u32,
    layout: Caen965Layout,
    pending: Vec<Option<u32>>,
    fifo: VecDeque<u32>,
    unplugged: bool,
}

impl SimAdc {
    fn channel_of(&self, offset: u32, first: u32) -> Option<usize> {
        let span = self.layout.num_channels * 4;
        if offset >= first && offset < first + span && (offset - first) % 4 == 0 {
            Some(((offset - first) / 4) as usize)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct SimMtc {
    base: u32,
    shift: u32,
    last_serial: u32,
    programmed: bool,
    unplugged: bool,
}

pub struct SimulatedCrate {
    rng: StdRng,
    settings: SimSettings,
    registers: HashMap<u32, u32>,
    adcs: Vec<SimAdc>,
    mtc: Option<SimMtc>,
}

impl SimulatedCrate {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            registers: HashMap::new(),
            adcs: Vec::new(),
            mtc: None,
        }
    }

    pub fn add_adc(&mut self, base: u32, layout: Caen965Layout) {
        let channels = layout.num_channels as usize;
        self.adcs.push(SimAdc {
            base,
            layout,
            pending: vec![None; channels],
            fifo: VecDeque::new(),
            unplugged: false,
        });
    }

    pub fn add_mtc(&mut self, base: u32) {
        self.mtc = Some(SimMtc {
            base,
            ..Default::default()
        });
    }

    /// Make every access to the card at `base` fail as if the slot were empty.
    pub fn unplug(&mut self, base: u32) {
        for adc in self.adcs.iter_mut().filter(|a| a.base == base) {
            adc.unplugged = true;
        }
        if let Some(mtc) = self.mtc.as_mut().filter(|m| m.base == base) {
            mtc.unplugged = true;
        }
    }

    pub fn replug(&mut self, base: u32) {
        for adc in self.adcs.iter_mut().filter(|a| a.base == base) {
            adc.unplugged = false;
        }
        if let Some(mtc) = self.mtc.as_mut().filter(|m| m.base == base) {
            mtc.unplugged = false;
        }
    }

    /// Queue one framed block in the FIFO of the card at `base`.
    pub fn push_block(&mut self, base: u32, payload: &[u32]) {
        if let Some(adc) = self.adcs.iter_mut().find(|a| a.base == base) {
            adc.fifo.push_back(WordTag::Header.tag((payload.len() as u32) << 8));
            adc.fifo.extend(payload.iter().map(|v| WordTag::Data.tag(*v)));
            adc.fifo.push_back(WordTag::EndOfBlock.tag(0));
        }
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.random_bool(p.clamp(0.0, 1.0))
    }

    fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    fn adc_index(&self, address: u32) -> Option<usize> {
        self.adcs
            .iter()
            .position(|a| address >= a.base && address - a.base < ADC_WINDOW)
    }

    fn mtc_offset(&self, address: u32) -> Option<u32> {
        self.mtc
            .as_ref()
            .filter(|m| address >= m.base && address - m.base < MTC_WINDOW)
            .map(|m| address - m.base)
    }

    fn read_adc(&mut self, index: usize, address: u32) -> Result<u32, i32> {
        let event_rate = self.settings.event_rate;
        let fire = self.chance(event_rate);
        let count = self.rng.random_range(1..=MAX_SIM_BLOCK);
        let sample = self.rng.random_range(0..0x1000u32);
        let adc = &mut self.adcs[index];
        if adc.unplugged {
            return Err(-libc::ENODEV);
        }
        let offset = address - adc.base;
        let layout = &adc.layout;

        if let Some(chan) = adc.channel_of(offset, layout.status_offset) {
            if adc.pending[chan].is_none() && fire {
                adc.pending[chan] = Some(sample);
            }
            return Ok(match adc.pending[chan] {
                Some(_) => CHANNEL_READY,
                None => 0,
            });
        }
        if let Some(chan) = adc.channel_of(offset, layout.data_offset) {
            return Ok(adc.pending[chan].take().unwrap_or(0));
        }
        if offset == layout.global_status_offset {
            if adc.fifo.is_empty() && fire {
                adc.fifo.push_back(WordTag::Header.tag(count << 8));
                for i in 0..count {
                    adc.fifo.push_back(WordTag::Data.tag((i << 16) | sample));
                }
                adc.fifo.push_back(WordTag::EndOfBlock.tag(0));
            }
            return Ok(if adc.fifo.is_empty() { 0 } else { BLOCK_READY });
        }
        if offset == layout.fifo_offset {
            return Ok(adc.fifo.pop_front().unwrap_or(WordTag::NotValid.tag(0)));
        }
        Ok(self.register(address))
    }

    fn read_mtc(&mut self, address: u32, offset: u32) -> Result<u32, i32> {
        let fire = self.chance(self.settings.event_rate);
        let ticks = self.rng.random_range(1..10_000u64);
        let Some(mtc) = self.mtc.as_ref() else {
            return Ok(0);
        };
        if mtc.unplugged {
            return Err(-libc::ENODEV);
        }
        let base = mtc.base;
        let gt_addr = base + MtcReg::GtId.register().offset;
        if offset == MtcReg::GtId.register().offset && fire {
            let gt = (self.registers.get(&gt_addr).copied().unwrap_or(0) + 1) & GT_ID_MASK;
            self.registers.insert(gt_addr, gt);
            let low = base + MtcReg::Clock10Low.register().offset;
            let high = base + MtcReg::Clock10High.register().offset;
            let now = ((self.register(high) as u64) << 32 | self.register(low) as u64) + ticks;
            self.registers.insert(low, now as u32);
            self.registers.insert(high, (now >> 32) as u32 & CLOCK10_HIGH_MASK);
        }
        let mut value = self.register(address);
        let programmed = self.mtc.as_ref().is_some_and(|m| m.programmed);
        if offset == MtcReg::Xilinx.register().offset && programmed {
            value |= xilinx::DONE;
        }
        Ok(value)
    }

    fn write_mtc(&mut self, address: u32, offset: u32, value: u32) -> i32 {
        let Some(mtc) = self.mtc.as_mut() else {
            return 4;
        };
        if mtc.unplugged {
            return -libc::ENODEV;
        }
        let base = mtc.base;
        if offset == MtcReg::Serial.register().offset {
            let rising = value & serial::CLOCK != 0 && mtc.last_serial & serial::CLOCK == 0;
            if rising {
                mtc.shift = (mtc.shift << 1) | (value & serial::DATA);
            }
            mtc.last_serial = value;
        } else if offset == MtcReg::Xilinx.register().offset {
            if value & xilinx::PROG == 0 {
                mtc.programmed = false;
            } else if value & xilinx::CLOCK != 0 {
                mtc.programmed = true;
            }
        } else if offset == MtcReg::Control.register().offset && value & control::LOAD_ENGT != 0 {
            let gt = mtc.shift & GT_ID_MASK;
            self.registers.insert(base + MtcReg::GtId.register().offset, gt);
            debug!("sim: GT counter loaded with {:#08x}", gt);
        } else if offset == MtcReg::SoftGt.register().offset {
            let gt_addr = base + MtcReg::GtId.register().offset;
            let gt = (self.register(gt_addr) + 1) & GT_ID_MASK;
            self.registers.insert(gt_addr, gt);
            return 4;
        }
        self.registers.insert(address, value);
        4
    }
}

impl BusTransport for SimulatedCrate {
    fn read(&mut self, address: u32, _address_modifier: u8, width: Width) -> (i32, u32) {
        if self.chance(self.settings.fault_rate) {
            return (-libc::EIO, 0);
        }
        let result = if let Some(index) = self.adc_index(address) {
            self.read_adc(index, address)
        } else if let Some(offset) = self.mtc_offset(address) {
            self.read_mtc(address, offset)
        } else {
            Ok(self.register(address))
        };
        match result {
            Ok(value) => (width.bytes(), value & width.mask()),
            Err(code) => (code, 0),
        }
    }

    fn write(&mut self, address: u32, _address_modifier: u8, width: Width, value: u32) -> i32 {
        let value = value & width.mask();
        if let Some(index) = self.adc_index(address) {
            if self.adcs[index].unplugged {
                return -libc::ENODEV;
            }
        } else if let Some(offset) = self.mtc_offset(address) {
            let result = self.write_mtc(address, offset, value);
            return if result < 0 { result } else { width.bytes() };
        }
        self.registers.insert(address, value);
        width.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Caen965, DeviceDescriptor, EventBuffer, Mtc};

    const ADC_BASE: u32 = 0x0030_0000;
    const MTC_BASE: u32 = 0x7000;

    fn quiet() -> SimulatedCrate {
        let mut sim = SimulatedCrate::new(SimSettings {
            seed: 7,
            fault_rate: 0.0,
            event_rate: 0.0,
        });
        sim.add_adc(ADC_BASE, Caen965Layout::default());
        sim.add_mtc(MTC_BASE);
        sim
    }

    #[test]
    fn empty_fifo_reads_not_valid() {
        let mut sim = quiet();
        let (n, word) = sim.read(ADC_BASE, 0x39, Width::Long);
        assert_eq!(n, 4);
        assert!(WordTag::NotValid.matches(word));
    }

    #[test]
    fn pushed_block_is_read_back_by_the_engine() {
        let mut sim = quiet();
        sim.push_block(ADC_BASE, &[1, 2, 3]);
        let mut adc = Caen965::new(
            DeviceDescriptor::new("adc", 0, 4, ADC_BASE),
            Caen965Layout::default(),
        );
        adc.set_data_id(0x0800_0000);
        let mut buf = EventBuffer::new();
        let report = adc.readout(&mut sim, &mut buf);
        assert!(report.faults.is_empty());
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.words()[0], 0x0800_0005);
        assert_eq!(&buf.words()[2..], &[1, 2, 3]);
    }

    #[test]
    fn busy_crate_produces_records() {
        let mut sim = SimulatedCrate::new(SimSettings {
            seed: 1,
            fault_rate: 0.0,
            event_rate: 1.0,
        });
        sim.add_adc(ADC_BASE, Caen965Layout::default());
        let adc = Caen965::new(
            DeviceDescriptor::new("adc", 0, 4, ADC_BASE),
            Caen965Layout::default(),
        );
        let mut buf = EventBuffer::new();
        let report = adc.readout(&mut sim, &mut buf);
        assert_eq!(report.channel_records, 4);
        assert!(report.block_words >= 3);
        assert!(report.faults.is_empty());
    }

    #[test]
    fn gt_counter_and_xilinx_emulation() {
        let mut sim = quiet();
        let mtc = Mtc::new(DeviceDescriptor::new("mtc", 0, 17, MTC_BASE));
        mtc.set_gt_counter(&mut sim, 0x00ab_cdef).unwrap();
        assert_eq!(mtc.gt_id(&mut sim).unwrap(), 0x00ab_cdef);
        mtc.send_soft_gt(&mut sim).unwrap();
        assert_eq!(mtc.gt_id(&mut sim).unwrap(), 0x00ab_cdf0);
        mtc.load_xilinx(&mut sim, &[0x55, 0xaa]).unwrap();
    }

    #[test]
    fn unplugged_card_reports_no_device() {
        let mut sim = quiet();
        sim.unplug(ADC_BASE);
        let (code, _) = sim.read(ADC_BASE + 0x100e, 0x39, Width::Word);
        assert_eq!(code, -libc::ENODEV);
        sim.replug(ADC_BASE);
        let (code, _) = sim.read(ADC_BASE + 0x100e, 0x39, Width::Word);
        assert_eq!(code, 2);
    }
}
