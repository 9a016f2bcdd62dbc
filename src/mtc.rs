//! Master trigger card.
//!
//! Every command is a short sequence of register accesses through the
//! [`MTC_REGISTERS`] table. Mask and control updates are read-modify-write
//! and must not interleave with a readout of the same card; the run
//! controller guarantees that by applying commands only between polls.

use crate::{
    charge_to_millivolts, hit_count_to_millivolts, millivolts_to_charge, millivolts_to_hit_count,
    AcquisitionSession, BusTransport, ConfigError, DacScale, DaqError, DaqResult, DataProducing, Device,
    DeviceDescriptor, EventBuffer, MtcReg, OutputSink, ParamValue, ParameterCatalog, Readable,
    RunContext, Writable, AM_A16, MTC_PARAMETERS, MTC_REGISTERS, MTC_THRESHOLD_DACS,
};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use time::macros::datetime;
use time::OffsetDateTime;

/// Control register bits.
pub mod control {
    pub const PED_EN: u32 = 0x0000_0001;
    pub const PULSE_EN: u32 = 0x0000_0002;
    /// Load enables latch the shadow value of the named register.
    pub const LOAD_ENPR: u32 = 0x0000_0004;
    pub const LOAD_ENPS: u32 = 0x0000_0008;
    pub const LOAD_ENPW: u32 = 0x0000_0010;
    pub const LOAD_ENLK: u32 = 0x0000_0020;
    pub const ASYNC_EN: u32 = 0x0000_0040;
    pub const RESYNC_EN: u32 = 0x0000_0080;
    pub const TESTGT: u32 = 0x0000_0100;
    pub const TESTSTAT: u32 = 0x0000_0200;
    pub const TESTEN: u32 = 0x0000_0400;
    pub const LOAD_ENGT: u32 = 0x0000_0800;
    pub const LOAD_EN10: u32 = 0x0000_2000;
    pub const FIFO_RESET: u32 = 0x0001_0000;
}

/// Serial register bits used to shift the GT counter in.
pub mod serial {
    pub const DATA: u32 = 0x0000_0001;
    pub const CLOCK: u32 = 0x0000_0002;
}

/// Programmable logic configuration port bits.
pub mod xilinx {
    pub const DATA: u32 = 0x0000_0001;
    pub const CLOCK: u32 = 0x0000_0002;
    /// Held low to clear the device before an image is clocked in.
    pub const PROG: u32 = 0x0000_0004;
    pub const DONE: u32 = 0x0000_0010;
}

pub const GT_ID_BITS: u32 = 24;
pub const GT_ID_MASK: u32 = 0x00ff_ffff;
/// 26 trigger word inputs.
pub const GT_WORD_MASK_ALL: u32 = 0x03ff_ffff;
/// 19 detector crates plus the trigger utility crate.
pub const CRATE_MASK_ALL: u32 = 0x000f_ffff;
pub const CLOCK10_HIGH_MASK: u32 = 0x001f_ffff;
pub const TEN_MHZ: f64 = 1.0e7;
/// Input clock of the pulser divider.
pub const PULSER_CLOCK_HZ: f64 = 781_250.0;
pub const PULSER_MAX_DIVIDER: u32 = 0x00ff_ffff;
/// Start of the 10 MHz clock epoch.
pub const MTC_EPOCH: OffsetDateTime = datetime!(1996-01-01 0:00 UTC);

/// Ticks of the 10 MHz clock between the clock epoch and `at`.
pub fn mtc_ticks_at(at: OffsetDateTime) -> u64 {
    let elapsed = at - MTC_EPOCH;
    (elapsed.whole_nanoseconds().max(0) / 100) as u64
}

/// Pulser divider for `rate_hz`; zero stops the pulser.
pub fn pulser_divider(rate_hz: f64) -> u32 {
    if rate_hz <= 0.0 {
        return 0;
    }
    let divider = (PULSER_CLOCK_HZ / rate_hz).round() - 1.0;
    (divider.max(1.0) as u32).min(PULSER_MAX_DIVIDER)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasicOp {
    Read,
    Write(u32),
}

#[derive(Debug, Clone)]
pub struct Mtc {
    descriptor: DeviceDescriptor,
    catalog: ParameterCatalog,
    session: AcquisitionSession,
    data_id: u32,
    dac_scale: DacScale,
}

impl Device for Mtc {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl Readable for Mtc {}
impl Writable for Mtc {}

impl Mtc {
    pub fn new(mut descriptor: DeviceDescriptor) -> Self {
        descriptor.address_modifier = AM_A16;
        Self {
            descriptor,
            catalog: ParameterCatalog::new(&MTC_PARAMETERS),
            session: AcquisitionSession::new(),
            data_id: 0,
            dac_scale: DacScale::THRESHOLD_12BIT,
        }
    }

    pub fn catalog(&self) -> &ParameterCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut ParameterCatalog {
        &mut self.catalog
    }

    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    pub fn read(&self, bus: &mut dyn BusTransport, reg: MtcReg) -> DaqResult<u32> {
        let r = reg.register();
        Ok(self.read_at(bus, r.offset, r.width)?)
    }

    pub fn write(&self, bus: &mut dyn BusTransport, reg: MtcReg, value: u32) -> DaqResult<()> {
        let r = reg.register();
        Ok(self.write_at(bus, r.offset, r.width, value)?)
    }

    pub fn set_bits(&self, bus: &mut dyn BusTransport, reg: MtcReg, mask: u32) -> DaqResult<()> {
        let value = self.read(bus, reg)?;
        self.write(bus, reg, value | mask)
    }

    pub fn clear_bits(&self, bus: &mut dyn BusTransport, reg: MtcReg, mask: u32) -> DaqResult<()> {
        let value = self.read(bus, reg)?;
        self.write(bus, reg, value & !mask)
    }

    fn pulse_load_enable(&self, bus: &mut dyn BusTransport, bit: u32) -> DaqResult<()> {
        self.set_bits(bus, MtcReg::Control, bit)?;
        self.clear_bits(bus, MtcReg::Control, bit)
    }

    fn encode(reg: MtcReg, value: f64) -> u32 {
        reg.register().conversion.encode(value)
    }

    // masks

    pub fn set_global_gt_word_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::GtWordMask, GT_WORD_MASK_ALL)
    }

    pub fn clear_global_gt_word_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::GtWordMask, 0)
    }

    pub fn set_single_gt_word_mask(&self, bus: &mut dyn BusTransport, mask: u32) -> DaqResult<()> {
        self.set_bits(bus, MtcReg::GtWordMask, mask & GT_WORD_MASK_ALL)
    }

    pub fn clear_single_gt_word_mask(&self, bus: &mut dyn BusTransport, mask: u32) -> DaqResult<()> {
        self.clear_bits(bus, MtcReg::GtWordMask, mask & GT_WORD_MASK_ALL)
    }

    pub fn gt_word_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<u32> {
        Ok(self.read(bus, MtcReg::GtWordMask)? & GT_WORD_MASK_ALL)
    }

    /// Enable pedestals on every crate.
    pub fn set_pedestal_crate_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::PedestalCrateMask, CRATE_MASK_ALL)
    }

    pub fn clear_pedestal_crate_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::PedestalCrateMask, 0)
    }

    pub fn set_gt_crate_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::GtCrateMask, CRATE_MASK_ALL)
    }

    pub fn clear_gt_crate_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::GtCrateMask, 0)
    }

    pub fn gt_crate_mask(&self, bus: &mut dyn BusTransport) -> DaqResult<u32> {
        Ok(self.read(bus, MtcReg::GtCrateMask)? & CRATE_MASK_ALL)
    }

    // reset

    pub fn clear_control_register(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::Control, 0)
    }

    /// Reset the trigger FIFO and both memory pointers.
    pub fn reset_memory(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.pulse_load_enable(bus, control::FIFO_RESET)?;
        self.write(bus, MtcReg::MemoryAddress, 0)?;
        self.write(bus, MtcReg::ReadPointer, 0)
    }

    // GT counter

    /// Shift a new GT id in MSB first and latch it.
    pub fn set_gt_counter(&self, bus: &mut dyn BusTransport, value: u32) -> DaqResult<()> {
        let value = value & GT_ID_MASK;
        for bit in (0..GT_ID_BITS).rev() {
            let data = (value >> bit) & serial::DATA;
            self.write(bus, MtcReg::Serial, data)?;
            self.write(bus, MtcReg::Serial, data | serial::CLOCK)?;
        }
        self.write(bus, MtcReg::Serial, 0)?;
        self.pulse_load_enable(bus, control::LOAD_ENGT)?;
        debug!("{}: GT counter set to {:#08x}", self.descriptor.name, value);
        Ok(())
    }

    pub fn zero_gt_counter(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.set_gt_counter(bus, 0)
    }

    pub fn gt_id(&self, bus: &mut dyn BusTransport) -> DaqResult<u32> {
        Ok(self.read(bus, MtcReg::GtId)? & GT_ID_MASK)
    }

    // 10 MHz clock

    pub fn set_ten_mhz_counter(&self, bus: &mut dyn BusTransport, low: u32, high: u32) -> DaqResult<()> {
        self.write(bus, MtcReg::Clock10Low, low)?;
        self.write(bus, MtcReg::Clock10High, high & CLOCK10_HIGH_MASK)?;
        self.pulse_load_enable(bus, control::LOAD_EN10)
    }

    pub fn ten_mhz_counter(&self, bus: &mut dyn BusTransport) -> DaqResult<(u32, u32)> {
        let low = self.read(bus, MtcReg::Clock10Low)?;
        let high = self.read(bus, MtcReg::Clock10High)? & CLOCK10_HIGH_MASK;
        Ok((low, high))
    }

    pub fn ten_mhz_ticks(&self, bus: &mut dyn BusTransport) -> DaqResult<u64> {
        let (low, high) = self.ten_mhz_counter(bus)?;
        Ok(((high as u64) << 32) | low as u64)
    }

    pub fn ten_mhz_seconds(&self, bus: &mut dyn BusTransport) -> DaqResult<f64> {
        Ok(self.ten_mhz_ticks(bus)? as f64 / TEN_MHZ)
    }

    /// Load the 10 MHz clock from the system clock.
    pub fn set_mtc_time(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        let ticks = mtc_ticks_at(OffsetDateTime::now_utc());
        self.set_ten_mhz_counter(bus, ticks as u32, (ticks >> 32) as u32)?;
        info!("{}: 10 MHz clock set to {} ticks", self.descriptor.name, ticks);
        Ok(())
    }

    // widths and delays

    pub fn set_lockout_width(&self, bus: &mut dyn BusTransport, width_ns: f64) -> DaqResult<()> {
        self.write(bus, MtcReg::Lockout, Self::encode(MtcReg::Lockout, width_ns))?;
        self.pulse_load_enable(bus, control::LOAD_ENLK)
    }

    pub fn set_pedestal_width(&self, bus: &mut dyn BusTransport, width_ns: f64) -> DaqResult<()> {
        let raw = Self::encode(MtcReg::PedestalWidth, width_ns);
        self.write(bus, MtcReg::PedestalWidth, raw)?;
        self.pulse_load_enable(bus, control::LOAD_ENPW)
    }

    pub fn set_prescale(&self, bus: &mut dyn BusTransport, prescale: u32) -> DaqResult<()> {
        let raw = Self::encode(MtcReg::Prescale, prescale.max(1) as f64);
        self.write(bus, MtcReg::Prescale, raw)?;
        self.pulse_load_enable(bus, control::LOAD_ENPS)
    }

    pub fn setup_gt_coarse_delay(&self, bus: &mut dyn BusTransport, delay_ns: f64) -> DaqResult<()> {
        let raw = Self::encode(MtcReg::CoarseDelay, delay_ns);
        self.write(bus, MtcReg::CoarseDelay, raw)
    }

    pub fn setup_gt_fine_delay(&self, bus: &mut dyn BusTransport, delay_ns: f64) -> DaqResult<()> {
        let raw = Self::encode(MtcReg::FineDelay, delay_ns);
        self.write(bus, MtcReg::FineDelay, raw)
    }

    pub fn setup_pulse_gt_delays(
        &self,
        bus: &mut dyn BusTransport,
        coarse_ns: f64,
        fine_ns: f64,
    ) -> DaqResult<()> {
        self.setup_gt_coarse_delay(bus, coarse_ns)?;
        self.setup_gt_fine_delay(bus, fine_ns)
    }

    /// Program the pulser divider. A rate of zero stops the pulser.
    pub fn set_pulser_rate(&self, bus: &mut dyn BusTransport, rate_hz: f64) -> DaqResult<()> {
        let divider = pulser_divider(rate_hz);
        self.write(bus, MtcReg::PulserRate, divider)?;
        self.pulse_load_enable(bus, control::LOAD_ENPR)?;
        if divider == 0 {
            self.disable_pulser(bus)?;
        }
        Ok(())
    }

    // pulser and pedestals

    pub fn enable_pulser(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.set_bits(bus, MtcReg::Control, control::PULSE_EN)
    }

    pub fn disable_pulser(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.clear_bits(bus, MtcReg::Control, control::PULSE_EN)
    }

    pub fn enable_pedestal(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.set_bits(bus, MtcReg::Control, control::PED_EN)
    }

    pub fn disable_pedestal(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.clear_bits(bus, MtcReg::Control, control::PED_EN)
    }

    pub fn send_soft_gt(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.write(bus, MtcReg::SoftGt, 0)
    }

    /// Fire `count` pedestals through soft GTs with the pulser stopped.
    pub fn fire_pedestals_fixed_number(
        &mut self,
        bus: &mut dyn BusTransport,
        count: u32,
    ) -> DaqResult<()> {
        self.disable_pulser(bus)?;
        self.enable_pedestal(bus)?;
        for _ in 0..count {
            self.send_soft_gt(bus)?;
        }
        self.disable_pedestal(bus)?;
        self.session.counters_mut().pedestal_count += count as u64;
        info!("{}: fired {} pedestals", self.descriptor.name, count);
        Ok(())
    }

    /// Start a pedestal run: pedestals enabled, pulser firing at `rate_hz`.
    pub fn fire_pedestals_fixed_rate(
        &self,
        bus: &mut dyn BusTransport,
        rate_hz: f64,
    ) -> DaqResult<()> {
        if rate_hz <= 0.0 {
            return Err(ConfigError::Parse(format!("pedestal rate {rate_hz} Hz")).into());
        }
        self.disable_pulser(bus)?;
        self.set_pulser_rate(bus, rate_hz)?;
        self.enable_pedestal(bus)?;
        self.enable_pulser(bus)?;
        info!("{}: pedestals at {} Hz", self.descriptor.name, rate_hz);
        Ok(())
    }

    /// End a pedestal run, leaving the pulser stopped.
    pub fn stop_pedestals_fixed_rate(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.disable_pulser(bus)?;
        self.disable_pedestal(bus)?;
        info!("{}: pedestal run stopped", self.descriptor.name);
        Ok(())
    }

    pub fn setup_pulser_rate_and_enable(
        &self,
        bus: &mut dyn BusTransport,
        rate_hz: f64,
    ) -> DaqResult<()> {
        self.set_pulser_rate(bus, rate_hz)?;
        if rate_hz > 0.0 {
            self.enable_pulser(bus)?;
        }
        Ok(())
    }

    pub fn basic_reset(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.clear_control_register(bus)?;
        self.reset_memory(bus)?;
        self.zero_gt_counter(bus)
    }

    // initialisation

    /// Load the trigger threshold DACs from the catalogue, in DAC order.
    pub fn load_dacs(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        for (index, name) in MTC_THRESHOLD_DACS.iter().enumerate() {
            let mv = self.catalog.float(name)?;
            let raw = self.dac_scale.millivolts_to_raw(mv);
            self.write(bus, MtcReg::DacCount, ((index as u32) << 12) | raw)?;
        }
        debug!("{}: loaded {} threshold DACs", self.descriptor.name, MTC_THRESHOLD_DACS.len());
        Ok(())
    }

    /// Clock a programmable-logic image in MSB first and check DONE.
    pub fn load_xilinx(&self, bus: &mut dyn BusTransport, image: &[u8]) -> DaqResult<()> {
        if image.is_empty() {
            return Err(DaqError::ProgrammingFailed("empty image".into()));
        }
        self.write(bus, MtcReg::Xilinx, 0)?;
        self.write(bus, MtcReg::Xilinx, xilinx::PROG)?;
        for byte in image {
            for bit in (0..8).rev() {
                let data = xilinx::PROG | ((*byte as u32 >> bit) & xilinx::DATA);
                self.write(bus, MtcReg::Xilinx, data)?;
                self.write(bus, MtcReg::Xilinx, data | xilinx::CLOCK)?;
            }
        }
        let status = self.read(bus, MtcReg::Xilinx)?;
        if status & xilinx::DONE == 0 {
            return Err(DaqError::ProgrammingFailed(format!(
                "DONE not raised after {} bytes (status {:#x})",
                image.len(),
                status
            )));
        }
        info!("{}: programmable logic loaded ({} bytes)", self.descriptor.name, image.len());
        Ok(())
    }

    fn catalog_u32(&self, name: &str) -> DaqResult<u32> {
        let value = self.catalog.int(name)?;
        u32::try_from(value).map_err(|_| {
            DaqError::from(ConfigError::Parse(format!(
                "{name} = {value} does not fit a 32-bit register"
            )))
        })
    }

    /// Program every catalogue-backed register.
    pub fn apply_catalog(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        self.set_lockout_width(bus, self.catalog.int("lockout_width_ns")? as f64)?;
        self.set_pedestal_width(bus, self.catalog.int("pedestal_width_ns")? as f64)?;
        self.setup_pulse_gt_delays(
            bus,
            self.catalog.int("coarse_delay_ns")? as f64,
            self.catalog.float("fine_delay_ns")?,
        )?;
        self.set_prescale(bus, self.catalog_u32("prescale")?)?;
        self.write(bus, MtcReg::GtWordMask, self.catalog_u32("gt_word_mask")? & GT_WORD_MASK_ALL)?;
        self.write(bus, MtcReg::GtCrateMask, self.catalog_u32("gt_crate_mask")? & CRATE_MASK_ALL)?;
        self.write(
            bus,
            MtcReg::PedestalCrateMask,
            self.catalog_u32("pedestal_crate_mask")? & CRATE_MASK_ALL,
        )?;
        let rate = self.catalog.float("pulser_rate_hz")?;
        if self.catalog.int("pulser_enabled")? != 0 {
            self.setup_pulser_rate_and_enable(bus, rate)
        } else {
            self.set_pulser_rate(bus, rate)?;
            self.disable_pulser(bus)
        }
    }

    fn expected_registers(&self) -> DaqResult<[(MtcReg, u32); 8]> {
        Ok([
            (
                MtcReg::Lockout,
                Self::encode(MtcReg::Lockout, self.catalog.int("lockout_width_ns")? as f64),
            ),
            (
                MtcReg::PedestalWidth,
                Self::encode(MtcReg::PedestalWidth, self.catalog.int("pedestal_width_ns")? as f64),
            ),
            (
                MtcReg::CoarseDelay,
                Self::encode(MtcReg::CoarseDelay, self.catalog.int("coarse_delay_ns")? as f64),
            ),
            (
                MtcReg::FineDelay,
                Self::encode(MtcReg::FineDelay, self.catalog.float("fine_delay_ns")?),
            ),
            (
                MtcReg::Prescale,
                Self::encode(MtcReg::Prescale, self.catalog_u32("prescale")?.max(1) as f64),
            ),
            (
                MtcReg::GtWordMask,
                self.catalog_u32("gt_word_mask")? & GT_WORD_MASK_ALL,
            ),
            (
                MtcReg::GtCrateMask,
                self.catalog_u32("gt_crate_mask")? & CRATE_MASK_ALL,
            ),
            (
                MtcReg::PedestalCrateMask,
                self.catalog_u32("pedestal_crate_mask")? & CRATE_MASK_ALL,
            ),
        ])
    }

    /// Read back every catalogue-backed register.
    pub fn verify(&self, bus: &mut dyn BusTransport) -> DaqResult<()> {
        for (reg, wrote) in self.expected_registers()? {
            let read = self.read(bus, reg)?;
            if read != wrote {
                return Err(DaqError::VerifyMismatch {
                    register: reg.register().name,
                    wrote,
                    read,
                });
            }
        }
        Ok(())
    }

    /// Reset, optionally load logic and clock, load DACs, restore the
    /// catalogue, then verify.
    pub fn initialize(
        &self,
        bus: &mut dyn BusTransport,
        load_xilinx: bool,
        load_10mhz_clock: bool,
    ) -> DaqResult<()> {
        info!("{}: initialising", self.descriptor.name);
        self.clear_control_register(bus)?;
        if load_xilinx {
            let path = self.catalog.text("xilinx_file")?;
            if path.is_empty() {
                return Err(DaqError::ProgrammingFailed("no xilinx_file configured".into()));
            }
            let image = fs::read(path)?;
            self.load_xilinx(bus, &image)?;
        }
        self.load_dacs(bus)?;
        self.apply_catalog(bus)?;
        if load_10mhz_clock {
            self.set_mtc_time(bus)?;
        }
        self.verify(bus)?;
        info!("{}: initialised", self.descriptor.name);
        Ok(())
    }

    pub fn report_status(&self, bus: &mut dyn BusTransport) {
        MTC_REGISTERS.log_dump(
            &self.descriptor.name,
            bus,
            self.descriptor.base_address,
            self.descriptor.address_modifier,
        );
    }

    /// Repeat a raw access `repeat` times, returning the values read.
    /// With `auto_increment`, written values count up from the given one.
    pub fn run_basic_op(
        &self,
        bus: &mut dyn BusTransport,
        reg: MtcReg,
        op: BasicOp,
        repeat: u32,
        auto_increment: bool,
    ) -> DaqResult<Vec<u32>> {
        let access = reg.register().access;
        let mut values = Vec::new();
        for i in 0..repeat {
            match op {
                BasicOp::Read if access.readable() => values.push(self.read(bus, reg)?),
                BasicOp::Write(value) if access.writable() => {
                    let value = if auto_increment { value.wrapping_add(i) } else { value };
                    self.write(bus, reg, value)?;
                }
                _ => {
                    warn!(
                        "{}: {:?} not permitted on {}",
                        self.descriptor.name,
                        op,
                        reg.register().name
                    );
                    break;
                }
            }
        }
        Ok(values)
    }

    // thresholds in physical units

    pub fn nhit_threshold(&self, name: &str) -> DaqResult<f64> {
        Ok(millivolts_to_hit_count(
            self.catalog.float(name)?,
            self.catalog.float("nhit_dc_offset_mv")?,
            self.catalog.float("nhit_mv_per_hit")?,
        ))
    }

    pub fn set_nhit_threshold(&mut self, name: &str, hits: f64) -> DaqResult<()> {
        let mv = hit_count_to_millivolts(
            hits,
            self.catalog.float("nhit_dc_offset_mv")?,
            self.catalog.float("nhit_mv_per_hit")?,
        );
        Ok(self.catalog.set(name, ParamValue::Float(mv))?)
    }

    pub fn esum_threshold_pc(&self, name: &str) -> DaqResult<f64> {
        Ok(millivolts_to_charge(
            self.catalog.float(name)?,
            self.catalog.float("esum_dc_offset_mv")?,
            self.catalog.float("esum_mv_per_pc")?,
        ))
    }

    pub fn set_esum_threshold_pc(&mut self, name: &str, pc: f64) -> DaqResult<()> {
        let mv = charge_to_millivolts(
            pc,
            self.catalog.float("esum_dc_offset_mv")?,
            self.catalog.float("esum_mv_per_pc")?,
        );
        Ok(self.catalog.set(name, ParamValue::Float(mv))?)
    }

    pub fn save_settings(&self, path: &Path) -> DaqResult<()> {
        self.catalog.save(path)?;
        info!("{}: settings saved to {}", self.descriptor.name, path.display());
        Ok(())
    }

    pub fn load_settings(&mut self, path: &Path) -> DaqResult<()> {
        self.catalog.load(path)?;
        info!("{}: settings loaded from {}", self.descriptor.name, path.display());
        Ok(())
    }

    fn offline_or(&self, e: DaqError) -> DaqError {
        if e.is_offline() {
            DaqError::DeviceOffline {
                device: self.descriptor.name.clone(),
            }
        } else {
            e
        }
    }
}

impl DataProducing for Mtc {
    fn data_id(&self) -> u32 {
        self.data_id
    }

    fn on_run_start(&mut self, ctx: &mut RunContext<'_>) -> DaqResult<()> {
        self.data_id = ctx.data_ids.get(&self.descriptor)?;
        self.session.arm()?;
        match self.gt_id(ctx.bus) {
            Ok(gt) => {
                self.session.counters_mut().last_gt_id = gt;
                debug!(
                    "{}: run {} starts at GT id {:#08x}",
                    self.descriptor.name, ctx.run_number, gt
                );
            }
            Err(e) if e.is_offline() => return Err(self.offline_or(e)),
            // The first poll resynchronises the GT id.
            Err(e) => warn!("{}: GT id read at run start failed: {}", self.descriptor.name, e),
        }
        Ok(())
    }

    fn on_take_data(
        &mut self,
        sink: &mut dyn OutputSink,
        ctx: &mut RunContext<'_>,
    ) -> DaqResult<()> {
        self.session.begin_taking()?;
        self.session.counters_mut().polls += 1;

        let gt = match self.gt_id(ctx.bus) {
            Ok(gt) => gt,
            Err(e) => {
                warn!("{}: GT id read failed: {}", self.descriptor.name, e);
                return if e.is_offline() { Err(self.offline_or(e)) } else { Ok(()) };
            }
        };
        if gt == self.session.counters().last_gt_id {
            return Ok(());
        }
        let (low, high) = match self.ten_mhz_counter(ctx.bus) {
            Ok(clock) => clock,
            Err(e) => {
                warn!("{}: clock read failed: {}", self.descriptor.name, e);
                return if e.is_offline() { Err(self.offline_or(e)) } else { Ok(()) };
            }
        };

        let pulser_on = match self.read(ctx.bus, MtcReg::Control) {
            Ok(value) => value & control::PULSE_EN != 0,
            Err(e) => {
                warn!("{}: control read failed: {}", self.descriptor.name, e);
                false
            }
        };
        let counters = self.session.counters_mut();
        if pulser_on {
            counters.pulser_count += (gt.wrapping_sub(counters.last_gt_id) & GT_ID_MASK) as u64;
        }
        counters.last_gt_id = gt;
        counters.clock_low = low;
        counters.clock_high = high;

        let mut buffer = EventBuffer::new();
        buffer.ensure_capacity(5);
        for word in [
            self.data_id | 5,
            self.descriptor.location_mask(),
            gt,
            low,
            high,
        ] {
            buffer.append(word)?;
        }
        sink.append(buffer)
    }

    fn on_run_stop(&mut self, _ctx: &mut RunContext<'_>) -> DaqResult<()> {
        self.data_id = 0;
        self.session.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{negotiate_data_ids, BusTransport, Scripted, ScriptedBus, SessionState, Transaction};

    const BASE: u32 = 0x7000;

    fn mtc() -> Mtc {
        Mtc::new(DeviceDescriptor::new("mtc", 0, 17, BASE))
    }

    fn addr(reg: MtcReg) -> u32 {
        BASE + reg.register().offset
    }

    #[derive(Default)]
    struct Collect(Vec<Vec<u32>>);

    impl OutputSink for Collect {
        fn append(&mut self, buffer: EventBuffer) -> DaqResult<()> {
            self.0.push(buffer.into_words());
            Ok(())
        }
    }

    #[test]
    fn masks_are_read_modify_write() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        bus.set_register(addr(MtcReg::GtWordMask), 0b0101);
        m.set_single_gt_word_mask(&mut bus, 0b0010).unwrap();
        assert_eq!(m.gt_word_mask(&mut bus).unwrap(), 0b0111);
        m.clear_single_gt_word_mask(&mut bus, 0b0100).unwrap();
        assert_eq!(m.gt_word_mask(&mut bus).unwrap(), 0b0011);
        m.set_global_gt_word_mask(&mut bus).unwrap();
        assert_eq!(m.gt_word_mask(&mut bus).unwrap(), GT_WORD_MASK_ALL);

        m.set_gt_crate_mask(&mut bus).unwrap();
        assert_eq!(m.gt_crate_mask(&mut bus).unwrap(), CRATE_MASK_ALL);
        m.clear_pedestal_crate_mask(&mut bus).unwrap();
        assert_eq!(bus.register(addr(MtcReg::PedestalCrateMask)), 0);
    }

    #[test]
    fn every_access_uses_a16() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.enable_pulser(&mut bus).unwrap();
        assert!(bus.transactions().iter().all(|t| match t {
            crate::Transaction::Read { address_modifier, .. }
            | crate::Transaction::Write { address_modifier, .. } => *address_modifier == AM_A16,
        }));
    }

    #[test]
    fn gt_counter_is_shifted_msb_first() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.set_gt_counter(&mut bus, 0x80_0001).unwrap();
        let writes = bus.writes_to(addr(MtcReg::Serial));
        assert_eq!(writes.len(), 2 * GT_ID_BITS as usize + 1);
        assert_eq!(&writes[..2], &[1, 1 | serial::CLOCK]);
        assert_eq!(&writes[2..4], &[0, serial::CLOCK]);
        assert_eq!(&writes[46..48], &[1, 1 | serial::CLOCK]);
        // load enable raised then dropped
        let control = bus.writes_to(addr(MtcReg::Control));
        assert_eq!(control, vec![control::LOAD_ENGT, 0]);
    }

    #[test]
    fn ten_mhz_clock_halves() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.set_ten_mhz_counter(&mut bus, 0x89ab_cdef, 0xff12_3456).unwrap();
        assert_eq!(m.ten_mhz_counter(&mut bus).unwrap(), (0x89ab_cdef, 0x0012_3456));
        assert_eq!(m.ten_mhz_ticks(&mut bus).unwrap(), 0x0012_3456_89ab_cdef);
        assert_eq!(bus.writes_to(addr(MtcReg::Control)), vec![control::LOAD_EN10, 0]);
    }

    #[test]
    fn clock_epoch() {
        assert_eq!(mtc_ticks_at(MTC_EPOCH), 0);
        assert_eq!(mtc_ticks_at(datetime!(1996-01-01 0:00:01 UTC)), 10_000_000);
        assert_eq!(mtc_ticks_at(datetime!(1990-01-01 0:00 UTC)), 0);
    }

    #[test]
    fn pulser_divider_rounds_and_stops() {
        assert_eq!(pulser_divider(0.0), 0);
        assert_eq!(pulser_divider(-3.0), 0);
        assert_eq!(pulser_divider(781_250.0 / 100.0), 99);
        assert_eq!(pulser_divider(1e-6), PULSER_MAX_DIVIDER);
    }

    #[test]
    fn zero_rate_disables_pulser() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.setup_pulser_rate_and_enable(&mut bus, 100.0).unwrap();
        assert_eq!(bus.register(addr(MtcReg::Control)) & control::PULSE_EN, control::PULSE_EN);
        m.set_pulser_rate(&mut bus, 0.0).unwrap();
        assert_eq!(bus.register(addr(MtcReg::Control)) & control::PULSE_EN, 0);
        assert_eq!(bus.register(addr(MtcReg::PulserRate)), 0);
    }

    #[test]
    fn fixed_number_of_pedestals() {
        let mut m = mtc();
        let mut bus = ScriptedBus::new();
        m.fire_pedestals_fixed_number(&mut bus, 5).unwrap();
        assert_eq!(bus.writes_to(addr(MtcReg::SoftGt)).len(), 5);
        assert_eq!(bus.register(addr(MtcReg::Control)) & control::PED_EN, 0);
        assert_eq!(m.session().counters().pedestal_count, 5);
    }

    #[test]
    fn dacs_carry_their_index() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.load_dacs(&mut bus).unwrap();
        let writes = bus.writes_to(addr(MtcReg::DacCount));
        assert_eq!(writes.len(), MTC_THRESHOLD_DACS.len());
        for (i, w) in writes.iter().enumerate() {
            assert_eq!(w >> 12, i as u32);
        }
        let first = DacScale::THRESHOLD_12BIT.millivolts_to_raw(-400.0);
        assert_eq!(writes[0] & 0xfff, first);
    }

    #[test]
    fn xilinx_load_checks_done() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        let err = m.load_xilinx(&mut bus, &[0xa5]).unwrap_err();
        assert!(matches!(err, DaqError::ProgrammingFailed(_)));
        // PROG low, PROG high, then two writes per bit
        assert_eq!(bus.writes_to(addr(MtcReg::Xilinx)).len(), 2 + 16);

        let mut bus = ScriptedBus::new();
        bus.queue_value(addr(MtcReg::Xilinx), xilinx::DONE);
        m.load_xilinx(&mut bus, &[0xa5]).unwrap();
        assert!(m.load_xilinx(&mut bus, &[]).is_err());
    }

    #[test]
    fn catalog_survives_apply_and_verify() {
        let mut m = mtc();
        m.catalog_mut()
            .set("gt_word_mask", ParamValue::Int(0x1234))
            .unwrap();
        m.catalog_mut().set("prescale", ParamValue::Int(3)).unwrap();
        let mut bus = ScriptedBus::new();
        m.initialize(&mut bus, false, false).unwrap();
        assert_eq!(bus.register(addr(MtcReg::GtWordMask)), 0x1234);

        bus.set_register(addr(MtcReg::Lockout), 0);
        assert!(matches!(
            m.verify(&mut bus).unwrap_err(),
            DaqError::VerifyMismatch {
                register: "GtLockReg",
                ..
            }
        ));
    }

    #[test]
    fn basic_ops_respect_access() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.run_basic_op(&mut bus, MtcReg::PulserRate, BasicOp::Write(10), 3, true)
            .unwrap();
        assert_eq!(bus.writes_to(addr(MtcReg::PulserRate)), vec![10, 11, 12]);

        let read = m
            .run_basic_op(&mut bus, MtcReg::PulserRate, BasicOp::Read, 2, false)
            .unwrap();
        assert_eq!(read, vec![12, 12]);

        assert!(m
            .run_basic_op(&mut bus, MtcReg::SoftGt, BasicOp::Read, 4, false)
            .unwrap()
            .is_empty());
        assert_eq!(bus.reads_at(addr(MtcReg::SoftGt)), 0);
    }

    #[test]
    fn thresholds_in_physical_units() {
        let mut m = mtc();
        m.set_nhit_threshold("n100_lo_threshold_mv", 20.0).unwrap();
        assert!((m.nhit_threshold("n100_lo_threshold_mv").unwrap() - 20.0).abs() < 1e-9);
        m.set_esum_threshold_pc("esum_hi_threshold_mv", 50.0).unwrap();
        assert!((m.esum_threshold_pc("esum_hi_threshold_mv").unwrap() - 50.0).abs() < 1e-9);
        assert!(m.nhit_threshold("nope").is_err());
    }

    #[test]
    fn emits_record_when_gt_advances() {
        let mut m = mtc();
        let table = negotiate_data_ids(&[m.descriptor()]).unwrap();
        let mut bus = ScriptedBus::new();
        bus.set_register(addr(MtcReg::GtId), 7);
        let mut sink = Collect::default();
        {
            let bus: &mut dyn BusTransport = &mut bus;
            let mut ctx = RunContext {
                bus,
                run_number: 1,
                data_ids: &table,
            };
            m.on_run_start(&mut ctx).unwrap();
            m.on_take_data(&mut sink, &mut ctx).unwrap();
        }
        assert!(sink.0.is_empty());

        bus.set_register(addr(MtcReg::GtId), 8);
        bus.set_register(addr(MtcReg::Clock10Low), 0x100);
        bus.set_register(addr(MtcReg::Clock10High), 0x2);
        let bus: &mut dyn BusTransport = &mut bus;
        let mut ctx = RunContext {
            bus,
            run_number: 1,
            data_ids: &table,
        };
        m.on_take_data(&mut sink, &mut ctx).unwrap();
        let id = m.data_id();
        assert_eq!(
            sink.0,
            vec![vec![id | 5, m.descriptor().location_mask(), 8, 0x100, 0x2]]
        );
        assert_eq!(m.session().state(), SessionState::Running);

        m.on_run_stop(&mut ctx).unwrap();
        assert_eq!(m.data_id(), 0);
        assert_eq!(m.session().counters().last_gt_id, 0);
    }

    #[test]
    fn unreachable_card_goes_offline() {
        let mut m = mtc();
        let table = negotiate_data_ids(&[m.descriptor()]).unwrap();
        let mut bus = ScriptedBus::new();
        let mut sink = Collect::default();
        {
            let bus: &mut dyn BusTransport = &mut bus;
            let mut ctx = RunContext {
                bus,
                run_number: 2,
                data_ids: &table,
            };
            m.on_run_start(&mut ctx).unwrap();
        }
        bus.fail_always(addr(MtcReg::GtId), -libc::ENODEV);
        let bus: &mut dyn BusTransport = &mut bus;
        let mut ctx = RunContext {
            bus,
            run_number: 2,
            data_ids: &table,
        };
        let err = m.on_take_data(&mut sink, &mut ctx).unwrap_err();
        assert!(matches!(err, DaqError::DeviceOffline { .. }));
    }

    fn run_context<'a>(bus: &'a mut dyn BusTransport, table: &'a crate::DataIdTable) -> RunContext<'a> {
        RunContext {
            bus,
            run_number: 3,
            data_ids: table,
        }
    }

    #[test]
    fn pedestal_run_at_fixed_rate() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        m.fire_pedestals_fixed_rate(&mut bus, 100.0).unwrap();
        let ctl = bus.register(addr(MtcReg::Control));
        assert_eq!(ctl & (control::PED_EN | control::PULSE_EN), control::PED_EN | control::PULSE_EN);
        assert_eq!(bus.register(addr(MtcReg::PulserRate)), pulser_divider(100.0));

        m.stop_pedestals_fixed_rate(&mut bus).unwrap();
        assert_eq!(bus.register(addr(MtcReg::Control)) & (control::PED_EN | control::PULSE_EN), 0);

        assert!(m.fire_pedestals_fixed_rate(&mut bus, 0.0).is_err());
    }

    #[test]
    fn pulser_triggers_are_counted() {
        let mut m = mtc();
        let table = negotiate_data_ids(&[m.descriptor()]).unwrap();
        let mut bus = ScriptedBus::new();
        let mut sink = Collect::default();
        bus.set_register(addr(MtcReg::GtId), 10);
        m.on_run_start(&mut run_context(&mut bus, &table)).unwrap();

        bus.set_register(addr(MtcReg::Control), control::PULSE_EN);
        bus.set_register(addr(MtcReg::GtId), 13);
        m.on_take_data(&mut sink, &mut run_context(&mut bus, &table)).unwrap();
        assert_eq!(m.session().counters().pulser_count, 3);

        bus.set_register(addr(MtcReg::Control), 0);
        bus.set_register(addr(MtcReg::GtId), 15);
        m.on_take_data(&mut sink, &mut run_context(&mut bus, &table)).unwrap();
        assert_eq!(m.session().counters().pulser_count, 3);
        assert_eq!(sink.0.len(), 2);
    }

    #[test]
    fn failed_gt_read_at_run_start_is_not_fatal() {
        let mut m = mtc();
        let table = negotiate_data_ids(&[m.descriptor()]).unwrap();
        let mut bus = ScriptedBus::new();
        bus.queue(addr(MtcReg::GtId), Scripted::Fail(-libc::EIO));
        m.on_run_start(&mut run_context(&mut bus, &table)).unwrap();
        assert_eq!(m.session().state(), SessionState::Armed);

        bus.fail_always(addr(MtcReg::GtId), -libc::ENODEV);
        m.on_run_stop(&mut run_context(&mut bus, &table)).unwrap();
        let err = m.on_run_start(&mut run_context(&mut bus, &table)).unwrap_err();
        assert!(matches!(err, DaqError::DeviceOffline { .. }));
    }

    #[test]
    fn initialize_runs_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("mtc.bit");
        std::fs::write(&image, [0xa5, 0x3c]).unwrap();
        let mut m = mtc();
        m.catalog_mut()
            .set("xilinx_file", ParamValue::Text(image.display().to_string()))
            .unwrap();
        let mut bus = ScriptedBus::new();
        bus.queue_value(addr(MtcReg::Xilinx), xilinx::DONE);
        m.initialize(&mut bus, true, false).unwrap();

        let log = bus.transactions().to_vec();
        let writes_at = |reg: MtcReg| -> Vec<usize> {
            log.iter()
                .enumerate()
                .filter(|(_, t)| matches!(t, Transaction::Write { address, .. } if *address == addr(reg)))
                .map(|(i, _)| i)
                .collect()
        };
        assert!(matches!(
            log[0],
            Transaction::Write { address, value: 0, .. } if address == addr(MtcReg::Control)
        ));
        let xilinx = writes_at(MtcReg::Xilinx);
        let dacs = writes_at(MtcReg::DacCount);
        let lockout = writes_at(MtcReg::Lockout);
        assert_eq!(xilinx.len(), 2 + 2 * 8 * 2);
        assert_eq!(dacs.len(), MTC_THRESHOLD_DACS.len());
        assert_eq!(lockout.len(), 1);
        assert!(xilinx[0] > 0);
        assert!(xilinx.last() < dacs.first());
        assert!(dacs.last() < lockout.first());

        let last_write = log
            .iter()
            .rposition(|t| matches!(t, Transaction::Write { .. }))
            .unwrap();
        let readback = log
            .iter()
            .position(|t| matches!(t, Transaction::Read { address, .. } if *address == addr(MtcReg::Lockout)))
            .unwrap();
        assert!(readback > last_write);
    }

    #[test]
    fn xilinx_load_needs_an_image_path() {
        let m = mtc();
        let mut bus = ScriptedBus::new();
        let err = m.initialize(&mut bus, true, false).unwrap_err();
        assert!(matches!(err, DaqError::ProgrammingFailed(_)));
        assert!(bus.writes_to(addr(MtcReg::Xilinx)).is_empty());
        assert!(bus.writes_to(addr(MtcReg::DacCount)).is_empty());
    }

    #[test]
    fn negative_catalog_integer_is_rejected() {
        let mut m = mtc();
        m.catalog_mut()
            .set("gt_word_mask", ParamValue::Int(-1))
            .unwrap();
        let mut bus = ScriptedBus::new();
        let err = m.apply_catalog(&mut bus).unwrap_err();
        assert!(matches!(err, DaqError::Config(ConfigError::Parse(_))));
        assert!(bus.writes_to(addr(MtcReg::GtWordMask)).is_empty());
    }
}
