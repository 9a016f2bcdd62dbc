//! Conversions between raw DAC counts and engineering units.
//!
//! Every function is an exact linear map over its explicit parameters. The
//! only non-linearity is the rounding and clamping into the raw DAC range.

use serde::{Deserialize, Serialize};

/// Linear DAC transfer function: `full_scale` counts span `min_mv..=max_mv`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DacScale {
    pub min_mv: f64,
    pub max_mv: f64,
    pub full_scale: u32,
}

impl DacScale {
    /// 12-bit trigger threshold DACs, bipolar 5 V.
    pub const THRESHOLD_12BIT: DacScale = DacScale {
        min_mv: -5000.0,
        max_mv: 5000.0,
        full_scale: 4095,
    };

    /// Millivolts per raw count.
    pub fn lsb_mv(&self) -> f64 {
        (self.max_mv - self.min_mv) / self.full_scale as f64
    }

    pub fn millivolts_to_raw(&self, mv: f64) -> u32 {
        let mv = mv.clamp(self.min_mv, self.max_mv);
        ((mv - self.min_mv) / self.lsb_mv()).round() as u32
    }

    pub fn raw_to_millivolts(&self, raw: u32) -> f64 {
        self.min_mv + raw.min(self.full_scale) as f64 * self.lsb_mv()
    }
}

impl Default for DacScale {
    fn default() -> Self {
        Self::THRESHOLD_12BIT
    }
}

pub fn millivolts_to_hit_count(mv: f64, dc_offset: f64, mv_per_hit: f64) -> f64 {
    (mv - dc_offset) / mv_per_hit
}

pub fn hit_count_to_millivolts(hits: f64, dc_offset: f64, mv_per_hit: f64) -> f64 {
    dc_offset + hits * mv_per_hit
}

pub fn hit_count_to_raw(scale: &DacScale, hits: f64, dc_offset: f64, mv_per_hit: f64) -> u32 {
    scale.millivolts_to_raw(hit_count_to_millivolts(hits, dc_offset, mv_per_hit))
}

/// Charge in picocoulombs.
pub fn millivolts_to_charge(mv: f64, dc_offset: f64, mv_per_pc: f64) -> f64 {
    (mv - dc_offset) / mv_per_pc
}

pub fn charge_to_millivolts(pc: f64, dc_offset: f64, mv_per_pc: f64) -> f64 {
    dc_offset + pc * mv_per_pc
}

pub fn charge_to_raw(scale: &DacScale, pc: f64, dc_offset: f64, mv_per_pc: f64) -> u32 {
    scale.millivolts_to_raw(charge_to_millivolts(pc, dc_offset, mv_per_pc))
}
