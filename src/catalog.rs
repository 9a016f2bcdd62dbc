//! Typed parameter database of a device.
//!
//! The set of names, their order and their types are declared statically;
//! only values change at run time. Files are flat TOML tables and are
//! validated completely before any value is applied.

use crate::{ConfigError, DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
        }
    }
}

/// Declared default; const-constructible so catalogues can be statics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamDefault {
    Int(i64),
    Float(f64),
    Text(&'static str),
}

impl From<ParamDefault> for ParamValue {
    fn from(value: ParamDefault) -> Self {
        match value {
            ParamDefault::Int(v) => ParamValue::Int(v),
            ParamDefault::Float(v) => ParamValue::Float(v),
            ParamDefault::Text(v) => ParamValue::Text(v.to_owned()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: ParamDefault,
}

const fn int(name: &'static str, v: i64) -> ParamSpec {
    ParamSpec {
        name,
        default: ParamDefault::Int(v),
    }
}

const fn float(name: &'static str, v: f64) -> ParamSpec {
    ParamSpec {
        name,
        default: ParamDefault::Float(v),
    }
}

const fn text(name: &'static str, v: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        default: ParamDefault::Text(v),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterCatalog {
    specs: &'static [ParamSpec],
    values: Vec<ParamValue>,
}

impl ParameterCatalog {
    pub fn new(specs: &'static [ParamSpec]) -> Self {
        Self {
            specs,
            values: specs.iter().map(|s| s.default.into()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn check_index(&self, index: usize) -> Result<(), ConfigError> {
        if index < self.specs.len() {
            Ok(())
        } else {
            Err(ConfigError::InvalidIndex {
                index,
                len: self.specs.len(),
            })
        }
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ConfigError> {
        self.specs
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownKey(name.to_owned()))
    }

    pub fn name_of(&self, index: usize) -> Result<&'static str, ConfigError> {
        self.check_index(index)?;
        Ok(self.specs[index].name)
    }

    pub fn default_of(&self, index: usize) -> Result<ParamValue, ConfigError> {
        self.check_index(index)?;
        Ok(self.specs[index].default.into())
    }

    pub fn get_index(&self, index: usize) -> Result<&ParamValue, ConfigError> {
        self.check_index(index)?;
        Ok(&self.values[index])
    }

    pub fn get(&self, name: &str) -> Result<&ParamValue, ConfigError> {
        self.get_index(self.index_of(name)?)
    }

    pub fn set_index(&mut self, index: usize, value: ParamValue) -> Result<(), ConfigError> {
        self.check_index(index)?;
        let current = &self.values[index];
        if std::mem::discriminant(current) != std::mem::discriminant(&value) {
            return Err(ConfigError::TypeMismatch {
                key: self.specs[index].name.to_owned(),
                expected: current.kind(),
                found: value.kind(),
            });
        }
        self.values[index] = value;
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        self.set_index(self.index_of(name)?, value)
    }

    pub fn int(&self, name: &str) -> Result<i64, ConfigError> {
        match self.get(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, ConfigError> {
        match self.get(name)? {
            ParamValue::Float(v) => Ok(*v),
            other => Err(mismatch(name, "float", other)),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, ConfigError> {
        match self.get(name)? {
            ParamValue::Text(v) => Ok(v),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn reset_to_defaults(&mut self) {
        self.values = self.specs.iter().map(|s| s.default.into()).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ParamValue)> {
        self.specs.iter().map(|s| s.name).zip(self.values.iter())
    }

    pub fn to_toml_string(&self) -> DaqResult<String> {
        let table: BTreeMap<&str, &ParamValue> = self.iter().collect();
        Ok(toml::to_string(&table)?)
    }

    /// Apply a TOML table. Every entry is checked first so a bad file leaves
    /// the catalogue untouched; names missing from the file keep their value.
    pub fn load_toml_str(&mut self, contents: &str) -> Result<(), ConfigError> {
        let table: BTreeMap<String, ParamValue> =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut staged = self.clone();
        for (name, value) in table {
            staged.set(&name, value)?;
        }
        *self = staged;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> DaqResult<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> DaqResult<()> {
        let contents = fs::read_to_string(path)?;
        self.load_toml_str(&contents).map_err(DaqError::from)
    }
}

fn mismatch(name: &str, expected: &'static str, found: &ParamValue) -> ConfigError {
    ConfigError::TypeMismatch {
        key: name.to_owned(),
        expected,
        found: found.kind(),
    }
}

/// Trigger threshold DACs in load order.
pub const MTC_THRESHOLD_DACS: [&str; 10] = [
    "n100_lo_threshold_mv",
    "n100_med_threshold_mv",
    "n100_hi_threshold_mv",
    "n20_threshold_mv",
    "n20_lb_threshold_mv",
    "esum_lo_threshold_mv",
    "esum_hi_threshold_mv",
    "owln_threshold_mv",
    "owle_lo_threshold_mv",
    "owle_hi_threshold_mv",
];

pub static MTC_PARAMETERS: [ParamSpec; 25] = [
    int("lockout_width_ns", 420),
    int("pedestal_width_ns", 50),
    int("coarse_delay_ns", 150),
    float("fine_delay_ns", 0.0),
    int("prescale", 1),
    float("pulser_rate_hz", 10.0),
    int("pulser_enabled", 0),
    int("gt_word_mask", 0),
    int("gt_crate_mask", 0),
    int("pedestal_crate_mask", 0),
    float("nhit_dc_offset_mv", -500.0),
    float("nhit_mv_per_hit", 10.0),
    float("esum_dc_offset_mv", -500.0),
    float("esum_mv_per_pc", 2.0),
    float("n100_lo_threshold_mv", -400.0),
    float("n100_med_threshold_mv", -300.0),
    float("n100_hi_threshold_mv", -200.0),
    float("n20_threshold_mv", -300.0),
    float("n20_lb_threshold_mv", -350.0),
    float("esum_lo_threshold_mv", -400.0),
    float("esum_hi_threshold_mv", -100.0),
    float("owln_threshold_mv", -450.0),
    float("owle_lo_threshold_mv", -450.0),
    float("owle_hi_threshold_mv", -150.0),
    text("xilinx_file", ""),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ParameterCatalog {
        ParameterCatalog::new(&MTC_PARAMETERS)
    }

    #[test]
    fn threshold_dacs_are_declared() {
        let cat = catalog();
        for name in MTC_THRESHOLD_DACS {
            assert!(cat.float(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn access_by_name_and_index() {
        let mut cat = catalog();
        assert_eq!(cat.int("lockout_width_ns").unwrap(), 420);
        cat.set("lockout_width_ns", ParamValue::Int(600)).unwrap();
        assert_eq!(cat.get_index(0).unwrap(), &ParamValue::Int(600));
        assert_eq!(cat.default_of(0).unwrap(), ParamValue::Int(420));
        assert_eq!(cat.name_of(5).unwrap(), "pulser_rate_hz");

        assert_eq!(
            cat.get("missing").unwrap_err(),
            ConfigError::UnknownKey("missing".into())
        );
        assert_eq!(
            cat.get_index(cat.len()).unwrap_err(),
            ConfigError::InvalidIndex {
                index: cat.len(),
                len: cat.len()
            }
        );
        assert!(cat.set_index(100, ParamValue::Int(1)).is_err());
    }

    #[test]
    fn values_keep_their_declared_type() {
        let mut cat = catalog();
        let err = cat
            .set("pulser_rate_hz", ParamValue::Text("fast".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { expected: "float", .. }));
        assert!(cat.int("pulser_rate_hz").is_err());
        assert_eq!(cat.float("pulser_rate_hz").unwrap(), 10.0);
    }

    #[test]
    fn toml_round_trip_reproduces_values() {
        let mut cat = catalog();
        cat.set("gt_word_mask", ParamValue::Int(0x3ffffff)).unwrap();
        cat.set("fine_delay_ns", ParamValue::Float(1.3)).unwrap();
        cat.set("xilinx_file", ParamValue::Text("/opt/mtc/xilinx.bit".into()))
            .unwrap();
        let saved = cat.to_toml_string().unwrap();

        let mut restored = catalog();
        restored.load_toml_str(&saved).unwrap();
        assert_eq!(restored, cat);
    }

    #[test]
    fn bad_file_leaves_catalog_untouched() {
        let mut cat = catalog();
        let err = cat
            .load_toml_str("prescale = 4\nno_such_thing = 1\n")
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey("no_such_thing".into()));
        assert_eq!(cat.int("prescale").unwrap(), 1);

        assert!(cat.load_toml_str("prescale = 2.5\n").is_err());
        assert!(matches!(
            cat.load_toml_str("prescale = [").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtc.toml");
        let mut cat = catalog();
        cat.set("prescale", ParamValue::Int(7)).unwrap();
        cat.save(&path).unwrap();

        let mut other = catalog();
        other.load(&path).unwrap();
        assert_eq!(other.int("prescale").unwrap(), 7);
    }
}
