use crate::{Caen965, Caen965Layout, DeviceDescriptor, Mtc, SimSettings};
use confique::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub bus_settings: BusSettings,
    #[config(nested)]
    pub trigger_settings: TriggerSettings,
    #[config(default = [])]
    pub adcs: Vec<AdcSettings>,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    pub output_dir: String,
    /// Seconds per run.
    #[config(default = 10)]
    pub run_duration: u64,
    #[config(default = 10)]
    pub poll_interval_ms: u64,
    #[config(default = 0)]
    pub campaign_num: usize,
    #[config(default = 4096)]
    pub write_buffer_words: usize,
    #[config(default = "info")]
    pub log_level: String,
}

/// Settings of the simulated crate.
#[derive(Config, Debug, Clone)]
pub struct BusSettings {
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = 0.0)]
    pub fault_rate: f64,
    #[config(default = 0.2)]
    pub event_rate: f64,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerSettings {
    #[config(default = true)]
    pub enabled: bool,
    #[config(default = "mtc")]
    pub name: String,
    #[config(default = 0)]
    pub crate_num: u32,
    #[config(default = 17)]
    pub slot: u32,
    /// A16 base, 0x7000.
    #[config(default = 28672)]
    pub base_address: u32,
    pub data_id: Option<u32>,
    /// Saved parameter catalogue restored at initialisation.
    pub catalog_file: Option<String>,
    pub xilinx_file: Option<String>,
    #[config(default = false)]
    pub load_xilinx: bool,
    #[config(default = true)]
    pub load_10mhz_clock: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AdcSettings {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    #[serde(flatten)]
    pub layout: Caen965Layout,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.run_settings.output_dir)
    }

    pub fn sim_settings(&self) -> SimSettings {
        SimSettings {
            seed: self.bus_settings.seed,
            fault_rate: self.bus_settings.fault_rate,
            event_rate: self.bus_settings.event_rate,
        }
    }

    pub fn adc_cards(&self) -> Vec<Caen965> {
        self.adcs
            .iter()
            .map(|a| Caen965::new(a.descriptor.clone(), a.layout.clone()))
            .collect()
    }
}

impl TriggerSettings {
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            data_id: self.data_id,
            ..DeviceDescriptor::new(&self.name, self.crate_num, self.slot, self.base_address)
        }
    }

    /// The trigger card with its catalogue restored, if one is enabled.
    pub fn build(&self) -> crate::DaqResult<Option<Mtc>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut mtc = Mtc::new(self.descriptor());
        if let Some(file) = &self.catalog_file {
            mtc.load_settings(Path::new(file))?;
        }
        if let Some(file) = &self.xilinx_file {
            mtc.catalog_mut()
                .set("xilinx_file", crate::ParamValue::Text(file.clone()))?;
        }
        Ok(Some(mtc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, RecordFormat, AM_A24};

    const CONFIG: &str = r#"
adcs = [
    { name = "qdc0", crate_num = 0, slot = 5, base_address = 0x00500000 },
    { name = "qdc1", crate_num = 0, slot = 6, base_address = 0x00600000, record_format = "Short", enabled_mask = 3, data_id = 0x10000000 },
]

[run_settings]
output_dir = "/tmp/vme"
campaign_num = 4

[bus_settings]
seed = 42

[trigger_settings]
slot = 18
"#;

    #[test]
    fn loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let conf = Conf::load(&path).unwrap();

        assert_eq!(conf.run_settings.poll_interval_ms, 10);
        assert_eq!(conf.run_settings.write_buffer_words, 4096);
        assert_eq!(conf.run_settings.campaign_num, 4);
        assert_eq!(conf.sim_settings().seed, 42);
        assert_eq!(conf.sim_settings().event_rate, 0.2);

        let mtc = conf.trigger_settings.build().unwrap().unwrap();
        assert_eq!(mtc.descriptor().slot, 18);
        assert_eq!(mtc.descriptor().base_address, 0x7000);

        let cards = conf.adc_cards();
        assert_eq!(cards.len(), 2);
        let first = cards[0].descriptor();
        assert_eq!(first.address_modifier, AM_A24);
        assert_eq!(first.record_format, RecordFormat::Long);
        assert_eq!(cards[0].layout(), &Caen965Layout::default());

        let second = &conf.adcs[1];
        assert_eq!(second.descriptor.record_format, RecordFormat::Short);
        assert_eq!(second.descriptor.data_id, Some(0x1000_0000));
        assert_eq!(second.layout.enabled_mask, 3);
        assert_eq!(second.layout.data_offset, 0x1000);
    }

    #[test]
    fn output_dir_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.toml");
        std::fs::write(&path, "[bus_settings]\nseed = 1\n").unwrap();
        assert!(Conf::load(&path).is_err());
    }
}
