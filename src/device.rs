//! Device identity, capability traits and the run lifecycle contract.
//!
//! A concrete module composes a [`DeviceDescriptor`] with the capabilities it
//! needs: [`Readable`] and [`Writable`] give checked register access relative
//! to the module base, [`DataProducing`] lets the run controller drive it
//! through a run.

use crate::{
    read_checked, write_checked, BusError, BusTransport, ConfigError, DaqError, DaqResult,
    EventBuffer, RecordFormat, Width, AM_A24,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data ids occupy bits 26..30; bit 31 marks short-form records.
pub const DATA_ID_SHIFT: u32 = 26;
pub const DATA_ID_MASK: u32 = 0x7c00_0000;
const MAX_DATA_IDS: u32 = DATA_ID_MASK >> DATA_ID_SHIFT;

fn default_address_modifier() -> u8 {
    AM_A24
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub crate_num: u32,
    pub slot: u32,
    pub base_address: u32,
    #[serde(default = "default_address_modifier")]
    pub address_modifier: u8,
    /// Requested data id; left empty, one is assigned at run start.
    #[serde(default)]
    pub data_id: Option<u32>,
    #[serde(default)]
    pub record_format: RecordFormat,
}

impl DeviceDescriptor {
    pub fn new(name: &str, crate_num: u32, slot: u32, base_address: u32) -> Self {
        Self {
            name: name.to_owned(),
            crate_num,
            slot,
            base_address,
            address_modifier: default_address_modifier(),
            data_id: None,
            record_format: RecordFormat::default(),
        }
    }

    pub fn location_mask(&self) -> u32 {
        crate::location_mask(self.crate_num, self.slot)
    }

    pub fn location(&self) -> (u32, u32) {
        (self.crate_num, self.slot)
    }

    pub fn address(&self, offset: u32) -> u32 {
        self.base_address.wrapping_add(offset)
    }
}

pub trait Device {
    fn descriptor(&self) -> &DeviceDescriptor;
}

pub trait Readable: Device {
    fn read_at(
        &self,
        bus: &mut dyn BusTransport,
        offset: u32,
        width: Width,
    ) -> Result<u32, BusError> {
        let d = self.descriptor();
        read_checked(bus, d.address(offset), d.address_modifier, width)
    }
}

pub trait Writable: Device {
    fn write_at(
        &self,
        bus: &mut dyn BusTransport,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<(), BusError> {
        let d = self.descriptor();
        write_checked(bus, d.address(offset), d.address_modifier, width, value)
    }
}

/// Append-only destination for the buffers a run produces.
pub trait OutputSink {
    fn append(&mut self, buffer: EventBuffer) -> DaqResult<()>;
}

/// What the run controller hands every lifecycle hook.
pub struct RunContext<'a> {
    pub bus: &'a mut dyn BusTransport,
    pub run_number: u32,
    pub data_ids: &'a DataIdTable,
}

/// A module that contributes records to the event stream.
///
/// `on_run_start` is called for every device before the first
/// `on_take_data` of any device; `on_take_data` is called once per poll;
/// `on_run_stop` clears soft state only.
pub trait DataProducing: Device + Send {
    /// Data id in effect for the current run, zero outside a run.
    fn data_id(&self) -> u32;

    fn on_run_start(&mut self, ctx: &mut RunContext<'_>) -> DaqResult<()>;

    fn on_take_data(&mut self, sink: &mut dyn OutputSink, ctx: &mut RunContext<'_>)
        -> DaqResult<()>;

    fn on_run_stop(&mut self, ctx: &mut RunContext<'_>) -> DaqResult<()>;
}

/// Data ids agreed for one run, keyed by crate and slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataIdTable {
    ids: BTreeMap<(u32, u32), (u32, String)>,
}

impl DataIdTable {
    pub fn get(&self, descriptor: &DeviceDescriptor) -> DaqResult<u32> {
        self.ids
            .get(&descriptor.location())
            .map(|(id, _)| *id)
            .ok_or_else(|| DaqError::MissingDataId(descriptor.name.clone()))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Fails if two devices ended up with the same id.
    pub fn check_distinct(&self) -> DaqResult<()> {
        let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
        for (id, name) in self.ids.values() {
            if let Some(first) = seen.insert(*id, name) {
                return Err(DaqError::IdentifierCollision {
                    data_id: *id,
                    first: first.to_owned(),
                    second: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Assign a data id to every cooperating device of a crate.
///
/// Requested ids are honoured first, the remaining devices take the lowest
/// free ids in crate/slot order. The result is checked for collisions before
/// it is returned, so a run can never start with two devices sharing an id.
pub fn negotiate_data_ids(descriptors: &[&DeviceDescriptor]) -> DaqResult<DataIdTable> {
    let mut sorted: Vec<&DeviceDescriptor> = descriptors.to_vec();
    sorted.sort_by_key(|d| d.location());
    for pair in sorted.windows(2) {
        if pair[0].location() == pair[1].location() {
            return Err(DaqError::DuplicateLocation {
                crate_num: pair[0].crate_num,
                slot: pair[0].slot,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }

    let mut table = DataIdTable::default();
    let mut owners: BTreeMap<u32, &str> = BTreeMap::new();
    for d in sorted.iter() {
        let Some(id) = d.data_id else { continue };
        if id == 0 || id & !DATA_ID_MASK != 0 {
            return Err(ConfigError::Parse(format!(
                "{}: data id {id:#010x} is outside {DATA_ID_MASK:#010x}",
                d.name
            ))
            .into());
        }
        if let Some(first) = owners.insert(id, &d.name) {
            return Err(DaqError::IdentifierCollision {
                data_id: id,
                first: first.to_owned(),
                second: d.name.clone(),
            });
        }
        table.ids.insert(d.location(), (id, d.name.clone()));
    }

    let mut next = 1;
    for d in sorted.iter().filter(|d| d.data_id.is_none()) {
        while owners.contains_key(&(next << DATA_ID_SHIFT)) {
            next += 1;
        }
        if next > MAX_DATA_IDS {
            return Err(ConfigError::InvalidIndex {
                index: next as usize,
                len: MAX_DATA_IDS as usize,
            }
            .into());
        }
        let id = next << DATA_ID_SHIFT;
        owners.insert(id, &d.name);
        table.ids.insert(d.location(), (id, d.name.clone()));
    }

    table.check_distinct()?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, slot: u32, data_id: Option<u32>) -> DeviceDescriptor {
        DeviceDescriptor {
            data_id,
            ..DeviceDescriptor::new(name, 0, slot, 0x10000 * slot)
        }
    }

    #[test]
    fn assigns_distinct_ids_in_slot_order() {
        let a = desc("adc5", 5, None);
        let b = desc("adc3", 3, None);
        let c = desc("mtc", 17, Some(1 << DATA_ID_SHIFT));
        let table = negotiate_data_ids(&[&a, &b, &c]).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(&c).unwrap(), 1 << DATA_ID_SHIFT);
        assert_eq!(table.get(&b).unwrap(), 2 << DATA_ID_SHIFT);
        assert_eq!(table.get(&a).unwrap(), 3 << DATA_ID_SHIFT);
        table.check_distinct().unwrap();
    }

    #[test]
    fn requested_collision_is_rejected() {
        let a = desc("adc1", 1, Some(4 << DATA_ID_SHIFT));
        let b = desc("adc2", 2, Some(4 << DATA_ID_SHIFT));
        let err = negotiate_data_ids(&[&a, &b]).unwrap_err();
        assert!(matches!(err, DaqError::IdentifierCollision { .. }));
    }

    #[test]
    fn same_slot_is_rejected() {
        let a = desc("adc1", 1, None);
        let b = desc("other", 1, None);
        assert!(matches!(
            negotiate_data_ids(&[&a, &b]).unwrap_err(),
            DaqError::DuplicateLocation { slot: 1, .. }
        ));
    }

    #[test]
    fn malformed_request_is_rejected() {
        let a = desc("adc1", 1, Some(0x1234));
        assert!(matches!(
            negotiate_data_ids(&[&a]).unwrap_err(),
            DaqError::Config(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unknown_device_has_no_id() {
        let table = negotiate_data_ids(&[]).unwrap();
        assert!(table.is_empty());
        assert!(matches!(
            table.get(&desc("ghost", 9, None)).unwrap_err(),
            DaqError::MissingDataId(_)
        ));
    }

    #[test]
    fn descriptor_addressing() {
        let d = desc("adc2", 2, None);
        assert_eq!(d.address(0x100e), 0x2100e);
        assert_eq!(d.location_mask(), 2 << 16);
    }
}
