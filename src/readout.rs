//! Polled readout of a four-channel charge ADC.
//!
//! One call to [`Caen965::readout`] walks the enabled channels, then drains
//! at most one block from the shared output FIFO. Nothing is carried from
//! one call to the next; a failing channel only costs its own record, and a
//! misframed block is rolled back and the FIFO flushed so the next event
//! starts aligned.

use crate::{
    read_checked, shift_and_extract, AcquisitionSession, BusError, BusTransport, DaqError,
    DaqResult, DataProducing, Device, DeviceDescriptor, EventBuffer, OutputSink, Readable,
    RunContext, Width, WordTag,
};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

/// Channel status: a conversion is waiting in the channel data register.
pub const CHANNEL_READY: u32 = 0x8000;
/// Global status: the output FIFO holds at least one block.
pub const BLOCK_READY: u32 = 0x0001;
/// Channel numbers are packed into four bits.
pub const MAX_CHANNELS: u32 = 16;

fn default_status_offset() -> u32 {
    0x1080
}

fn default_data_offset() -> u32 {
    0x1000
}

fn default_global_status_offset() -> u32 {
    0x100e
}

fn default_num_channels() -> u32 {
    4
}

fn default_enabled_mask() -> u32 {
    0xf
}

/// Register layout of the card, relative to its base address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caen965Layout {
    /// Status register of channel 0; channel `n` sits at `+ 4 * n`.
    #[serde(default = "default_status_offset")]
    pub status_offset: u32,
    /// Data register of channel 0; channel `n` sits at `+ 4 * n`.
    #[serde(default = "default_data_offset")]
    pub data_offset: u32,
    #[serde(default = "default_global_status_offset")]
    pub global_status_offset: u32,
    #[serde(default)]
    pub fifo_offset: u32,
    #[serde(default = "default_num_channels")]
    pub num_channels: u32,
    #[serde(default = "default_enabled_mask")]
    pub enabled_mask: u32,
}

impl Default for Caen965Layout {
    fn default() -> Self {
        Self {
            status_offset: default_status_offset(),
            data_offset: default_data_offset(),
            global_status_offset: default_global_status_offset(),
            fifo_offset: 0,
            num_channels: default_num_channels(),
            enabled_mask: default_enabled_mask(),
        }
    }
}

/// Tags that frame a FIFO block, and the flush bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingTags {
    pub header: WordTag,
    pub data: WordTag,
    pub end_of_block: WordTag,
    /// The FIFO answers with this tag once it is empty.
    pub flush_terminator: WordTag,
    pub flush_limit: usize,
}

impl Default for FramingTags {
    fn default() -> Self {
        Self {
            header: WordTag::Header,
            data: WordTag::Data,
            end_of_block: WordTag::EndOfBlock,
            flush_terminator: WordTag::NotValid,
            flush_limit: 0x7fc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadoutFault {
    Bus {
        operation: &'static str,
        channel: Option<u32>,
        error: BusError,
    },
    Framing {
        address: u32,
        expected: WordTag,
        /// `None` when the read itself failed.
        found: Option<u32>,
    },
    Overrun {
        reserved: usize,
    },
}

/// What one readout call did. Every fault listed here was also logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadoutReport {
    pub channel_records: usize,
    pub block_words: usize,
    pub faults: Vec<ReadoutFault>,
    pub flushes: usize,
    /// The transport reported the module unreachable.
    pub offline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub reads: usize,
    pub errors: usize,
    pub terminated: bool,
}

#[derive(Debug, Clone)]
pub struct Caen965 {
    descriptor: DeviceDescriptor,
    layout: Caen965Layout,
    framing: FramingTags,
    data_id: u32,
    session: AcquisitionSession,
}

impl Device for Caen965 {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl Readable for Caen965 {}

impl Caen965 {
    pub fn new(descriptor: DeviceDescriptor, layout: Caen965Layout) -> Self {
        let mut layout = layout;
        layout.num_channels = layout.num_channels.min(MAX_CHANNELS);
        Self {
            descriptor,
            layout,
            framing: FramingTags::default(),
            data_id: 0,
            session: AcquisitionSession::new(),
        }
    }

    pub fn with_framing(mut self, framing: FramingTags) -> Self {
        self.framing = framing;
        self
    }

    pub fn layout(&self) -> &Caen965Layout {
        &self.layout
    }

    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    /// Use `data_id` outside of the run lifecycle, e.g. for bench tests.
    pub fn set_data_id(&mut self, data_id: u32) {
        self.data_id = data_id;
    }

    fn fifo_address(&self) -> u32 {
        self.descriptor.address(self.layout.fifo_offset)
    }

    /// Read everything the card has ready into `buffer`.
    ///
    /// Always completes; problems are logged and listed in the report.
    pub fn readout(&self, bus: &mut dyn BusTransport, buffer: &mut EventBuffer) -> ReadoutReport {
        let mut report = ReadoutReport::default();
        let words_per_record = self.descriptor.record_format.words_per_record();
        buffer.ensure_capacity(self.layout.num_channels as usize * words_per_record);

        if let Err(e) = self.read_channels(bus, buffer, &mut report) {
            self.overrun(&mut report, e);
        }

        let committed = buffer.data_index();
        if let Err(e) = self.read_block(bus, buffer, &mut report) {
            buffer.truncate_to(committed);
            self.overrun(&mut report, e);
        }
        report
    }

    fn read_channels(
        &self,
        bus: &mut dyn BusTransport,
        buffer: &mut EventBuffer,
        report: &mut ReadoutReport,
    ) -> DaqResult<()> {
        let location = self.descriptor.location_mask();
        for chan in 0..self.layout.num_channels {
            if self.layout.enabled_mask & (1 << chan) == 0 {
                continue;
            }
            let status = match self.read_at(bus, self.layout.status_offset + chan * 4, Width::Word) {
                Ok(status) => status,
                Err(e) => {
                    self.bus_fault(report, "channel status", Some(chan), e);
                    continue;
                }
            };
            if status & CHANNEL_READY == 0 {
                continue;
            }
            let value = match self.read_at(bus, self.layout.data_offset + chan * 4, Width::Word) {
                Ok(value) => value,
                Err(e) => {
                    self.bus_fault(report, "channel data", Some(chan), e);
                    continue;
                }
            };
            buffer.append_channel_record(
                self.descriptor.record_format,
                self.data_id,
                location,
                chan,
                value,
            )?;
            report.channel_records += 1;
        }
        Ok(())
    }

    fn read_block(
        &self,
        bus: &mut dyn BusTransport,
        buffer: &mut EventBuffer,
        report: &mut ReadoutReport,
    ) -> DaqResult<()> {
        let status = match self.read_at(bus, self.layout.global_status_offset, Width::Word) {
            Ok(status) => status,
            Err(e) => {
                self.bus_fault(report, "block status", None, e);
                return Ok(());
            }
        };
        if status & BLOCK_READY == 0 {
            return Ok(());
        }

        let fifo = self.fifo_address();
        let am = self.descriptor.address_modifier;
        let header = match read_checked(bus, fifo, am, Width::Long) {
            Ok(header) => header,
            Err(e) => {
                self.bus_fault(report, "block header", None, e);
                return Ok(());
            }
        };
        if !self.framing.header.matches(header) {
            self.framing_fault(report, self.framing.header, Some(header));
            return Ok(());
        }

        let count = shift_and_extract(header, 8, 0x3f) as usize;
        if count == 0 {
            return Ok(());
        }

        // The end-of-block word is checked but not shipped.
        buffer.ensure_capacity(count + 2);
        let rollback = buffer.data_index();
        buffer.append(self.data_id | (count as u32 + 2))?;
        buffer.append(self.descriptor.location_mask())?;

        for _ in 0..count {
            match read_checked(bus, fifo, am, Width::Long) {
                Ok(word) if self.framing.data.matches(word) => {
                    buffer.append(word)?;
                }
                Ok(word) => {
                    debug!(
                        "{}: payload drain stopped on word {:#010x}",
                        self.descriptor.name, word
                    );
                    break;
                }
                Err(e) => {
                    self.bus_fault(report, "block payload", None, e);
                    break;
                }
            }
        }

        match read_checked(bus, fifo, am, Width::Long) {
            Ok(word) if self.framing.end_of_block.matches(word) => {
                report.block_words += buffer.data_index() - rollback;
            }
            other => {
                let found = match other {
                    Ok(word) => Some(word),
                    Err(e) => {
                        self.bus_fault(report, "block terminator", None, e);
                        None
                    }
                };
                self.framing_fault(report, self.framing.end_of_block, found);
                buffer.truncate_to(rollback);
                self.flush_fifo(bus);
                report.flushes += 1;
            }
        }
        Ok(())
    }

    /// Discard FIFO words until it reports empty, at most `flush_limit` reads.
    ///
    /// Produces no output. If the terminator never shows up the next
    /// readout's header check catches the misalignment.
    pub fn flush_fifo(&self, bus: &mut dyn BusTransport) -> FlushOutcome {
        let fifo = self.fifo_address();
        let am = self.descriptor.address_modifier;
        let mut outcome = FlushOutcome {
            reads: 0,
            errors: 0,
            terminated: false,
        };
        while outcome.reads < self.framing.flush_limit {
            outcome.reads += 1;
            match read_checked(bus, fifo, am, Width::Long) {
                Ok(word) if self.framing.flush_terminator.matches(word) => {
                    outcome.terminated = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => outcome.errors += 1,
            }
        }
        if outcome.errors > 0 {
            warn!(
                "{}: {} of {} flush reads at {:#010x} failed",
                self.descriptor.name, outcome.errors, outcome.reads, fifo
            );
        }
        if !outcome.terminated {
            warn!(
                "{}: FIFO flush gave up after {} reads",
                self.descriptor.name, outcome.reads
            );
        }
        outcome
    }

    fn bus_fault(
        &self,
        report: &mut ReadoutReport,
        operation: &'static str,
        channel: Option<u32>,
        error: BusError,
    ) {
        match channel {
            Some(chan) => warn!(
                "{} (base {:#010x}): {} read failed on channel {}: {}",
                self.descriptor.name, self.descriptor.base_address, operation, chan, error
            ),
            None => warn!(
                "{} (base {:#010x}): {} read failed: {}",
                self.descriptor.name, self.descriptor.base_address, operation, error
            ),
        }
        if error.is_unreachable() {
            report.offline = true;
        }
        report.faults.push(ReadoutFault::Bus {
            operation,
            channel,
            error,
        });
    }

    fn framing_fault(&self, report: &mut ReadoutReport, expected: WordTag, found: Option<u32>) {
        let address = self.fifo_address();
        match found {
            Some(word) => error!(
                "{}",
                DaqError::Framing {
                    device: self.descriptor.name.clone(),
                    address,
                    expected,
                    found: word,
                }
            ),
            None => error!(
                "{}: {:?} word at {:#010x} could not be read",
                self.descriptor.name, expected, address
            ),
        }
        report.faults.push(ReadoutFault::Framing {
            address,
            expected,
            found,
        });
    }

    fn overrun(&self, report: &mut ReadoutReport, e: DaqError) {
        error!("{}: {}", self.descriptor.name, e);
        let reserved = match e {
            DaqError::BufferOverrun { reserved } => reserved,
            _ => 0,
        };
        report.faults.push(ReadoutFault::Overrun { reserved });
    }
}

impl DataProducing for Caen965 {
    fn data_id(&self) -> u32 {
        self.data_id
    }

    fn on_run_start(&mut self, ctx: &mut RunContext<'_>) -> DaqResult<()> {
        self.data_id = ctx.data_ids.get(&self.descriptor)?;
        self.session.arm()?;
        debug!(
            "{}: run {} data id {:#010x}",
            self.descriptor.name, ctx.run_number, self.data_id
        );
        Ok(())
    }

    fn on_take_data(
        &mut self,
        sink: &mut dyn OutputSink,
        ctx: &mut RunContext<'_>,
    ) -> DaqResult<()> {
        self.session.begin_taking()?;
        self.session.counters_mut().polls += 1;
        let mut buffer = EventBuffer::new();
        let report = self.readout(ctx.bus, &mut buffer);
        if !buffer.is_empty() {
            sink.append(buffer)?;
        }
        if report.offline {
            return Err(DaqError::DeviceOffline {
                device: self.descriptor.name.clone(),
            });
        }
        Ok(())
    }

    fn on_run_stop(&mut self, _ctx: &mut RunContext<'_>) -> DaqResult<()> {
        self.data_id = 0;
        self.session.stop()
    }
}
