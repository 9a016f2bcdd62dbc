//! Round-robin acquisition loop.
//!
//! One [`RunController`] owns the bus of one crate and every device in it,
//! so register sequences issued by control commands are serialised with the
//! readouts: commands are applied only between whole polls.

use crate::{
    create_run_file, negotiate_data_ids, BusTransport, ChannelSink, Counter, DaqError, DaqResult,
    DataIdTable, DataProducing, Device, DeviceDescriptor, Mtc, OutputSink, RunContext, RunWriter,
};
use crossbeam_channel::{tick, unbounded, Receiver, RecvTimeoutError, TryRecvError};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Operator request, applied between polls.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    FirePedestals(u32),
    /// Continuous pedestals at the given rate; 0 ends the pedestal run.
    PedestalRate(f64),
    SetPulserRate(f64),
    SetGtWordMask(u32),
    SetGtCrateMask(u32),
    Stop,
}

/// Parse one line typed at the run prompt.
///
/// `p <n>` fires pedestals, `f <hz>` runs pedestals at a fixed rate (`f 0`
/// stops them), `r <hz>` sets the pulser rate, `m <mask>` and
/// `c <mask>` set the GT word and crate masks, `q` stops the run. Masks may
/// be given in hex with a `0x` prefix.
pub fn parse_command(line: &str) -> Option<ControlCommand> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let arg = parts.next();
    let mask = |s: &str| match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    };
    match cmd {
        "p" => Some(ControlCommand::FirePedestals(arg?.parse().ok()?)),
        "f" => Some(ControlCommand::PedestalRate(arg?.parse().ok()?)),
        "r" => Some(ControlCommand::SetPulserRate(arg?.parse().ok()?)),
        "m" => Some(ControlCommand::SetGtWordMask(mask(arg?)?)),
        "c" => Some(ControlCommand::SetGtCrateMask(mask(arg?)?)),
        "q" => Some(ControlCommand::Stop),
        _ => None,
    }
}

struct Polled<D> {
    device: D,
    online: bool,
}

/// Totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_number: u32,
    pub polls: u64,
    pub commands: u64,
    pub stopped_by_operator: bool,
}

pub struct RunController {
    bus: Box<dyn BusTransport>,
    mtc: Option<Polled<Mtc>>,
    devices: Vec<Polled<Box<dyn DataProducing>>>,
    data_ids: DataIdTable,
    run_number: Option<u32>,
}

/// Run one lifecycle hook, turning an offline report into a flag.
fn poll_device(
    device: &mut dyn DataProducing,
    online: &mut bool,
    sink: &mut dyn OutputSink,
    ctx: &mut RunContext<'_>,
) -> DaqResult<()> {
    match device.on_take_data(sink, ctx) {
        Ok(()) => Ok(()),
        Err(e) if e.is_offline() => {
            warn!(
                "{} (base {:#010x}) is offline, skipping it until reinitialised",
                device.descriptor().name,
                device.descriptor().base_address
            );
            *online = false;
            Ok(())
        }
        Err(e @ DaqError::Io(_)) => Err(e),
        Err(e) => {
            error!("{}: {}", device.descriptor().name, e);
            Ok(())
        }
    }
}

fn start_device(
    device: &mut dyn DataProducing,
    online: &mut bool,
    ctx: &mut RunContext<'_>,
) -> DaqResult<()> {
    match device.on_run_start(ctx) {
        Ok(()) => {
            *online = true;
            Ok(())
        }
        Err(e) if e.is_offline() => {
            warn!("{} is offline at run start", device.descriptor().name);
            *online = false;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn stop_device(device: &mut dyn DataProducing, ctx: &mut RunContext<'_>) {
    if let Err(e) = device.on_run_stop(ctx) {
        warn!("{}: {}", device.descriptor().name, e);
    }
}

impl RunController {
    pub fn new(bus: Box<dyn BusTransport>) -> Self {
        Self {
            bus,
            mtc: None,
            devices: Vec::new(),
            data_ids: DataIdTable::default(),
            run_number: None,
        }
    }

    /// The trigger card is polled first.
    pub fn set_mtc(&mut self, mtc: Mtc) {
        self.mtc = Some(Polled {
            device: mtc,
            online: true,
        });
    }

    pub fn add_device(&mut self, device: Box<dyn DataProducing>) {
        self.devices.push(Polled {
            device,
            online: true,
        });
    }

    pub fn mtc(&self) -> Option<&Mtc> {
        self.mtc.as_ref().map(|p| &p.device)
    }

    pub fn bus(&mut self) -> &mut dyn BusTransport {
        self.bus.as_mut()
    }

    /// Trigger card and bus together, for commands outside a run.
    pub fn mtc_and_bus(&mut self) -> Option<(&mut Mtc, &mut dyn BusTransport)> {
        let mtc = &mut self.mtc.as_mut()?.device;
        Some((mtc, self.bus.as_mut()))
    }

    pub fn run_number(&self) -> Option<u32> {
        self.run_number
    }

    pub fn data_ids(&self) -> &DataIdTable {
        &self.data_ids
    }

    fn descriptors(&self) -> Vec<&DeviceDescriptor> {
        self.mtc
            .iter()
            .map(|p| p.device.descriptor())
            .chain(self.devices.iter().map(|p| p.device.descriptor()))
            .collect()
    }

    /// Names of the devices currently polled, in poll order.
    pub fn online_devices(&self) -> Vec<String> {
        self.mtc
            .iter()
            .filter(|p| p.online)
            .map(|p| p.device.descriptor().name.clone())
            .chain(
                self.devices
                    .iter()
                    .filter(|p| p.online)
                    .map(|p| p.device.descriptor().name.clone()),
            )
            .collect()
    }

    /// Negotiate data ids, then run every `on_run_start` before any poll.
    ///
    /// If a device fails to start, every device is stopped again so the
    /// next attempt begins from idle sessions.
    pub fn start_run(&mut self, run_number: u32) -> DaqResult<()> {
        if let Some(current) = self.run_number {
            warn!("run {} still open, stopping it first", current);
            self.stop_run()?;
        }
        self.data_ids = negotiate_data_ids(&self.descriptors())?;

        let mut ctx = RunContext {
            bus: self.bus.as_mut(),
            run_number,
            data_ids: &self.data_ids,
        };
        let mut started = Ok(());
        if let Some(p) = self.mtc.as_mut() {
            started = start_device(&mut p.device, &mut p.online, &mut ctx);
        }
        for p in self.devices.iter_mut() {
            if started.is_err() {
                break;
            }
            started = start_device(p.device.as_mut(), &mut p.online, &mut ctx);
        }
        if let Err(e) = started {
            error!("run {} could not start: {}", run_number, e);
            if let Some(p) = self.mtc.as_mut() {
                stop_device(&mut p.device, &mut ctx);
            }
            for p in self.devices.iter_mut() {
                stop_device(p.device.as_mut(), &mut ctx);
            }
            self.data_ids = DataIdTable::default();
            return Err(e);
        }
        self.run_number = Some(run_number);
        info!("run {} started with {} data ids", run_number, self.data_ids.len());
        Ok(())
    }

    /// Give every online device one `on_take_data`, in fixed order.
    pub fn poll_once(&mut self, sink: &mut dyn OutputSink) -> DaqResult<usize> {
        let Some(run_number) = self.run_number else {
            return Ok(0);
        };
        let mut ctx = RunContext {
            bus: self.bus.as_mut(),
            run_number,
            data_ids: &self.data_ids,
        };
        let mut polled = 0;
        if let Some(p) = self.mtc.as_mut().filter(|p| p.online) {
            poll_device(&mut p.device, &mut p.online, sink, &mut ctx)?;
            polled += 1;
        }
        for p in self.devices.iter_mut().filter(|p| p.online) {
            poll_device(p.device.as_mut(), &mut p.online, sink, &mut ctx)?;
            polled += 1;
        }
        Ok(polled)
    }

    /// Put an offline device back into the poll rotation.
    pub fn reinitialize(&mut self, name: &str) -> DaqResult<()> {
        if let Some(p) = self.mtc.as_mut().filter(|p| p.device.descriptor().name == name) {
            p.device.initialize(self.bus.as_mut(), false, false)?;
            p.online = true;
            info!("{} reinitialised", name);
            return Ok(());
        }
        let p = self
            .devices
            .iter_mut()
            .find(|p| p.device.descriptor().name == name)
            .ok_or_else(|| crate::ConfigError::UnknownKey(name.to_owned()))?;
        p.online = true;
        info!("{} back online", name);
        Ok(())
    }

    /// Apply one command. Returns false for `Stop`.
    pub fn apply(&mut self, command: &ControlCommand) -> DaqResult<bool> {
        if *command == ControlCommand::Stop {
            return Ok(false);
        }
        let Some((mtc, bus)) = self.mtc_and_bus() else {
            warn!("no trigger card configured, ignoring {:?}", command);
            return Ok(true);
        };
        match *command {
            ControlCommand::FirePedestals(n) => mtc.fire_pedestals_fixed_number(bus, n)?,
            ControlCommand::PedestalRate(hz) if hz > 0.0 => {
                mtc.fire_pedestals_fixed_rate(bus, hz)?
            }
            ControlCommand::PedestalRate(_) => mtc.stop_pedestals_fixed_rate(bus)?,
            ControlCommand::SetPulserRate(hz) => mtc.setup_pulser_rate_and_enable(bus, hz)?,
            ControlCommand::SetGtWordMask(mask) => {
                mtc.clear_global_gt_word_mask(bus)?;
                mtc.set_single_gt_word_mask(bus, mask)?;
            }
            ControlCommand::SetGtCrateMask(mask) => {
                mtc.clear_gt_crate_mask(bus)?;
                mtc.write(bus, crate::MtcReg::GtCrateMask, mask & crate::mtc::CRATE_MASK_ALL)?;
            }
            ControlCommand::Stop => {}
        }
        info!("applied {:?}", command);
        Ok(true)
    }

    /// Poll on every tick until `duration` elapses or a `Stop` arrives.
    pub fn run(
        &mut self,
        sink: &mut dyn OutputSink,
        commands: &Receiver<ControlCommand>,
        poll_interval: Duration,
        duration: Duration,
    ) -> DaqResult<RunSummary> {
        let ticker = tick(poll_interval);
        let t_begin = Instant::now();
        let mut summary = RunSummary {
            run_number: self.run_number.unwrap_or_default(),
            ..Default::default()
        };
        'run: loop {
            let _ = ticker.recv();

            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        summary.commands += 1;
                        match self.apply(&command) {
                            Ok(true) => {}
                            Ok(false) => {
                                summary.stopped_by_operator = true;
                                break 'run;
                            }
                            Err(e) => error!("{:?} failed: {}", command, e),
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            self.poll_once(sink)?;
            summary.polls += 1;

            if t_begin.elapsed() >= duration {
                break;
            }
        }
        Ok(summary)
    }

    /// Clear the soft state of every device, online or not.
    pub fn stop_run(&mut self) -> DaqResult<()> {
        let Some(run_number) = self.run_number.take() else {
            return Ok(());
        };
        let mut ctx = RunContext {
            bus: self.bus.as_mut(),
            run_number,
            data_ids: &self.data_ids,
        };
        if let Some(p) = self.mtc.as_mut() {
            stop_device(&mut p.device, &mut ctx);
        }
        for p in self.devices.iter_mut() {
            stop_device(p.device.as_mut(), &mut ctx);
        }
        self.data_ids = DataIdTable::default();
        info!("run {} stopped", run_number);
        Ok(())
    }

    /// Take one complete run into the next run file of the campaign.
    pub fn record_run(
        &mut self,
        output_dir: &Path,
        campaign_num: usize,
        write_buffer_words: usize,
        commands: &Receiver<ControlCommand>,
        poll_interval: Duration,
        duration: Duration,
    ) -> DaqResult<(RunSummary, Counter)> {
        let (path, run_number) = create_run_file(output_dir, campaign_num)?;
        let start_time = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
        let writer = RunWriter::create(&path, run_number, start_time, write_buffer_words)?;
        info!("writing run {} to {}", run_number, path.display());

        let (tx, rx) = unbounded();
        let writer_handle = spawn_writer(writer, rx);
        let mut sink = ChannelSink::new(tx);

        self.start_run(run_number)?;
        let result = self.run(&mut sink, commands, poll_interval, duration);
        self.stop_run()?;
        drop(sink);

        let counter = writer_handle
            .join()
            .map_err(|_| writer_gone(&path))??;
        let summary = result?;
        info!(
            "run {}: {} polls, {} buffers, {} words",
            run_number, summary.polls, counter.n_buffers, counter.total_words
        );
        Ok((summary, counter))
    }
}

fn writer_gone(path: &Path) -> DaqError {
    DaqError::Io(std::io::Error::other(format!(
        "writer thread for {} panicked",
        path.display()
    )))
}

/// Drain buffers into `writer` until every sender is dropped.
pub fn spawn_writer(mut writer: RunWriter, rx: Receiver<Vec<u32>>) -> JoinHandle<DaqResult<Counter>> {
    thread::spawn(move || -> DaqResult<Counter> {
        let mut counter = Counter::new();
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(words) => {
                    counter.increment(words.len());
                    writer.append_words(&words)?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    writer.flush()?;
                    break;
                }
            }
        }
        Ok(counter)
    })
}

/// Where `record_run` would put the next run.
pub fn next_run_path(output_dir: &Path, campaign_num: usize) -> DaqResult<PathBuf> {
    Ok(create_run_file(output_dir, campaign_num)?.0)
}
