use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Sender};
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs::{self, File},
    io::{stdin, BufRead},
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::Duration,
};
use time::macros::format_description;
use vme_daq::*;

#[derive(Parser)]
#[command(name = "vme_daq", about = "VME crate readout", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take runs until the run count is reached or `q` is typed
    Run {
        #[arg(short, long, default_value = "daq.toml")]
        config: PathBuf,
        /// Number of runs, 0 keeps going until stopped
        #[arg(long, default_value_t = 1)]
        runs: u32,
    },
    /// Initialise the trigger card and dump its registers
    Init {
        #[arg(short, long, default_value = "daq.toml")]
        config: PathBuf,
    },
    /// Dump registers, GT id and clock of the trigger card
    Status {
        #[arg(short, long, default_value = "daq.toml")]
        config: PathBuf,
    },
    /// Write the default trigger card catalogue
    Catalog {
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn init_logging(conf: &Conf) -> Result<()> {
    let level = LevelFilter::from_str(&conf.run_settings.log_level)
        .with_context(|| format!("bad log_level '{}'", conf.run_settings.log_level))?;
    let output_dir = conf.output_dir();
    fs::create_dir_all(&output_dir)?;
    let log_config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    CombinedLogger::init(vec![
        TermLogger::new(
            level,
            log_config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Debug,
            log_config,
            File::options()
                .create(true)
                .append(true)
                .open(output_dir.join("vme_daq.log"))?,
        ),
    ])?;
    Ok(())
}

fn load(path: &Path) -> Result<Conf> {
    let conf = Conf::load(path).with_context(|| format!("loading {}", path.display()))?;
    init_logging(&conf)?;
    Ok(conf)
}

fn build_controller(conf: &Conf) -> Result<RunController> {
    let mut sim = SimulatedCrate::new(conf.sim_settings());
    let mtc = conf.trigger_settings.build()?;
    if let Some(mtc) = &mtc {
        sim.add_mtc(mtc.descriptor().base_address);
    }
    let cards = conf.adc_cards();
    for card in &cards {
        sim.add_adc(card.descriptor().base_address, card.layout().clone());
    }

    let mut controller = RunController::new(Box::new(sim));
    if let Some(mtc) = mtc {
        controller.set_mtc(mtc);
    }
    for card in cards {
        info!(
            "{} in crate {} slot {}",
            card.descriptor().name,
            card.descriptor().crate_num,
            card.descriptor().slot
        );
        controller.add_device(Box::new(card));
    }
    Ok(controller)
}

fn initialize_trigger(controller: &mut RunController, conf: &Conf) -> Result<()> {
    if let Some((mtc, bus)) = controller.mtc_and_bus() {
        mtc.initialize(
            bus,
            conf.trigger_settings.load_xilinx,
            conf.trigger_settings.load_10mhz_clock,
        )?;
    }
    Ok(())
}

fn spawn_command_reader(tx: Sender<ControlCommand>) {
    thread::spawn(move || {
        for line in stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => error!("unknown command '{}'", line.trim()),
            }
        }
    });
}

fn run(config: &Path, runs: u32) -> Result<()> {
    let conf = load(config)?;
    let mut controller = build_controller(&conf)?;
    initialize_trigger(&mut controller, &conf)?;

    println!("#################################");
    println!("Commands supported:");
    println!("\t[p N]\tfire N pedestals");
    println!("\t[f HZ]\tpedestals at a fixed rate, 0 stops");
    println!("\t[r HZ]\tset pulser rate");
    println!("\t[m MASK]\tset GT word mask");
    println!("\t[c MASK]\tset GT crate mask");
    println!("\t[q]\tstop");
    println!("#################################");

    let (tx, rx) = unbounded();
    spawn_command_reader(tx);

    let settings = &conf.run_settings;
    let mut taken = 0;
    loop {
        let (summary, counter) = controller.record_run(
            &conf.output_dir(),
            settings.campaign_num,
            settings.write_buffer_words,
            &rx,
            Duration::from_millis(settings.poll_interval_ms),
            Duration::from_secs(settings.run_duration),
        )?;
        info!(
            "run {} average rate {:.1} words/s",
            summary.run_number,
            counter.average_rate()
        );
        taken += 1;
        if summary.stopped_by_operator || (runs > 0 && taken >= runs) {
            break;
        }
    }
    info!("{} run(s) taken", taken);
    Ok(())
}

fn status(config: &Path, initialize: bool) -> Result<()> {
    let conf = load(config)?;
    let mut controller = build_controller(&conf)?;
    if initialize {
        initialize_trigger(&mut controller, &conf)?;
    }
    let Some((mtc, bus)) = controller.mtc_and_bus() else {
        println!("no trigger card configured");
        return Ok(());
    };
    mtc.report_status(bus);
    let gt = mtc.gt_id(bus)?;
    let seconds = mtc.ten_mhz_seconds(bus)?;
    println!("GT id:\t{gt:#08x}");
    println!("10 MHz clock (s):\t{seconds:.3}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, runs } => run(&config, runs),
        Command::Init { config } => status(&config, true),
        Command::Status { config } => status(&config, false),
        Command::Catalog { output } => {
            let mtc = Mtc::new(DeviceDescriptor::new("mtc", 0, 17, 0x7000));
            mtc.save_settings(&output)?;
            println!("wrote {}", output.display());
            Ok(())
        }
    }
}
