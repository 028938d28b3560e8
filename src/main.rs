use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{app_from_crate, arg, ArgMatches};

use kflash::event::EventTracer;
use kflash::jobstatus::{JobPhase, JobStatus, JobStatusObserver, RunningState};
use kflash::{Engine, Firmware, SerialTransport};

const INITIAL_BAUD: u32 = 115_200;
const MIN_BAUD: u32 = 110;

/// Logs each phase transition and terminal status at `info`/`error`.
struct ProgressLogger;

impl JobStatusObserver for ProgressLogger {
    fn current_job_changed(&self, phase: JobPhase) {
        log::info!("starting {phase:?}");
    }

    fn status_changed(&self, phase: JobPhase, status: JobStatus) {
        match status.running_state {
            RunningState::Finished => log::info!("{phase:?} done"),
            RunningState::Error => log::error!("{phase:?} failed"),
            RunningState::Running | RunningState::NotStarted => {}
        }
    }
}

fn arguments() -> ArgMatches {
    app_from_crate!()
        .arg(
            arg!(-d --device <DEVICE> "Serial device the target is attached to")
                .required(true),
        )
        .arg(
            arg!(-b --baudrate <BAUD> "Baud rate to flash at")
                .required(false)
                .default_value("2000000"),
        )
        .arg(arg!(-t --trace "Trace SLIP/packet traffic to stderr").required(false))
        .arg(
            arg!(-s --bootloader <PATH> "Path to the ISP flash bootloader blob")
                .required(true),
        )
        .arg(arg!(<FIRMWARE> "Path to a .bin or .kfpkg firmware image"))
        .get_matches()
}

fn run() -> Result<()> {
    let args = arguments();

    let device = args.value_of("device").expect("required by clap");
    let baud: u32 = u32::from_str(args.value_of("baudrate").unwrap())
        .context("--baudrate must be an integer")?;
    if baud < MIN_BAUD {
        anyhow::bail!("--baudrate must be at least {MIN_BAUD}");
    }
    let firmware_path = PathBuf::from(args.value_of("FIRMWARE").expect("required by clap"));
    let bootloader_path = PathBuf::from(args.value_of("bootloader").expect("required by clap"));

    let firmware = Firmware::load(&firmware_path)
        .with_context(|| format!("failed to load firmware from {}", firmware_path.display()))?;
    let bootloader = std::fs::read(&bootloader_path)
        .with_context(|| format!("failed to read bootloader from {}", bootloader_path.display()))?;

    let transport = SerialTransport::open(device, INITIAL_BAUD)
        .with_context(|| format!("failed to open {device}"))?;

    let mut engine = Engine::new(Box::new(transport), None);
    if args.is_present("trace") {
        engine.add_event_observer(EventTracer::new(std::io::stderr(), |_| true));
    }
    engine.add_status_observer(std::rc::Rc::new(ProgressLogger) as std::rc::Rc<dyn JobStatusObserver>);

    engine
        .run(&bootloader, baud, &firmware, None)
        .context("flashing failed")?;

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
