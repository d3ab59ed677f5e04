use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use t1_sweep::*;

const EVENT_POLL: Duration = Duration::from_millis(100);

/// Sweep the dark time of a three-pulse sequence and record the readout.
#[derive(Parser, Debug)]
#[command(name = "t1_sweep")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of dark times to measure
    #[arg(short = 'n', long)]
    points: Option<usize>,

    /// Longest dark time, in ms
    #[arg(long)]
    max_dark_ms: Option<f64>,

    /// Pulse width, in µs
    #[arg(long)]
    pulse_width: Option<f64>,

    /// Run against the simulated instrument
    #[arg(long)]
    simulate: bool,
}

fn init_logging(conf: &Conf) -> Result<()> {
    let dir = PathBuf::from(&conf.output.output_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating output directory {}", dir.display()))?;
    let log_path = dir.join(&conf.output.log_file);
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, Config::default(), log_file),
    ])?;
    Ok(())
}

/// Set by SIGINT; polled by the event loop.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_interrupt_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        log::warn!("Ctrl-C handler not installed, an interrupted sweep will not reset the instrument");
    }
}

/// Report sweep events until the worker finishes. Cancels the sweep once
/// `interrupted` is raised. Returns the number of points reported.
fn drain_events(handle: &SweepHandle, interrupted: &AtomicBool) -> usize {
    let mut total = 0;
    let mut done = 0;
    let mut cancelled = false;
    loop {
        if !cancelled && interrupted.load(Ordering::SeqCst) {
            log::warn!("Interrupted, stopping the sweep");
            handle.cancel();
            cancelled = true;
        }
        match handle.events().recv_timeout(EVENT_POLL) {
            Ok(SweepEvent::Started { points, frequency }) => {
                total = points;
                log::info!("Sweeping {points} points, pattern frequency {frequency:.3} Hz");
            }
            Ok(SweepEvent::PointDone(record)) => {
                done += 1;
                let dest = record
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "not stored".into());
                log::info!(
                    "Point {}/{}: dark time {} slots, {} samples -> {}",
                    record.index + 1,
                    total,
                    record.dark_time_slots,
                    record.samples,
                    dest
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return done,
        }
    }
}

fn run_sweep<D: Device + 'static>(device: D, conf: &Conf, params: SweepParameters) -> Result<()> {
    let log: Arc<dyn LogSink> = Arc::new(LogFacade);
    let writer = CsvWriter::new(&conf.output.output_dir);
    log::info!("Writing records to {}", writer.dir().display());
    let sink: Arc<dyn SampleSink> = Arc::new(writer);
    let runner = Arc::new(SweepRunner::new(
        device,
        conf.acquisition.clone(),
        log,
        sink,
    ));

    runner.open()?;
    let handle = match runner.spawn(params) {
        Ok(handle) => handle,
        Err(e) => {
            runner.close()?;
            return Err(e.into());
        }
    };

    install_interrupt_handler();
    drain_events(&handle, &INTERRUPTED);

    let result = handle.join();
    // a sweep that failed before reaching the instrument leaves the session open
    runner.close()?;
    let report = result?;
    if report.cancelled {
        log::warn!("Sweep cancelled after {} points", report.points.len());
    } else {
        log::info!("Sweep complete: {} points", report.points.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let conf = Conf::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&conf)?;

    let mut params = conf.sweep_parameters();
    if let Some(n) = args.points {
        params.point_count = n;
    }
    if let Some(ms) = args.max_dark_ms {
        params.max_dark_time_ms = ms;
    }
    if let Some(us) = args.pulse_width {
        params.pulse_width = us;
    }

    if args.simulate {
        return run_sweep(SimulatedDevice::new(), &conf, params);
    }

    #[cfg(feature = "dwf")]
    {
        run_sweep(DwfDevice::default(), &conf, params)
    }
    #[cfg(not(feature = "dwf"))]
    {
        anyhow::bail!("built without the `dwf` feature; pass --simulate or rebuild with --features dwf")
    }
}
