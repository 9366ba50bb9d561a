//! rtpp - run one real-time place preference session.
//!
//! This tool:
//! 1. Loads the session configuration (file, environment, flags)
//! 2. Creates the session directory and writes the session header
//! 3. Opens the camera and the trigger output
//! 4. Applies the region calibration
//! 5. Runs habituation, then the tracking loop
//! 6. Writes encoded frames and the location table
//!
//! Ctrl-C ends habituation early, or ends tracking after the current frame.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use rtpp::config::read_calibration_file;
use rtpp::error::hardware_fault;
use rtpp::storage::{
    open_frame_store, write_location_table, SessionDir, SessionHeader, SessionLog,
};
use rtpp::tracking::{habituate, SessionEnd};
use rtpp::ui::Ui;
use rtpp::{
    CameraSource, CancelToken, Calibration, Clock, ContourLocator, CornerRect, FrameEncoder,
    FrameSink, FrameSource, JpegFrameEncoder, PulseGenerator, PulseTiming, RecordingOutput,
    RegionModel, SessionConfig, SessionSchedule, SessionScheduler, Side, SysfsGpioOutput,
    SystemClock, TrackingLoop, TriggerOutput,
};

#[derive(Parser, Debug)]
#[command(name = "rtpp", about = "Closed-loop real-time place preference session")]
struct Args {
    /// Animal ID (names the session directory)
    animal_id: String,

    /// Session config file (.toml or .json)
    #[arg(long, value_name = "PATH", env = "RTPP_CONFIG")]
    config: Option<PathBuf>,

    /// Calibration file with outer, region_a, region_b as [x1, y1, x2, y2]
    #[arg(long, value_name = "PATH")]
    calibration: Option<PathBuf>,

    /// Data directory
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Length of each session in minutes
    #[arg(short = 's', long = "session")]
    session: Option<u32>,

    /// Stimulate the first side only (no alternation)
    #[arg(short = 'n', long = "noalternate")]
    no_alternate: bool,

    /// Habituation time in minutes
    #[arg(short = 'a', long = "adaptation")]
    adaptation: Option<u32>,

    /// Minutes before the first session starts
    #[arg(short = 'b', long = "pre-session")]
    pre_session: Option<u32>,

    /// Break between session 1 and 2 in minutes
    #[arg(short = 'B', long = "breaktime")]
    break_time: Option<u32>,

    /// Frame width in pixels
    #[arg(short = 'x', long = "xresolution")]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(short = 'y', long = "yresolution")]
    height: Option<u32>,

    /// Frame rate (fps)
    #[arg(short = 'f', long = "framerate")]
    framerate: Option<u32>,

    /// Stimulation frequency (Hz)
    #[arg(short = 'z', long = "hz")]
    frequency: Option<u32>,

    /// Pulse length (ms)
    #[arg(short = 'p', long = "pulselength")]
    pulse_length: Option<u32>,

    /// Start stimulation on the left side
    #[arg(short = 'l', long = "left")]
    left: bool,

    /// GPIO pin (BCM) of the trigger line
    #[arg(short = 'i', long = "pin")]
    pin: Option<u32>,

    /// Binarization threshold (0-255)
    #[arg(short = 't', long = "threshold")]
    threshold: Option<u8>,

    /// Camera source (stub://... or a V4L2 device path)
    #[arg(long, value_name = "URL")]
    source: Option<String>,

    /// Write frames during capture instead of after the session
    #[arg(long)]
    streaming: bool,

    /// Record trigger edges in memory instead of driving GPIO
    #[arg(long)]
    dry_run: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

impl Args {
    fn apply(&self, cfg: &mut SessionConfig) -> Result<()> {
        cfg.animal_id = self.animal_id.clone();
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if let Some(source) = &self.source {
            cfg.camera.source = source.clone();
        }
        set(&mut cfg.schedule.session_min, self.session);
        set(&mut cfg.schedule.adaptation_min, self.adaptation);
        set(&mut cfg.schedule.pre_session_min, self.pre_session);
        set(&mut cfg.schedule.break_min, self.break_time);
        set(&mut cfg.camera.width, self.width);
        set(&mut cfg.camera.height, self.height);
        set(&mut cfg.camera.framerate, self.framerate);
        set(&mut cfg.stimulation.frequency_hz, self.frequency);
        set(&mut cfg.stimulation.pulse_length_ms, self.pulse_length);
        set(&mut cfg.stimulation.gpio_pin, self.pin);
        set(&mut cfg.detection.threshold, self.threshold);
        if self.no_alternate {
            cfg.schedule.alternate = false;
        }
        if self.left {
            cfg.stimulation.first_side = Side::Left;
        }
        if self.streaming {
            cfg.recording.mode = rtpp::RecordingMode::Streaming;
        }
        if let Some(path) = &self.calibration {
            cfg.calibration = Some(read_calibration_file(path)?);
        }
        Ok(())
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, false);

    let cfg = SessionConfig::load_with(args.config.as_deref(), |cfg| args.apply(cfg))?;

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel()).context("install Ctrl-C handler")?;

    match run_session(&cfg, &args, &ui, &cancel) {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(fault) = hardware_fault(&err) {
                log::error!("session aborted: {}", fault);
            }
            Err(err)
        }
    }
}

fn run_session(cfg: &SessionConfig, args: &Args, ui: &Ui, cancel: &CancelToken) -> Result<()> {
    let started = chrono::Local::now();
    let timing = PulseTiming::new(cfg.stimulation.pulse_length_ms, cfg.stimulation.frequency_hz)?;

    let (dir, mut session_log) = {
        let _stage = ui.stage("Create session directory");
        let dir = SessionDir::create(&cfg.output_dir, &cfg.animal_id, &started)?;
        let mut session_log = SessionLog::create(&dir.log_path())?;
        session_log.write_header(&SessionHeader::new(cfg, &timing, started.date_naive()))?;
        (dir, session_log)
    };

    let mut source = {
        let _stage = ui.stage("Open camera");
        let mut source = CameraSource::new(cfg.camera.clone())?;
        source.connect()?;
        source
    };

    let output: Box<dyn TriggerOutput> = if args.dry_run || source.is_synthetic() {
        log::warn!("trigger output: recording only, no GPIO is driven");
        Box::new(RecordingOutput::new())
    } else {
        let output = SysfsGpioOutput::open(cfg.stimulation.gpio_pin).map_err(|e| {
            rtpp::ControlError::HardwareFault(format!(
                "gpio{} unavailable: {:#}",
                cfg.stimulation.gpio_pin, e
            ))
        })?;
        Box::new(output)
    };
    let pulse = PulseGenerator::new(timing, output)?;

    let calibration = cfg.calibration.unwrap_or_else(|| {
        log::warn!("no calibration given; splitting the full frame into left and right halves");
        halves(cfg.camera.width, cfg.camera.height)
    });
    let regions = RegionModel::calibrate(
        &calibration,
        cfg.camera.width,
        cfg.camera.height,
        cfg.stimulation.first_side,
    )?;
    session_log.write_calibration(&calibration, &regions)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    {
        let _stage = ui.stage("Habituation");
        habituate(&mut source, clock.as_ref(), cfg.schedule.adaptation(), cancel)?;
    }

    let encoder = Arc::new(JpegFrameEncoder::new(cfg.recording.jpeg_quality));
    let extension = encoder.extension();
    let mut sink = FrameSink::new(encoder, cfg.recording.encoder_threads)?;
    let mut store = open_frame_store(cfg.recording.mode, dir.images(), extension);
    let mut locator = ContourLocator::new(cfg.detection.threshold);
    let scheduler = SessionScheduler::new(SessionSchedule::new(cfg.schedule.durations())?);

    session_log.mark("session start", &chrono::Local::now())?;
    let mut tracker = TrackingLoop::new(
        regions,
        scheduler,
        &pulse,
        &mut sink,
        Arc::clone(&clock),
        cancel.clone(),
    )
    .with_handoff_depth(cfg.recording.handoff_depth);
    let outcome = {
        let _stage = ui.stage("Tracking");
        tracker.run(&mut source, &mut locator, store.as_mut())
    };
    let report = tracker.into_report();
    session_log.mark("session end", &chrono::Local::now())?;
    pulse.force_off()?;

    let summary = {
        let _stage = ui.stage("Save frames");
        store.finish(ui)?
    };
    write_location_table(&dir.location_path(), &report.events)?;
    outcome?;

    let end = match report.end {
        Some(SessionEnd::Completed) => "completed",
        Some(SessionEnd::Cancelled) => "cancelled",
        None => return Err(anyhow!("tracking ended without an outcome")),
    };
    let stats = source.stats();
    println!(
        "{} session {}: {} of {} frames from {} tracked, {} without detection, {} images written ({} gaps) in {}",
        cfg.animal_id,
        end,
        report.events.len(),
        stats.frames_captured,
        stats.source,
        report.detection_failures,
        summary.frames_written,
        summary.gaps.len(),
        dir.root().display()
    );
    Ok(())
}

/// Outer field = whole frame, region A = right half, region B = left half.
fn halves(width: u32, height: u32) -> Calibration {
    let (w, h) = (i64::from(width), i64::from(height));
    Calibration {
        outer: CornerRect::from([0, 0, w, h]),
        region_a: CornerRect::from([w / 2, 0, w - 1, h - 1]),
        region_b: CornerRect::from([0, 0, w / 2 - 1, h - 1]),
    }
}
