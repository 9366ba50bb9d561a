//! Session persistence.
//!
//! Layout of one session:
//!
//! ```text
//! <output_dir>/<animal>-<YYYYmmddHHMM>/
//!     log.txt         header, calibration, start/end timestamps
//!     location.tsv    one row per tracked frame
//!     images/<seq>.jpg
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::{RecordingMode, SessionConfig};
use crate::pulse::PulseTiming;
use crate::region::{Calibration, Region, RegionModel};
use crate::sink::EncodedFrame;
use crate::tracking::{EventLog, TSV_HEADER};
use crate::ui::Ui;

pub struct SessionDir {
    root: PathBuf,
    images: PathBuf,
}

impl SessionDir {
    pub fn name_for(animal_id: &str, started: &DateTime<Local>) -> String {
        format!("{}-{}", animal_id, started.format("%Y%m%d%H%M"))
    }

    pub fn create(output_dir: &Path, animal_id: &str, started: &DateTime<Local>) -> Result<Self> {
        let root = output_dir.join(Self::name_for(animal_id, started));
        let images = root.join("images");
        std::fs::create_dir_all(&images)
            .with_context(|| format!("create session directory {}", images.display()))?;
        log::info!("session directory: {}", root.display());
        Ok(Self { root, images })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images(&self) -> &Path {
        &self.images
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    pub fn location_path(&self) -> PathBuf {
        self.root.join("location.tsv")
    }
}

fn image_path(images: &Path, seq: u64, extension: &str) -> PathBuf {
    images.join(format!("{seq}.{extension}"))
}

/// Everything the session header in `log.txt` reports.
#[derive(Clone, Debug)]
pub struct SessionHeader {
    pub animal_id: String,
    pub date: NaiveDate,
    pub adaptation_min: u32,
    pub pre_session_min: u32,
    pub session_min: u32,
    pub alternate: bool,
    pub break_min: u32,
    pub first_side: &'static str,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub pulse_on_ms: f64,
    pub pulse_clamped: bool,
    pub frequency_hz: u32,
}

impl SessionHeader {
    pub fn new(cfg: &SessionConfig, timing: &PulseTiming, date: NaiveDate) -> Self {
        Self {
            animal_id: cfg.animal_id.clone(),
            date,
            adaptation_min: cfg.schedule.adaptation_min,
            pre_session_min: cfg.schedule.pre_session_min,
            session_min: cfg.schedule.session_min,
            alternate: cfg.schedule.alternate,
            break_min: cfg.schedule.break_min,
            first_side: cfg.stimulation.first_side.as_str(),
            width: cfg.camera.width,
            height: cfg.camera.height,
            framerate: cfg.camera.framerate,
            pulse_on_ms: timing.on().as_micros() as f64 / 1000.0,
            pulse_clamped: timing.is_clamped(),
            frequency_hz: timing.frequency_hz(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("animal ID: {}", self.animal_id),
            format!("session date: {}", self.date.format("%Y-%m-%d")),
            format!("adaptation time: {} min", self.adaptation_min),
            format!("pre_session: {} min", self.pre_session_min),
            format!("session length: {} min", self.session_min),
        ];
        if self.alternate {
            lines.push(format!(
                "activated alternately, first side: {}",
                self.first_side
            ));
            lines.push(format!("break between sessions: {} min", self.break_min));
        } else {
            lines.push(format!("activated side: {}", self.first_side));
        }
        lines.push(format!("video resolution: {} x {}", self.width, self.height));
        lines.push(format!("video frame rate: {} fps", self.framerate));
        let mut pulse = format!("stimulation pulse length: {} ms", self.pulse_on_ms);
        if self.pulse_clamped {
            pulse.push_str(" (adjusted by stimulation frequency)");
        }
        lines.push(pulse);
        lines.push(format!("stimulation frequency: {} Hz", self.frequency_hz));
        lines
    }
}

/// Append-only `log.txt`. Every line is mirrored to the log facade.
pub struct SessionLog {
    out: File,
}

impl SessionLog {
    pub fn create(path: &Path) -> Result<Self> {
        let out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create session log {}", path.display()))?;
        Ok(Self { out })
    }

    pub fn record(&mut self, line: &str) -> Result<()> {
        log::info!("{}", line);
        writeln!(self.out, "{}", line).context("write session log")?;
        self.out.flush().context("flush session log")
    }

    pub fn write_header(&mut self, header: &SessionHeader) -> Result<()> {
        for line in header.lines() {
            self.record(&line)?;
        }
        Ok(())
    }

    pub fn write_calibration(&mut self, raw: &Calibration, model: &RegionModel) -> Result<()> {
        self.record(&format!("outer field: {}", raw.outer))?;
        self.record(&format!("region A: {}", raw.region_a))?;
        self.record(&format!("region B: {}", raw.region_b))?;
        let order = model.order();
        self.record(&format!("adjusted primary region: {}", describe(&order.primary)))?;
        self.record(&format!(
            "adjusted secondary region: {}",
            describe(&order.secondary)
        ))
    }

    pub fn mark(&mut self, label: &str, at: &DateTime<Local>) -> Result<()> {
        self.record(&format!("{}: {}", label, at.format("%Y-%m-%d %H:%M:%S%.3f")))
    }
}

fn describe(region: &Region) -> String {
    format!(
        "({}, {}) x ({}, {})",
        region.xmin(),
        region.ymin(),
        region.xmax(),
        region.ymax()
    )
}

/// Write the per-frame event table.
pub fn write_location_table(path: &Path, events: &EventLog) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create location table {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{}", TSV_HEADER)?;
    for record in events.records() {
        writeln!(out, "{}", record.tsv_row())?;
    }
    out.flush()
        .with_context(|| format!("write location table {}", path.display()))?;
    log::info!(
        "location table: {} rows -> {}",
        events.len(),
        path.display()
    );
    Ok(())
}

/// What a frame store wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Sequence numbers that never produced an encoded frame.
    pub gaps: Vec<u64>,
}

/// Destination for encoded frames, fed in capture order.
pub trait FrameStore {
    fn store(&mut self, frame: EncodedFrame) -> Result<()>;

    fn record_gap(&mut self, seq: u64);

    /// Flush anything held back and report what was written.
    fn finish(&mut self, ui: &Ui) -> Result<StoreSummary>;
}

/// Keeps every frame in memory and writes them all in `finish`.
pub struct BufferedFrameStore {
    images: PathBuf,
    extension: &'static str,
    frames: Vec<EncodedFrame>,
    gaps: Vec<u64>,
}

impl BufferedFrameStore {
    pub fn new(images: &Path, extension: &'static str) -> Self {
        Self {
            images: images.to_path_buf(),
            extension,
            frames: Vec::new(),
            gaps: Vec::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.frames.len()
    }
}

impl FrameStore for BufferedFrameStore {
    fn store(&mut self, frame: EncodedFrame) -> Result<()> {
        self.frames.push(frame);
        Ok(())
    }

    fn record_gap(&mut self, seq: u64) {
        self.gaps.push(seq);
    }

    fn finish(&mut self, ui: &Ui) -> Result<StoreSummary> {
        let frames = std::mem::take(&mut self.frames);
        let progress = ui.progress("saving frames", frames.len() as u64);
        let mut summary = StoreSummary {
            gaps: std::mem::take(&mut self.gaps),
            ..StoreSummary::default()
        };
        for frame in frames {
            let path = image_path(&self.images, frame.seq, self.extension);
            std::fs::write(&path, &frame.bytes)
                .with_context(|| format!("write frame {}", path.display()))?;
            summary.frames_written += 1;
            summary.bytes_written += frame.bytes.len() as u64;
            progress.inc();
        }
        progress.finish();
        Ok(summary)
    }
}

/// Writes each frame to disk as soon as it arrives.
pub struct StreamingFrameStore {
    images: PathBuf,
    extension: &'static str,
    summary: StoreSummary,
}

impl StreamingFrameStore {
    pub fn new(images: &Path, extension: &'static str) -> Self {
        Self {
            images: images.to_path_buf(),
            extension,
            summary: StoreSummary::default(),
        }
    }
}

impl FrameStore for StreamingFrameStore {
    fn store(&mut self, frame: EncodedFrame) -> Result<()> {
        let path = image_path(&self.images, frame.seq, self.extension);
        std::fs::write(&path, &frame.bytes)
            .with_context(|| format!("write frame {}", path.display()))?;
        self.summary.frames_written += 1;
        self.summary.bytes_written += frame.bytes.len() as u64;
        Ok(())
    }

    fn record_gap(&mut self, seq: u64) {
        self.summary.gaps.push(seq);
    }

    fn finish(&mut self, _ui: &Ui) -> Result<StoreSummary> {
        Ok(std::mem::take(&mut self.summary))
    }
}

pub fn open_frame_store(
    mode: RecordingMode,
    images: &Path,
    extension: &'static str,
) -> Box<dyn FrameStore> {
    match mode {
        RecordingMode::Buffered => Box::new(BufferedFrameStore::new(images, extension)),
        RecordingMode::Streaming => Box::new(StreamingFrameStore::new(images, extension)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 5, 9, 7, 30)
            .single()
            .expect("unambiguous local time")
    }

    fn frame(seq: u64) -> EncodedFrame {
        EncodedFrame {
            seq,
            bytes: vec![seq as u8; 4],
        }
    }

    #[test]
    fn session_dir_is_named_by_animal_and_minute() -> Result<()> {
        let out = tempfile::tempdir()?;
        let dir = SessionDir::create(out.path(), "m12", &started())?;
        assert_eq!(dir.root(), out.path().join("m12-202403050907"));
        assert!(dir.images().is_dir());
        assert_eq!(dir.location_path(), dir.root().join("location.tsv"));
        Ok(())
    }

    #[test]
    fn header_reports_clamped_pulse() -> Result<()> {
        let cfg = SessionConfig {
            animal_id: "m3".to_string(),
            ..SessionConfig::default()
        };
        let timing = PulseTiming::new(40, 20)?;
        let header = SessionHeader::new(&cfg, &timing, started().date_naive());
        let lines = header.lines();
        assert_eq!(lines[0], "animal ID: m3");
        assert_eq!(lines[1], "session date: 2024-03-05");
        assert!(lines.iter().any(|l| l == "break between sessions: 0 min"));
        assert!(lines
            .iter()
            .any(|l| l == "stimulation pulse length: 25 ms (adjusted by stimulation frequency)"));
        Ok(())
    }

    #[test]
    fn session_log_appends_lines() -> Result<()> {
        let out = tempfile::tempdir()?;
        let path = out.path().join("log.txt");
        let mut log = SessionLog::create(&path)?;
        log.record("animal ID: m1")?;
        log.mark("session start", &started())?;
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(
            text,
            "animal ID: m1\nsession start: 2024-03-05 09:07:30.000\n"
        );
        Ok(())
    }

    #[test]
    fn buffered_store_writes_on_finish() -> Result<()> {
        let out = tempfile::tempdir()?;
        let mut store = BufferedFrameStore::new(out.path(), "jpg");
        store.store(frame(1))?;
        store.record_gap(2);
        store.store(frame(3))?;
        assert_eq!(store.buffered(), 2);
        assert!(!out.path().join("1.jpg").exists());

        let summary = store.finish(&Ui::quiet())?;
        assert_eq!(summary.frames_written, 2);
        assert_eq!(summary.bytes_written, 8);
        assert_eq!(summary.gaps, vec![2]);
        assert_eq!(std::fs::read(out.path().join("3.jpg"))?, vec![3u8; 4]);
        assert!(!out.path().join("2.jpg").exists());
        Ok(())
    }

    #[test]
    fn streaming_store_writes_immediately() -> Result<()> {
        let out = tempfile::tempdir()?;
        let mut store = open_frame_store(RecordingMode::Streaming, out.path(), "jpg");
        store.store(frame(7))?;
        assert!(out.path().join("7.jpg").exists());
        let summary = store.finish(&Ui::quiet())?;
        assert_eq!(summary.frames_written, 1);
        assert!(summary.gaps.is_empty());
        Ok(())
    }
}
