//! Binary trigger outputs.
//!
//! - `SysfsGpioOutput`: a Linux GPIO line driven through `/sys/class/gpio`.
//! - `RecordingOutput`: in-memory output that records every level change;
//!   used for dry runs and tests.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// A single binary output line.
pub trait TriggerOutput: Send {
    /// Drive the line high (`true`) or low (`false`).
    fn set_level(&mut self, high: bool) -> Result<()>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

// ----------------------------------------------------------------------------
// sysfs GPIO
// ----------------------------------------------------------------------------

/// GPIO line exported through the legacy sysfs interface (BCM numbering on a
/// Raspberry Pi).
pub struct SysfsGpioOutput {
    pin: u32,
    root: PathBuf,
    value: File,
    exported_here: bool,
}

impl SysfsGpioOutput {
    pub fn open(pin: u32) -> Result<Self> {
        Self::open_at(Path::new(SYSFS_GPIO_ROOT), pin)
    }

    /// Open `pin` under an alternative sysfs root.
    pub fn open_at(root: &Path, pin: u32) -> Result<Self> {
        let line_dir = root.join(format!("gpio{pin}"));
        let mut exported_here = false;
        if !line_dir.exists() {
            write_attr(&root.join("export"), &pin.to_string())
                .with_context(|| format!("export gpio{pin}"))?;
            exported_here = true;
        }
        write_attr(&line_dir.join("direction"), "out")
            .with_context(|| format!("set gpio{pin} direction"))?;
        let value = OpenOptions::new()
            .write(true)
            .open(line_dir.join("value"))
            .with_context(|| format!("open gpio{pin} value"))?;

        let mut output = Self {
            pin,
            root: root.to_path_buf(),
            value,
            exported_here,
        };
        output.set_level(false)?;
        log::info!("trigger output: gpio{} ready (low)", pin);
        Ok(output)
    }
}

impl TriggerOutput for SysfsGpioOutput {
    fn set_level(&mut self, high: bool) -> Result<()> {
        self.value.seek(SeekFrom::Start(0))?;
        self.value
            .write_all(if high { b"1" } else { b"0" })
            .with_context(|| format!("write gpio{} value", self.pin))?;
        self.value.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("gpio{}", self.pin)
    }
}

impl Drop for SysfsGpioOutput {
    fn drop(&mut self) {
        if let Err(e) = self.set_level(false) {
            log::error!("failed to drive gpio{} low on release: {}", self.pin, e);
        }
        if self.exported_here {
            if let Err(e) = write_attr(&self.root.join("unexport"), &self.pin.to_string()) {
                log::warn!("failed to unexport gpio{}: {}", self.pin, e);
            }
        }
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| anyhow!("open {}: {}", path.display(), e))?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Recording output
// ----------------------------------------------------------------------------

/// One level change seen by a `RecordingOutput`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelChange {
    pub at: Instant,
    pub high: bool,
}

#[derive(Default)]
struct RecordingState {
    level: bool,
    changes: Vec<LevelChange>,
    writes: u64,
    fail_after: Option<u64>,
}

/// Output that keeps a log of level changes. Clones share the same log, so a
/// test can keep one handle while the pulse generator owns another.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write after the first `writes` successful ones.
    pub fn failing_after(writes: u64) -> Self {
        let out = Self::default();
        if let Ok(mut state) = out.state.lock() {
            state.fail_after = Some(writes);
        }
        out
    }

    pub fn level(&self) -> bool {
        self.state.lock().map(|s| s.level).unwrap_or(false)
    }

    pub fn changes(&self) -> Vec<LevelChange> {
        self.state
            .lock()
            .map(|s| s.changes.clone())
            .unwrap_or_default()
    }

    pub fn rising_edges(&self) -> usize {
        self.changes().iter().filter(|c| c.high).count()
    }

    /// Total time spent high between `from` and `to`.
    pub fn high_time(&self, from: Instant, to: Instant) -> Duration {
        let changes = self.changes();
        let mut total = Duration::ZERO;
        let mut high_since: Option<Instant> = None;
        for change in changes.iter().filter(|c| c.at <= to) {
            match (change.high, high_since) {
                (true, None) => high_since = Some(change.at.max(from)),
                (false, Some(start)) => {
                    if change.at > from {
                        total += change.at - start;
                    }
                    high_since = None;
                }
                _ => {}
            }
        }
        if let Some(start) = high_since {
            total += to.saturating_duration_since(start);
        }
        total
    }
}

impl TriggerOutput for RecordingOutput {
    fn set_level(&mut self, high: bool) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("recording output lock poisoned"))?;
        if state.fail_after.is_some_and(|limit| state.writes >= limit) {
            return Err(anyhow!("simulated output failure"));
        }
        state.writes += 1;
        if state.level != high {
            state.level = high;
            state.changes.push(LevelChange {
                at: Instant::now(),
                high,
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}
