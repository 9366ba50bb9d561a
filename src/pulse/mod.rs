//! Pulse-train generation on a binary trigger output.
//!
//! `PulseGenerator` owns a background timing thread. While active, the thread
//! toggles the output between high (`on` time) and low (`off` time) using
//! chained deadlines, so the train keeps its phase no matter how slowly the
//! tracking loop runs. Turning the generator off drives the output low in the
//! caller's thread before `set_active(false)` returns.

mod output;

pub use output::{LevelChange, RecordingOutput, SysfsGpioOutput, TriggerOutput};

use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ControlError;

/// On/off durations of one pulse period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseTiming {
    on: Duration,
    off: Duration,
    requested_on: Duration,
    frequency_hz: u32,
}

impl PulseTiming {
    /// `on = min(pulse_length, period / 2)`, `off = period - on`, in whole
    /// nanoseconds.
    pub fn new(pulse_length_ms: u32, frequency_hz: u32) -> Result<Self> {
        if frequency_hz == 0 {
            return Err(anyhow!("pulse frequency must be greater than zero"));
        }
        if pulse_length_ms == 0 {
            return Err(anyhow!("pulse length must be at least 1 ms"));
        }
        let period = Duration::from_nanos(1_000_000_000 / u64::from(frequency_hz));
        let requested = Duration::from_millis(u64::from(pulse_length_ms));
        let on = requested.min(period / 2);
        let timing = Self {
            on,
            off: period - on,
            requested_on: requested,
            frequency_hz,
        };
        if timing.is_clamped() {
            log::warn!(
                "pulse length {} ms exceeds half the period at {} Hz; using {:.1} ms",
                pulse_length_ms,
                frequency_hz,
                timing.on.as_secs_f64() * 1000.0
            );
        }
        Ok(timing)
    }

    pub fn on(&self) -> Duration {
        self.on
    }

    pub fn off(&self) -> Duration {
        self.off
    }

    pub fn period(&self) -> Duration {
        self.on + self.off
    }

    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    /// True when the requested pulse length was shortened to fit the period.
    pub fn is_clamped(&self) -> bool {
        self.on < self.requested_on
    }
}

struct PulseState {
    active: bool,
    shutdown: bool,
    trains_started: u64,
    output: Box<dyn TriggerOutput>,
    level: bool,
    fault: Option<String>,
}

impl PulseState {
    fn drive(&mut self, high: bool) -> Result<()> {
        match self.output.set_level(high) {
            Ok(()) => {
                self.level = high;
                Ok(())
            }
            Err(e) => {
                let msg = format!("{}: {:#}", self.output.describe(), e);
                log::error!("trigger output fault: {}", msg);
                self.fault = Some(msg.clone());
                self.active = false;
                Err(ControlError::HardwareFault(msg).into())
            }
        }
    }
}

struct Shared {
    state: Mutex<PulseState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PulseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives a `TriggerOutput` with a fixed-duty pulse train while active.
///
/// `set_active(true)` while already active leaves the running train alone.
/// Output faults are sticky: once a write fails, every later call returns
/// `ControlError::HardwareFault`.
pub struct PulseGenerator {
    shared: Arc<Shared>,
    timing: PulseTiming,
    description: String,
    worker: Option<JoinHandle<()>>,
}

impl PulseGenerator {
    pub fn new(timing: PulseTiming, output: Box<dyn TriggerOutput>) -> Result<Self> {
        let description = output.describe();
        let mut state = PulseState {
            active: false,
            shutdown: false,
            trains_started: 0,
            output,
            level: true,
            fault: None,
        };
        state.drive(false)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("rtpp-pulse".to_string())
            .spawn(move || run_worker(&worker_shared, timing))
            .context("spawn pulse timing thread")?;

        log::info!(
            "pulse generator on {}: {:.1} ms on / {:.1} ms off ({} Hz)",
            description,
            timing.on.as_secs_f64() * 1000.0,
            timing.off.as_secs_f64() * 1000.0,
            timing.frequency_hz
        );
        Ok(Self {
            shared,
            timing,
            description,
            worker: Some(worker),
        })
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// Number of off-to-on transitions accepted so far.
    pub fn trains_started(&self) -> u64 {
        self.shared.lock().trains_started
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(fault) = &state.fault {
            return Err(ControlError::HardwareFault(fault.clone()).into());
        }
        if active {
            if !state.active {
                state.active = true;
                state.trains_started += 1;
                self.shared.wake.notify_all();
            }
            return Ok(());
        }

        let was_active = state.active;
        state.active = false;
        if was_active || state.level {
            state.drive(false)?;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Stop any train and drive the output low, even after a fault.
    pub fn force_off(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.active = false;
        self.shared.wake.notify_all();
        state
            .output
            .set_level(false)
            .with_context(|| format!("force {} low", self.description))?;
        state.level = false;
        Ok(())
    }
}

impl Drop for PulseGenerator {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.active = false;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("pulse timing thread panicked");
            }
        }
        if let Err(e) = self.shared.lock().output.set_level(false) {
            log::error!("failed to drive {} low on shutdown: {}", self.description, e);
        }
    }
}

fn run_worker(shared: &Shared, timing: PulseTiming) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        if !state.active || state.fault.is_some() {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        // One train: runs until deactivated, faulted, or shut down.
        let train = state.trains_started;
        let mut high = false;
        let mut deadline = Instant::now();
        while state.active
            && !state.shutdown
            && state.fault.is_none()
            && state.trains_started == train
        {
            let now = Instant::now();
            if now < deadline {
                state = shared
                    .wake
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }
            high = !high;
            if state.drive(high).is_err() {
                break;
            }
            deadline += if high { timing.on } else { timing.off };
            // Resync after a stall longer than a full period instead of
            // replaying the missed edges.
            if now.saturating_duration_since(deadline) > timing.period() {
                deadline = now;
            }
        }
    }
}
