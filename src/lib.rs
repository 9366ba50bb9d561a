//! Real-time place preference (RTPP) controller.
//!
//! This crate tracks an animal in a live camera stream and drives a pulsed
//! trigger line (e.g. a laser or LED driver on a GPIO pin) whenever the animal
//! is inside the stimulation region selected by a time-phased schedule.
//!
//! # Architecture
//!
//! Per frame, on a single control thread:
//!
//! 1. **Capture** a frame from a `FrameSource`.
//! 2. **Advance** the `SessionScheduler` by elapsed session time.
//! 3. **Hand off** a copy to the `FrameSink` for asynchronous compression.
//! 4. **Crop** to the calibrated outer field and **locate** the target.
//! 5. **Decide** whether the `PulseGenerator` runs, and **record** a `TrackResult`.
//!
//! The pulse train and frame compression run on their own threads; the
//! control thread never waits for either except at the bounded frame handoff.
//!
//! # Module Structure
//!
//! - `frame`: RGB24 frame container and cropping
//! - `ingest`: frame sources (synthetic `stub://`, V4L2)
//! - `detect`: target locator (threshold, contours, moments)
//! - `region`: calibration, regions, side ordering
//! - `schedule`: session phases and directives
//! - `pulse`: pulse timing and trigger outputs
//! - `sink`: order-preserving compression pipeline
//! - `tracking`: the control loop, event log and habituation
//! - `storage`: session directory, logs and frame stores
//! - `config`: session configuration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pulse;
pub mod region;
pub mod schedule;
pub mod sink;
pub mod storage;
pub mod tracking;
pub mod ui;

pub use config::{RecordingMode, SessionConfig};
pub use detect::{ContourLocator, Detection, LocatorBackend, NotFoundReason, Position};
pub use error::ControlError;
pub use frame::RawFrame;
pub use ingest::{CameraConfig, CameraSource, FrameSource, SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::V4l2Source;
pub use pulse::{
    PulseGenerator, PulseTiming, RecordingOutput, SysfsGpioOutput, TriggerOutput,
};
pub use region::{Calibration, CornerRect, Region, RegionModel, RegionOrder, Side};
pub use schedule::{Directive, SessionSchedule, SessionScheduler};
pub use sink::{EncodedFrame, FrameEncoder, FrameSink, JpegFrameEncoder};
pub use storage::{FrameStore, SessionDir, SessionLog};
pub use tracking::{habituate, EventLog, Membership, SessionReport, TrackResult, TrackingLoop};

/// Monotonic time source for the control loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Operator cancel request, shared between a signal handler and the loop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the request and report whether one was pending.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
