//! Closed-loop tracking.
//!
//! One thread runs the whole per-frame pipeline:
//!
//! ```text
//! capture -> phase advance -> submit to sink -> crop -> locate
//!         -> membership -> directive -> pulse decision -> record
//!         -> handoff (retrieve encoded frames) -> cancel poll
//! ```
//!
//! The pulse train and frame compression run on their own threads. Every
//! frame that is processed appends exactly one `TrackResult`; the frame on
//! which the schedule reaches its end is not processed. The trigger is forced
//! low on every exit path.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{Detection, LocatorBackend, NotFoundReason, Position};
use crate::error::ControlError;
use crate::ingest::FrameSource;
use crate::pulse::PulseGenerator;
use crate::region::RegionModel;
use crate::schedule::{Directive, PhaseChange, SessionScheduler};
use crate::sink::FrameSink;
use crate::storage::FrameStore;
use crate::{CancelToken, Clock};

pub const TSV_HEADER: &str = "phase\tx\ty\tin_primary_region\tpulse_state\telapsed_seconds";

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Whether the target was inside the primary region on a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    Inside,
    Outside,
    /// No detection on this frame.
    Unknown,
}

impl Membership {
    fn tsv(self) -> &'static str {
        match self {
            Membership::Inside => "1",
            Membership::Outside => "0",
            Membership::Unknown => "nan",
        }
    }
}

/// One frame's decision and outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackResult {
    pub frame_seq: u64,
    pub phase: usize,
    pub detection: Detection,
    pub in_primary: Membership,
    /// Whether the pulse train was running after this frame's decision.
    pub stimulation: bool,
    pub elapsed: Duration,
}

impl TrackResult {
    pub fn position(&self) -> Option<Position> {
        self.detection.position()
    }

    pub fn tsv_row(&self) -> String {
        let (x, y) = match self.position() {
            Some(pos) => (pos.x.to_string(), pos.y.to_string()),
            None => ("nan".to_string(), "nan".to_string()),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{:.3}",
            self.phase,
            x,
            y,
            self.in_primary.tsv(),
            u8::from(self.stimulation),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Append-only, capture-ordered sequence of `TrackResult`s.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    records: Vec<TrackResult>,
}

impl EventLog {
    fn push(&mut self, record: TrackResult) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TrackResult] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The schedule ran to its last boundary.
    Completed,
    /// The cancel token was observed.
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct SessionReport {
    pub events: EventLog,
    /// Phase changes into a running phase; reaching the end is `end`.
    pub transitions: Vec<PhaseChange>,
    pub end: Option<SessionEnd>,
    pub detection_failures: u64,
    /// Frames whose compression failed.
    pub gaps: Vec<u64>,
    pub frames_stored: u64,
    pub elapsed: Duration,
}

pub struct TrackingLoop<'a> {
    regions: RegionModel,
    scheduler: SessionScheduler,
    pulse: &'a PulseGenerator,
    sink: &'a mut FrameSink,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    handoff_depth: usize,
    report: SessionReport,
}

impl<'a> TrackingLoop<'a> {
    pub fn new(
        regions: RegionModel,
        scheduler: SessionScheduler,
        pulse: &'a PulseGenerator,
        sink: &'a mut FrameSink,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            regions,
            scheduler,
            pulse,
            sink,
            clock,
            cancel,
            handoff_depth: 1,
            report: SessionReport::default(),
        }
    }

    /// Frames allowed in flight in the sink between frames (at least 1).
    pub fn with_handoff_depth(mut self, depth: usize) -> Self {
        self.handoff_depth = depth.max(1);
        self
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn into_report(self) -> SessionReport {
        self.report
    }

    /// Run until the schedule ends, the cancel token is set, or a fatal error.
    ///
    /// On error the partial report stays available through `report()`.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        locator: &mut dyn LocatorBackend,
        store: &mut dyn FrameStore,
    ) -> Result<()> {
        let outcome = self.track(source, locator, store);

        let off = self.pulse.force_off();
        if let Err(e) = &off {
            log::error!("failed to force trigger off: {:#}", e);
        }
        let flushed = self.handoff(store, 0);

        let end = outcome?;
        off?;
        flushed?;
        self.report.end = Some(end);
        log::info!(
            "tracking {}: {} frames, {} detection failures, {} compression gaps, {:.1}s",
            match end {
                SessionEnd::Completed => "complete",
                SessionEnd::Cancelled => "cancelled",
            },
            self.report.events.len(),
            self.report.detection_failures,
            self.report.gaps.len(),
            self.report.elapsed.as_secs_f64()
        );
        Ok(())
    }

    fn track(
        &mut self,
        source: &mut dyn FrameSource,
        locator: &mut dyn LocatorBackend,
        store: &mut dyn FrameStore,
    ) -> Result<SessionEnd> {
        let start = self.clock.now();
        let mut health = HealthWindow::new();
        log::info!(
            "tracking started on {} with {} ({} phases, {:.0}s)",
            source.describe(),
            locator.name(),
            self.scheduler.schedule().phase_count(),
            self.scheduler.schedule().total().as_secs_f64()
        );

        loop {
            let frame = source.next_frame().context("capture frame")?;
            let elapsed = self.clock.now().saturating_duration_since(start);
            self.report.elapsed = elapsed;

            if let Some(change) = self.scheduler.advance(elapsed) {
                if self.scheduler.is_terminal() {
                    log::info!(
                        "phase {} -> end at {:.1}s",
                        change.from,
                        elapsed.as_secs_f64()
                    );
                    return Ok(SessionEnd::Completed);
                }
                log::info!(
                    "phase {} -> {} at {:.1}s ({})",
                    change.from,
                    change.to,
                    elapsed.as_secs_f64(),
                    self.scheduler
                        .directive()
                        .map_or("end", Directive::label)
                );
                self.report.transitions.push(change);
            }

            self.sink.submit(&frame);

            let cropped = frame.crop(&self.regions.outer());
            let detection = match locator.locate(cropped.pixels(), cropped.width, cropped.height) {
                Ok(detection) => detection,
                Err(e) => {
                    log::debug!("frame {}: locator error: {:#}", frame.seq, e);
                    Detection::NotFound(NotFoundReason::InvalidFrame)
                }
            };
            if let Detection::NotFound(reason) = detection {
                log::debug!("frame {}: target not found ({:?})", frame.seq, reason);
                self.report.detection_failures += 1;
            }

            let position = detection.position();
            let in_primary = match position {
                Some(pos) if self.regions.in_primary(pos) => Membership::Inside,
                Some(_) => Membership::Outside,
                None => Membership::Unknown,
            };
            let stimulate = match (self.scheduler.directive(), position) {
                (Some(Directive::StimulatePrimary), Some(pos)) => self.regions.in_primary(pos),
                (Some(Directive::StimulateSecondary), Some(pos)) => {
                    self.regions.in_secondary(pos)
                }
                _ => false,
            };
            let switched = self.pulse.set_active(stimulate);

            self.report.events.push(TrackResult {
                frame_seq: frame.seq,
                phase: self.scheduler.phase(),
                detection,
                in_primary,
                stimulation: stimulate && switched.is_ok(),
                elapsed,
            });
            switched.with_context(|| format!("set trigger on frame {}", frame.seq))?;

            self.handoff(store, self.handoff_depth - 1)?;

            health.tick(elapsed, &self.report, source);

            if self.cancel.is_cancelled() {
                log::info!(
                    "tracking cancelled at {:.1}s after frame {}",
                    elapsed.as_secs_f64(),
                    frame.seq
                );
                return Ok(SessionEnd::Cancelled);
            }
        }
    }

    /// Retrieve encoded frames until at most `keep` remain in flight.
    fn handoff(&mut self, store: &mut dyn FrameStore, keep: usize) -> Result<()> {
        while self.sink.pending() > keep {
            match self.sink.retrieve() {
                Some(Ok(frame)) => {
                    store.store(frame)?;
                    self.report.frames_stored += 1;
                }
                Some(Err(err)) => {
                    if let ControlError::CompressionFailure { seq, .. } = err {
                        store.record_gap(seq);
                        self.report.gaps.push(seq);
                    }
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Periodic health line, measured in session time.
struct HealthWindow {
    last_at: Duration,
    last_frames: usize,
}

impl HealthWindow {
    fn new() -> Self {
        Self {
            last_at: Duration::ZERO,
            last_frames: 0,
        }
    }

    fn tick(&mut self, elapsed: Duration, report: &SessionReport, source: &dyn FrameSource) {
        let window = elapsed.saturating_sub(self.last_at);
        if window < HEALTH_INTERVAL {
            return;
        }
        let frames = report.events.len();
        let fps = (frames - self.last_frames) as f64 / window.as_secs_f64();
        let stats = source.stats();
        log::info!(
            "health: t={:.0}s frames={} captured={} detection_failures={} gaps={} fps={:.1} source={} healthy={}",
            elapsed.as_secs_f64(),
            frames,
            stats.frames_captured,
            report.detection_failures,
            report.gaps.len(),
            fps,
            stats.source,
            source.is_healthy()
        );
        self.last_at = elapsed;
        self.last_frames = frames;
    }
}

/// Outcome of the habituation period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Habituation {
    pub frames: u64,
    /// True when the operator ended habituation early.
    pub cut_short: bool,
}

/// Consume frames for `duration` without tracking or stimulating.
///
/// A cancel request during habituation only ends habituation; the request is
/// consumed so tracking can start normally.
pub fn habituate(
    source: &mut dyn FrameSource,
    clock: &dyn Clock,
    duration: Duration,
    cancel: &CancelToken,
) -> Result<Habituation> {
    let start: Instant = clock.now();
    let mut outcome = Habituation {
        frames: 0,
        cut_short: false,
    };
    log::info!("habituation: {:.0}s", duration.as_secs_f64());
    while clock.now().saturating_duration_since(start) < duration {
        source.next_frame().context("capture habituation frame")?;
        outcome.frames += 1;
        if cancel.take() {
            log::info!("habituation ended early after {} frames", outcome.frames);
            outcome.cut_short = true;
            break;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ContourLocator;
    use crate::frame::RawFrame;
    use crate::ingest::{SourceStats, SyntheticConfig, SyntheticSource, TargetMotion};
    use crate::pulse::{PulseTiming, RecordingOutput};
    use crate::region::{Calibration, CornerRect, Side};
    use crate::schedule::{ScheduleDurations, SessionSchedule};
    use crate::sink::{EncodedFrame, FrameEncoder};
    use crate::ui::Ui;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    /// Advances the clock by one frame interval per captured frame.
    struct ClockedSource {
        inner: SyntheticSource,
        clock: Arc<ManualClock>,
        step: Duration,
    }

    impl FrameSource for ClockedSource {
        fn connect(&mut self) -> Result<()> {
            self.inner.connect()
        }

        fn next_frame(&mut self) -> Result<RawFrame> {
            self.clock.advance(self.step);
            self.inner.next_frame()
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            self.inner.stats()
        }

        fn describe(&self) -> String {
            "clocked".to_string()
        }
    }

    struct PassThrough;

    impl FrameEncoder for PassThrough {
        fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
            Ok(frame.seq.to_le_bytes().to_vec())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        seqs: Vec<u64>,
        gaps: Vec<u64>,
    }

    impl FrameStore for MemoryStore {
        fn store(&mut self, frame: EncodedFrame) -> Result<()> {
            self.seqs.push(frame.seq);
            Ok(())
        }

        fn record_gap(&mut self, seq: u64) {
            self.gaps.push(seq);
        }

        fn finish(&mut self, _ui: &Ui) -> Result<crate::storage::StoreSummary> {
            Ok(crate::storage::StoreSummary::default())
        }
    }

    // 160x120 frame; outer field covers all of it; region A on the right,
    // region B on the left.
    fn regions() -> RegionModel {
        let calibration = Calibration {
            outer: CornerRect::from([0, 0, 160, 120]),
            region_a: CornerRect::from([100, 0, 159, 119]),
            region_b: CornerRect::from([0, 0, 59, 119]),
        };
        RegionModel::calibrate(&calibration, 160, 120, Side::Right).unwrap()
    }

    fn source(clock: &Arc<ManualClock>, motion: TargetMotion) -> ClockedSource {
        let mut config = SyntheticConfig::new(160, 120);
        config.motion = motion;
        ClockedSource {
            inner: SyntheticSource::new(config),
            clock: Arc::clone(clock),
            step: Duration::from_millis(500),
        }
    }

    fn scheduler(pre: u32, session: u32, alternate: bool) -> SessionScheduler {
        SessionScheduler::new(
            SessionSchedule::new(ScheduleDurations::from_minutes(pre, session, 0, alternate))
                .unwrap(),
        )
    }

    #[test]
    fn undetected_frames_record_unknown_and_stay_off() -> Result<()> {
        let clock = ManualClock::new();
        let output = RecordingOutput::new();
        let pulse = PulseGenerator::new(PulseTiming::new(10, 20)?, Box::new(output.clone()))?;
        let mut sink = FrameSink::new(Arc::new(PassThrough), 1)?;
        let mut store = MemoryStore::default();
        let mut src = source(&clock, TargetMotion::Hidden);
        let mut locator = ContourLocator::new(30);

        let mut tracker = TrackingLoop::new(
            regions(),
            scheduler(0, 1, false),
            &pulse,
            &mut sink,
            clock.clone(),
            CancelToken::new(),
        );
        tracker.run(&mut src, &mut locator, &mut store)?;
        let report = tracker.into_report();

        assert_eq!(report.end, Some(SessionEnd::Completed));
        assert_eq!(report.events.len(), 119);
        assert_eq!(report.detection_failures, 119);
        for record in report.events.records() {
            assert_eq!(record.in_primary, Membership::Unknown);
            assert!(!record.stimulation);
            assert_eq!(record.tsv_row().split('\t').nth(1), Some("nan"));
        }
        assert_eq!(output.rising_edges(), 0);
        assert_eq!(store.seqs.len(), 119);
        Ok(())
    }

    #[test]
    fn secondary_phase_stimulates_secondary_region_only() -> Result<()> {
        let clock = ManualClock::new();
        let output = RecordingOutput::new();
        let pulse = PulseGenerator::new(PulseTiming::new(10, 20)?, Box::new(output.clone()))?;
        let mut sink = FrameSink::new(Arc::new(PassThrough), 1)?;
        let mut store = MemoryStore::default();
        // Target sits in region B (left), which is the secondary region.
        let mut src = source(&clock, TargetMotion::Fixed { x: 30, y: 60 });
        let mut locator = ContourLocator::new(30);

        let mut tracker = TrackingLoop::new(
            regions(),
            scheduler(0, 1, true),
            &pulse,
            &mut sink,
            clock.clone(),
            CancelToken::new(),
        );
        tracker.run(&mut src, &mut locator, &mut store)?;
        let report = tracker.into_report();

        let transitions: Vec<(usize, usize)> =
            report.transitions.iter().map(|c| (c.from, c.to)).collect();
        // The zero-minute break is skipped in one step.
        assert_eq!(transitions, vec![(0, 1), (1, 3)]);
        for record in report.events.records() {
            assert_eq!(record.in_primary, Membership::Outside);
            assert_eq!(record.stimulation, record.phase == 3, "{record:?}");
        }
        assert!(!output.level());
        Ok(())
    }

    #[test]
    fn cancel_completes_current_frame_then_stops() -> Result<()> {
        let clock = ManualClock::new();
        let pulse = PulseGenerator::new(PulseTiming::new(10, 20)?, Box::new(RecordingOutput::new()))?;
        let mut sink = FrameSink::new(Arc::new(PassThrough), 2)?;
        let mut store = MemoryStore::default();
        let mut src = source(&clock, TargetMotion::Fixed { x: 130, y: 60 });
        let mut locator = ContourLocator::new(30);
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut tracker = TrackingLoop::new(
            regions(),
            scheduler(0, 10, false),
            &pulse,
            &mut sink,
            clock.clone(),
            cancel,
        )
        .with_handoff_depth(3);
        tracker.run(&mut src, &mut locator, &mut store)?;
        let report = tracker.into_report();

        assert_eq!(report.end, Some(SessionEnd::Cancelled));
        assert_eq!(report.events.len(), 1);
        assert!(report.events.records()[0].stimulation);
        // Frames still in flight are flushed on exit.
        assert_eq!(store.seqs, vec![1]);
        assert!(!pulse.is_active());
        Ok(())
    }

    #[test]
    fn hardware_fault_aborts_and_keeps_partial_report() -> Result<()> {
        let clock = ManualClock::new();
        // Initial low succeeds, the first write of the train fails.
        let output = RecordingOutput::failing_after(1);
        let pulse = PulseGenerator::new(PulseTiming::new(10, 20)?, Box::new(output))?;
        let mut sink = FrameSink::new(Arc::new(PassThrough), 1)?;
        let mut store = MemoryStore::default();
        // The target enters the primary region and leaves it again, so the
        // trigger is written from the tracking thread at the latest on exit.
        let mut src = source(&clock, TargetMotion::Sweep { period_frames: 100 });
        let mut locator = ContourLocator::new(30);

        let mut tracker = TrackingLoop::new(
            regions(),
            scheduler(0, 1, false),
            &pulse,
            &mut sink,
            clock.clone(),
            CancelToken::new(),
        );
        let err = tracker
            .run(&mut src, &mut locator, &mut store)
            .expect_err("hardware fault must abort");
        assert!(crate::error::hardware_fault(&err).is_some());
        let report = tracker.report();
        assert!(report.end.is_none());
        let recorded = report.events.len();
        assert!((33..119).contains(&recorded), "{recorded} frames recorded");
        // The faulting frame is recorded, with the trigger reported off.
        assert_eq!(recorded as u64, src.stats().frames_captured);
        assert_eq!(report.frames_stored, src.stats().frames_captured);
        let last = &report.events.records()[recorded - 1];
        assert!(!last.stimulation);
        Ok(())
    }

    #[test]
    fn habituation_cancel_is_consumed() -> Result<()> {
        let clock = ManualClock::new();
        let mut src = source(&clock, TargetMotion::Hidden);
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = habituate(&mut src, clock.as_ref(), Duration::from_secs(60), &cancel)?;
        assert_eq!(outcome, Habituation { frames: 1, cut_short: true });
        assert!(!cancel.is_cancelled());

        let outcome = habituate(&mut src, clock.as_ref(), Duration::from_secs(5), &cancel)?;
        assert_eq!(outcome, Habituation { frames: 10, cut_short: false });
        Ok(())
    }

    #[test]
    fn tsv_row_formats_detection() {
        let record = TrackResult {
            frame_seq: 4,
            phase: 1,
            detection: Detection::Found(Position { x: 12, y: 34 }),
            in_primary: Membership::Inside,
            stimulation: true,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(record.tsv_row(), "1\t12\t34\t1\t1\t1.500");
        assert_eq!(TSV_HEADER.split('\t').count(), 6);
    }
}
