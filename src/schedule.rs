//! Session phase schedule.
//!
//! A session is an ordered list of phase boundaries (seconds since session
//! start) with one directive per phase:
//!
//! ```text
//! single side:  [pre-session: NONE] [session: PRIMARY] | end
//! alternating:  [pre-session: NONE] [session 1: PRIMARY] [break: NONE] [session 2: SECONDARY] | end
//! ```
//!
//! Phase `i` runs until boundary `i`; reaching the last boundary ends the
//! session. A zero-length phase (e.g. a zero-minute break) is skipped in the
//! same frame that reaches its start.

use anyhow::{anyhow, Result};
use std::time::Duration;

/// What the trigger should do during a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Directive {
    None,
    StimulatePrimary,
    StimulateSecondary,
}

impl Directive {
    pub fn label(self) -> &'static str {
        match self {
            Directive::None => "none",
            Directive::StimulatePrimary => "primary",
            Directive::StimulateSecondary => "secondary",
        }
    }
}

/// Durations a session is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleDurations {
    pub pre_session: Duration,
    pub session: Duration,
    pub break_time: Duration,
    pub alternate: bool,
}

impl ScheduleDurations {
    pub fn from_minutes(pre_session: u32, session: u32, break_time: u32, alternate: bool) -> Self {
        let min = |m: u32| Duration::from_secs(u64::from(m) * 60);
        Self {
            pre_session: min(pre_session),
            session: min(session),
            break_time: min(break_time),
            alternate,
        }
    }
}

/// Immutable phase table: boundaries and directives, one entry per phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSchedule {
    boundaries: Vec<Duration>,
    directives: Vec<Directive>,
}

impl SessionSchedule {
    pub fn new(d: ScheduleDurations) -> Result<Self> {
        if d.session.is_zero() {
            return Err(anyhow!("session length must be greater than zero"));
        }
        let first_start = d.pre_session;
        let first_end = first_start + d.session;
        let (boundaries, directives) = if d.alternate {
            let second_start = first_end + d.break_time;
            let second_end = second_start + d.session;
            (
                vec![first_start, first_end, second_start, second_end],
                vec![
                    Directive::None,
                    Directive::StimulatePrimary,
                    Directive::None,
                    Directive::StimulateSecondary,
                ],
            )
        } else {
            (
                vec![first_start, first_end],
                vec![Directive::None, Directive::StimulatePrimary],
            )
        };
        Ok(Self {
            boundaries,
            directives,
        })
    }

    pub fn boundaries(&self) -> &[Duration] {
        &self.boundaries
    }

    /// Number of phases; phase index `phase_count()` is terminal.
    pub fn phase_count(&self) -> usize {
        self.boundaries.len()
    }

    /// Directive of `phase`, `None` once terminal.
    pub fn directive(&self, phase: usize) -> Option<Directive> {
        self.directives.get(phase).copied()
    }

    pub fn total(&self) -> Duration {
        self.boundaries.last().copied().unwrap_or_default()
    }
}

/// A phase advance observed on one frame. `to` may skip zero-length phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: usize,
    pub to: usize,
    pub at: Duration,
}

/// Walks the phase table as elapsed time grows. Phase index never decreases.
#[derive(Clone, Debug)]
pub struct SessionScheduler {
    schedule: SessionSchedule,
    phase: usize,
}

impl SessionScheduler {
    pub fn new(schedule: SessionSchedule) -> Self {
        Self { schedule, phase: 0 }
    }

    pub fn schedule(&self) -> &SessionSchedule {
        &self.schedule
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase >= self.schedule.phase_count()
    }

    /// Current directive, `None` once the session has ended.
    pub fn directive(&self) -> Option<Directive> {
        self.schedule.directive(self.phase)
    }

    /// Advance past every boundary `elapsed` has reached.
    pub fn advance(&mut self, elapsed: Duration) -> Option<PhaseChange> {
        let from = self.phase;
        while let Some(&boundary) = self.schedule.boundaries.get(self.phase) {
            if elapsed < boundary {
                break;
            }
            self.phase += 1;
        }
        (self.phase != from).then_some(PhaseChange {
            from,
            to: self.phase,
            at: elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn single_side_boundaries_and_directives() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(10, 10, 0, false))?;
        assert_eq!(schedule.boundaries(), &[secs(600), secs(1200)]);

        let mut scheduler = SessionScheduler::new(schedule);
        assert_eq!(scheduler.advance(secs(300)), None);
        assert_eq!(scheduler.directive(), Some(Directive::None));

        let change = scheduler.advance(secs(700)).expect("enters session");
        assert_eq!((change.from, change.to), (0, 1));
        assert_eq!(scheduler.directive(), Some(Directive::StimulatePrimary));

        scheduler.advance(secs(1300));
        assert!(scheduler.is_terminal());
        assert_eq!(scheduler.directive(), None);
        Ok(())
    }

    #[test]
    fn alternating_boundaries_include_break() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(10, 10, 5, true))?;
        assert_eq!(
            schedule.boundaries(),
            &[secs(600), secs(1200), secs(1500), secs(2100)]
        );
        assert_eq!(schedule.directive(2), Some(Directive::None));
        assert_eq!(schedule.directive(3), Some(Directive::StimulateSecondary));
        assert_eq!(schedule.total(), secs(2100));
        Ok(())
    }

    #[test]
    fn zero_break_is_skipped_in_one_step() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(1, 1, 0, true))?;
        let mut scheduler = SessionScheduler::new(schedule);
        scheduler.advance(secs(61));
        assert_eq!(scheduler.phase(), 1);
        let change = scheduler.advance(secs(120)).expect("phase change");
        assert_eq!((change.from, change.to), (1, 3));
        assert_eq!(scheduler.directive(), Some(Directive::StimulateSecondary));
        Ok(())
    }

    #[test]
    fn large_frame_gap_skips_exhausted_phases() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(1, 1, 1, true))?;
        let mut scheduler = SessionScheduler::new(schedule);
        let change = scheduler.advance(secs(190)).expect("phase change");
        assert_eq!((change.from, change.to), (0, 3));
        assert!(!scheduler.is_terminal());
        Ok(())
    }

    #[test]
    fn phase_never_decreases() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(2, 3, 1, true))?;
        let mut scheduler = SessionScheduler::new(schedule);
        let mut last = 0;
        for t in (0..700).step_by(7) {
            scheduler.advance(secs(t));
            assert!(scheduler.phase() >= last);
            last = scheduler.phase();
        }
        // Time going backwards never rewinds the phase.
        scheduler.advance(secs(0));
        assert_eq!(scheduler.phase(), last);
        Ok(())
    }

    #[test]
    fn zero_pre_session_starts_stimulating_immediately() -> Result<()> {
        let schedule = SessionSchedule::new(ScheduleDurations::from_minutes(0, 1, 0, false))?;
        let mut scheduler = SessionScheduler::new(schedule);
        assert!(scheduler.advance(Duration::ZERO).is_some());
        assert_eq!(scheduler.directive(), Some(Directive::StimulatePrimary));
        Ok(())
    }

    #[test]
    fn zero_length_session_is_rejected() {
        assert!(SessionSchedule::new(ScheduleDurations::from_minutes(5, 0, 0, false)).is_err());
    }
}
