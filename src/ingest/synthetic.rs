//! Synthetic arena source for `stub://` URLs.
//!
//! Renders a bright arena floor with a dark disc standing in for the animal.
//! The URL query selects the motion and noise, e.g.
//! `stub://arena?motion=fixed&x=500&y=200&radius=12&dropout=0.05&speckle=0.001&seed=7`.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use super::{CameraConfig, FrameSource, SourceStats};
use crate::frame::{RawFrame, RGB_CHANNELS};

pub const FLOOR_LEVEL: u8 = 200;
pub const TARGET_LEVEL: u8 = 10;

/// How the synthetic target moves from frame to frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetMotion {
    /// Target stays at one position.
    Fixed { x: u32, y: u32 },
    /// Target walks left and right across the middle row, one full lap every
    /// `period_frames` frames.
    Sweep { period_frames: u32 },
    /// No target is ever drawn.
    Hidden,
}

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub motion: TargetMotion,
    pub radius: u32,
    /// Probability that a frame is rendered without the target.
    pub dropout: f64,
    /// Probability that a floor pixel is rendered dark.
    pub speckle: f64,
    pub seed: u64,
    /// Minimum time between frames; `None` renders as fast as asked.
    pub frame_interval: Option<Duration>,
}

impl SyntheticConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            motion: TargetMotion::Sweep { period_frames: 200 },
            radius: 10,
            dropout: 0.0,
            speckle: 0.0,
            seed: 0,
            frame_interval: None,
        }
    }

    /// Build from a `stub://` URL and the camera section.
    pub fn from_camera(camera: &CameraConfig) -> Result<Self> {
        let mut config = Self::new(camera.width, camera.height);
        if camera.framerate > 0 {
            config.frame_interval = Some(Duration::from_secs_f64(
                1.0 / f64::from(camera.framerate),
            ));
        }

        let query = camera
            .source
            .split_once('?')
            .map(|(_, q)| q)
            .unwrap_or_default();
        let mut motion = "sweep";
        let mut fixed = (camera.width / 2, camera.height / 2);
        let mut period_frames = 200;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid stub parameter '{}'", pair))?;
            let ctx = || format!("invalid stub parameter {}={}", key, value);
            match key {
                "motion" => motion = value,
                "x" => fixed.0 = value.parse().with_context(ctx)?,
                "y" => fixed.1 = value.parse().with_context(ctx)?,
                "period" => period_frames = value.parse().with_context(ctx)?,
                "radius" => config.radius = value.parse().with_context(ctx)?,
                "dropout" => config.dropout = parse_probability(value).with_context(ctx)?,
                "speckle" => config.speckle = parse_probability(value).with_context(ctx)?,
                "seed" => config.seed = value.parse().with_context(ctx)?,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        config.motion = match motion {
            "fixed" => TargetMotion::Fixed {
                x: fixed.0,
                y: fixed.1,
            },
            "sweep" => TargetMotion::Sweep { period_frames },
            "hidden" => TargetMotion::Hidden,
            other => return Err(anyhow!("unknown stub motion '{}'", other)),
        };
        Ok(config)
    }
}

fn parse_probability(value: &str) -> Result<f64> {
    let p: f64 = value.parse()?;
    if !(0.0..=1.0).contains(&p) {
        return Err(anyhow!("probability {} outside 0..=1", p));
    }
    Ok(p)
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    label: String,
    rng: StdRng,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self::with_label(config, "stub://synthetic")
    }

    pub fn with_label(config: SyntheticConfig, label: impl Into<String>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            label: label.into(),
            frame_count: 0,
            last_frame_at: None,
        }
    }

    /// Where the target is drawn on frame `seq`, ignoring dropout.
    pub fn target_at(&self, seq: u64) -> Option<(u32, u32)> {
        let c = &self.config;
        match c.motion {
            TargetMotion::Fixed { x, y } => Some((x, y)),
            TargetMotion::Hidden => None,
            TargetMotion::Sweep { period_frames } => {
                let lo = c.radius.min(c.width.saturating_sub(1));
                let hi = c.width.saturating_sub(1 + c.radius).max(lo);
                let span = u64::from(hi - lo);
                let half = u64::from(period_frames.max(2) / 2);
                let step = seq % (half * 2);
                let t = if step <= half { step } else { half * 2 - step };
                Some((lo + (span * t / half) as u32, c.height / 2))
            }
        }
    }

    fn render(&mut self, seq: u64) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let mut pixels = vec![FLOOR_LEVEL; w as usize * h as usize * RGB_CHANNELS];

        if self.config.speckle > 0.0 {
            for px in pixels.chunks_exact_mut(RGB_CHANNELS) {
                if self.rng.gen_bool(self.config.speckle) {
                    px.fill(TARGET_LEVEL);
                }
            }
        }

        let dropped = self.config.dropout > 0.0 && self.rng.gen_bool(self.config.dropout);
        if let (false, Some((cx, cy))) = (dropped, self.target_at(seq)) {
            let r = i64::from(self.config.radius);
            let (cx, cy) = (i64::from(cx), i64::from(cy));
            for y in (cy - r).max(0)..=(cy + r).min(i64::from(h) - 1) {
                for x in (cx - r).max(0)..=(cx + r).min(i64::from(w) - 1) {
                    if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                        let i = (y as usize * w as usize + x as usize) * RGB_CHANNELS;
                        pixels[i..i + RGB_CHANNELS].fill(TARGET_LEVEL);
                    }
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{}, {:?})",
            self.label,
            self.config.width,
            self.config.height,
            self.config.motion
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        if let (Some(interval), Some(last)) = (self.config.frame_interval, self.last_frame_at) {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.frame_count += 1;
        let seq = self.frame_count;
        let pixels = self.render(seq);
        self.last_frame_at = Some(Instant::now());
        RawFrame::new(pixels, self.config.width, self.config.height, seq)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.label.clone(),
        }
    }

    fn describe(&self) -> String {
        format!("synthetic {}", self.label)
    }
}
