use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::CameraConfig;
use crate::region::{Calibration, Side};
use crate::schedule::ScheduleDurations;

pub const CONFIG_ENV: &str = "RTPP_CONFIG";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub adaptation_min: u32,
    pub pre_session_min: u32,
    pub session_min: u32,
    pub break_min: u32,
    pub alternate: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            adaptation_min: 20,
            pre_session_min: 10,
            session_min: 10,
            break_min: 0,
            alternate: true,
        }
    }
}

impl ScheduleConfig {
    pub fn durations(&self) -> ScheduleDurations {
        ScheduleDurations::from_minutes(
            self.pre_session_min,
            self.session_min,
            self.break_min,
            self.alternate,
        )
    }

    pub fn adaptation(&self) -> Duration {
        Duration::from_secs(u64::from(self.adaptation_min) * 60)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StimulationConfig {
    pub pulse_length_ms: u32,
    pub frequency_hz: u32,
    /// BCM pin number of the trigger line.
    pub gpio_pin: u32,
    /// Side of the arena stimulated in the first session.
    pub first_side: Side,
}

impl Default for StimulationConfig {
    fn default() -> Self {
        Self {
            pulse_length_ms: 10,
            frequency_hz: 20,
            gpio_pin: 14,
            first_side: Side::Right,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Luma at or below this value is foreground.
    pub threshold: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { threshold: 30 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Keep every encoded frame in memory and write them after the session.
    #[default]
    Buffered,
    /// Write each encoded frame as soon as it is retrieved.
    Streaming,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecordingConfig {
    pub mode: RecordingMode,
    pub jpeg_quality: u8,
    /// Frames allowed in flight between submit and retrieve.
    pub handoff_depth: usize,
    pub encoder_threads: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Buffered,
            jpeg_quality: 50,
            handoff_depth: 1,
            encoder_threads: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub animal_id: String,
    pub output_dir: PathBuf,
    pub camera: CameraConfig,
    pub schedule: ScheduleConfig,
    pub stimulation: StimulationConfig,
    pub detection: DetectionConfig,
    pub recording: RecordingConfig,
    pub calibration: Option<Calibration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            animal_id: "animal".to_string(),
            output_dir: PathBuf::from("./"),
            camera: CameraConfig::default(),
            schedule: ScheduleConfig::default(),
            stimulation: StimulationConfig::default(),
            detection: DetectionConfig::default(),
            recording: RecordingConfig::default(),
            calibration: None,
        }
    }
}

impl SessionConfig {
    /// Defaults, then the config file (`path` or `$RTPP_CONFIG`), then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |_| Ok(()))
    }

    /// Like `load`, with `overrides` applied after the environment and
    /// before validation.
    pub fn load_with<F>(path: Option<&Path>, overrides: F) -> Result<Self>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let env_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let mut cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        overrides(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("RTPP_SOURCE") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
        if let Ok(dir) = std::env::var("RTPP_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(pin) = std::env::var("RTPP_GPIO_PIN") {
            self.stimulation.gpio_pin = pin
                .trim()
                .parse()
                .map_err(|_| anyhow!("RTPP_GPIO_PIN must be a non-negative integer"))?;
        }
        if let Ok(threshold) = std::env::var("RTPP_THRESHOLD") {
            self.detection.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("RTPP_THRESHOLD must be an integer in 0..=255"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.animal_id.trim().is_empty() {
            return Err(anyhow!("animal id must not be empty"));
        }
        if self.animal_id.contains(['/', '\\']) {
            return Err(anyhow!("animal id must not contain path separators"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("frame size must be greater than zero"));
        }
        if self.camera.framerate == 0 {
            return Err(anyhow!("framerate must be greater than zero"));
        }
        if self.schedule.session_min == 0 {
            return Err(anyhow!("session length must be greater than zero"));
        }
        if self.stimulation.frequency_hz == 0 {
            return Err(anyhow!("stimulation frequency must be greater than zero"));
        }
        if self.stimulation.pulse_length_ms == 0 {
            return Err(anyhow!("pulse length must be at least 1 ms"));
        }
        if self.recording.handoff_depth == 0 {
            return Err(anyhow!("handoff depth must be at least 1"));
        }
        if !(1..=100).contains(&self.recording.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.recording.encoder_threads == 0 {
            return Err(anyhow!("encoder threads must be at least 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SessionConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Parse a calibration file (JSON, or TOML by extension).
pub fn read_calibration_file(path: &Path) -> Result<Calibration> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read calibration file {}: {}", path.display(), e))?;
    let calibration = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid calibration file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid calibration file {}: {}", path.display(), e))?
    };
    Ok(calibration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_tool() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.camera.width, 704);
        assert_eq!(cfg.camera.height, 400);
        assert_eq!(cfg.schedule.adaptation(), Duration::from_secs(1200));
        assert_eq!(cfg.stimulation.gpio_pin, 14);
        assert_eq!(cfg.recording.mode, RecordingMode::Buffered);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = SessionConfig::default();
        cfg.recording.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.stimulation.frequency_hz = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.stimulation.pulse_length_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SessionConfig::default();
        cfg.animal_id = "../escape".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_section_defaults() -> Result<()> {
        let cfg: SessionConfig = toml::from_str(
            r#"
            animal_id = "m12"
            [stimulation]
            frequency_hz = 40
            first_side = "left"
            "#,
        )?;
        assert_eq!(cfg.animal_id, "m12");
        assert_eq!(cfg.stimulation.frequency_hz, 40);
        assert_eq!(cfg.stimulation.pulse_length_ms, 10);
        assert_eq!(cfg.stimulation.first_side, Side::Left);
        assert_eq!(cfg.schedule, ScheduleConfig::default());
        Ok(())
    }
}
