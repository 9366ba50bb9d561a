//! Frame ingestion sources.
//!
//! - `stub://...` URLs render a synthetic arena (`SyntheticSource`).
//! - Anything else is a V4L2 device node (feature: ingest-v4l2).
//!
//! Every source produces RGB24 `RawFrame`s with a 1-based capture sequence.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticConfig, SyntheticSource, TargetMotion};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::RawFrame;

/// A live stream of frames.
pub trait FrameSource {
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<RawFrame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Camera section of the session configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CameraConfig {
    /// `stub://...` or a device path such as `/dev/video0`.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: "stub://arena".to_string(),
            width: 704,
            height: 400,
            framerate: 10,
        }
    }
}

/// Source chosen from the camera URL.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(V4l2Source),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if config.source.starts_with("stub://") {
            let synthetic = SyntheticConfig::from_camera(&config)?;
            Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticSource::with_label(
                    synthetic,
                    config.source,
                )),
            })
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Self {
                    backend: CameraBackend::V4l2(V4l2Source::new(config)?),
                })
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!(
                    "camera source {} requires the ingest-v4l2 feature",
                    config.source
                )
            }
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.backend, CameraBackend::Synthetic(_))
    }

    fn inner(&self) -> &dyn FrameSource {
        match &self.backend {
            CameraBackend::Synthetic(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FrameSource {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source,
        }
    }
}

impl FrameSource for CameraSource {
    fn connect(&mut self) -> Result<()> {
        self.inner_mut().connect()
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        self.inner_mut().next_frame()
    }

    fn is_healthy(&self) -> bool {
        self.inner().is_healthy()
    }

    fn stats(&self) -> SourceStats {
        self.inner().stats()
    }

    fn describe(&self) -> String {
        self.inner().describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_select_synthetic_source() -> Result<()> {
        let mut source = CameraSource::new(CameraConfig {
            source: "stub://arena?motion=fixed".to_string(),
            width: 64,
            height: 48,
            framerate: 0,
        })?;
        assert!(source.is_synthetic());
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width, frame.height), (64, 48));
        assert!(source.is_healthy());
        assert_eq!(source.stats().source, "stub://arena?motion=fixed");
        Ok(())
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn device_paths_need_v4l2_feature() {
        let config = CameraConfig {
            source: "/dev/video0".to_string(),
            ..CameraConfig::default()
        };
        assert!(CameraSource::new(config).is_err());
    }
}
