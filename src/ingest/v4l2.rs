//! V4L2 camera source.
//!
//! Opens a local device node (e.g. `/dev/video0`), requests the configured
//! size and frame rate, and normalises whatever pixel format the driver
//! settles on (RGB3, YUYV or NV12) into RGB24 `RawFrame`s.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraConfig, FrameSource, SourceStats};
use crate::frame::RawFrame;

pub struct V4l2Source {
    config: CameraConfig,
    state: Option<V4l2State>,
    format: PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: CameraConfig) -> Result<Self> {
        Ok(Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        })
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.framerate == 0 {
            2_000
        } else {
            (1000 / self.config.framerate).saturating_mul(6)
        };
        Duration::from_millis(u64::from(base_ms.max(2_000)))
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.source)
            .with_context(|| format!("open v4l2 device {}", self.config.source))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.source,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "unsupported v4l2 pixel format {} on {}",
                format.fourcc,
                self.config.source
            )
        })?;

        if self.config.framerate > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.framerate);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.source,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.config.source,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let pixels = state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map(|(buf, meta)| {
                        let used = (meta.bytesused as usize).min(buf.len());
                        let used = if used == 0 { buf.len() } else { used };
                        normalize_to_rgb(&buf[..used], width, height, format)
                    })
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })??;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        RawFrame::new(pixels, width, height, self.frame_count)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }

    fn describe(&self) -> String {
        format!("v4l2 {}", self.config.source)
    }
}
