//! Asynchronous compress-and-buffer pipeline.
//!
//! Every submitted frame is copied and encoded on a worker pool. Each
//! submission gets its own one-shot channel, queued in submission order, so
//! `retrieve` hands frames back in exactly the order they were submitted no
//! matter which encode finishes first. `submit` never waits on an encoder;
//! only `retrieve` blocks.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};

use crate::error::ControlError;
use crate::frame::RawFrame;

/// Compresses one raw frame.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>>;

    /// File extension for encoded frames.
    fn extension(&self) -> &'static str {
        "jpg"
    }
}

/// Baseline JPEG via the `image` crate.
#[derive(Clone, Copy, Debug)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(frame.byte_len() / 8);
        JpegEncoder::new_with_quality(&mut bytes, self.quality)
            .encode(
                frame.pixels(),
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )
            .with_context(|| format!("jpeg encode frame {}", frame.seq))?;
        Ok(bytes)
    }
}

/// A compressed frame and the capture sequence number it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

type Pending = (u64, mpsc::Receiver<Result<Vec<u8>>>);

/// Order-preserving handoff between the tracking loop and encoder workers.
pub struct FrameSink {
    pool: rayon::ThreadPool,
    encoder: Arc<dyn FrameEncoder>,
    pending: VecDeque<Pending>,
    submitted: u64,
    failures: u64,
}

impl FrameSink {
    pub fn new(encoder: Arc<dyn FrameEncoder>, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("rtpp-encode-{i}"))
            .build()
            .context("build encoder thread pool")?;
        Ok(Self {
            pool,
            encoder,
            pending: VecDeque::new(),
            submitted: 0,
            failures: 0,
        })
    }

    /// Queue a copy of `frame` for compression and return its sequence number.
    pub fn submit(&mut self, frame: &RawFrame) -> u64 {
        let seq = frame.seq;
        let copy = frame.clone();
        let encoder = Arc::clone(&self.encoder);
        let (tx, rx) = mpsc::sync_channel(1);
        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| encoder.encode(&copy)))
                .unwrap_or_else(|_| Err(anyhow!("encoder panicked")));
            // The sink may already be gone; nothing left to deliver to.
            let _ = tx.send(result);
        });
        self.pending.push_back((seq, rx));
        self.submitted += 1;
        seq
    }

    /// Block until the oldest outstanding frame is encoded.
    ///
    /// Returns `None` when nothing is pending. A failed encode is returned as
    /// `CompressionFailure` and does not hold back later frames.
    pub fn retrieve(&mut self) -> Option<Result<EncodedFrame, ControlError>> {
        let (seq, rx) = self.pending.pop_front()?;
        let outcome = match rx.recv() {
            Ok(Ok(bytes)) => Ok(EncodedFrame { seq, bytes }),
            Ok(Err(e)) => Err(ControlError::CompressionFailure {
                seq,
                reason: format!("{:#}", e),
            }),
            Err(_) => Err(ControlError::CompressionFailure {
                seq,
                reason: "encoder worker exited without a result".to_string(),
            }),
        };
        if let Err(err) = &outcome {
            self.failures += 1;
            log::warn!("frame gap: {}", err);
        }
        Some(outcome)
    }

    /// Retrieve every outstanding frame in submission order.
    pub fn drain(&mut self) -> Vec<Result<EncodedFrame, ControlError>> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(item) = self.retrieve() {
            out.push(item);
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}
