//! Error taxonomy for the control loop.
//!
//! Only `HardwareFault` is fatal to a session. Calibration problems are
//! clamped at setup, compression failures become gaps in the frame sequence,
//! and detection failures are not errors at all (see `Detection::NotFound`).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Trigger output device unavailable or failed mid-session.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Calibrated rectangle fell outside the frame or outer field; clamped.
    #[error("calibration for {region} out of range: {detail}")]
    CalibrationOutOfRange { region: &'static str, detail: String },

    /// Encoding of a single frame failed; the frame is a gap in the sequence.
    #[error("compression of frame {seq} failed: {reason}")]
    CompressionFailure { seq: u64, reason: String },
}

impl ControlError {
    /// True when the error must abort the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::HardwareFault(_))
    }
}

/// Returns the hardware fault carried by an `anyhow` chain, if any.
pub fn hardware_fault(err: &anyhow::Error) -> Option<&ControlError> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ControlError>())
        .find(|cause| cause.is_fatal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn hardware_fault_is_found_through_context() {
        let err: anyhow::Result<()> = Err(ControlError::HardwareFault("gpio14 gone".into()).into());
        let err = err.context("tracking aborted").unwrap_err();
        let fault = hardware_fault(&err).expect("fault in chain");
        assert_eq!(fault, &ControlError::HardwareFault("gpio14 gone".into()));
    }

    #[test]
    fn compression_failure_is_not_fatal() {
        let err = ControlError::CompressionFailure {
            seq: 3,
            reason: "encoder panicked".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "compression of frame 3 failed: encoder panicked");
    }
}
