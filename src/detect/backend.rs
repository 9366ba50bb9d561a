use anyhow::Result;

use crate::detect::result::Detection;

/// Target locator backend.
///
/// Implementations receive one RGB24 frame at a time and must treat the
/// pixel slice as read-only and ephemeral. A frame in which the target is
/// not visible is a normal `Detection::NotFound`, not an error; `Err` is
/// reserved for malformed input.
pub trait LocatorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate the target in a `width` x `height` RGB24 frame.
    fn locate(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Detection>;
}
