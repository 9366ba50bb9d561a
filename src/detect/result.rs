/// Integer pixel position in cropped-frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

/// Why a frame produced no position.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotFoundReason {
    /// No foreground pixels survived thresholding.
    NoContours,
    /// The largest contour encloses zero area (a point or a line).
    DegenerateMoment,
    /// The frame could not be analysed (bad dimensions or buffer length).
    InvalidFrame,
}

/// Result of locating the target in one frame.
///
/// `NotFound` is never a position; callers must not substitute (0, 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    Found(Position),
    NotFound(NotFoundReason),
}

impl Detection {
    pub fn position(&self) -> Option<Position> {
        match self {
            Detection::Found(pos) => Some(*pos),
            Detection::NotFound(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Detection::Found(_))
    }
}
