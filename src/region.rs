//! Calibrated regions and the membership test.
//!
//! Calibration produces three rectangles in full-frame pixel coordinates: the
//! outer field (the working crop) and two stimulation regions. The stimulation
//! regions are translated into outer-field coordinates exactly once, before
//! tracking starts, and are immutable afterwards.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Position;
use crate::error::ControlError;

/// Which stimulation region comes first in the schedule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Right,
    Left,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Right => Side::Left,
            Side::Left => Side::Right,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Right => "right",
            Side::Left => "left",
        }
    }
}

/// Axis-aligned rectangle.
///
/// Stimulation regions are tested with inclusive bounds on all four edges
/// (`contains`). The outer field uses the same type as a half-open crop
/// window `[xmin, xmax) x [ymin, ymax)`, so `width()` and `height()` are the
/// size of the cropped frame.
///
/// Invariant: `xmin <= xmax` and `ymin <= ymax`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    xmin: u32,
    xmax: u32,
    ymin: u32,
    ymax: u32,
}

impl Region {
    pub fn new(xmin: u32, xmax: u32, ymin: u32, ymax: u32) -> Result<Self> {
        if xmin > xmax || ymin > ymax {
            return Err(anyhow!(
                "region bounds out of order: x {}..{}, y {}..{}",
                xmin,
                xmax,
                ymin,
                ymax
            ));
        }
        Ok(Self {
            xmin,
            xmax,
            ymin,
            ymax,
        })
    }

    pub fn xmin(&self) -> u32 {
        self.xmin
    }

    pub fn xmax(&self) -> u32 {
        self.xmax
    }

    pub fn ymin(&self) -> u32 {
        self.ymin
    }

    pub fn ymax(&self) -> u32 {
        self.ymax
    }

    pub fn width(&self) -> u32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> u32 {
        self.ymax - self.ymin
    }

    /// Boundary-inclusive membership on all four edges.
    pub fn contains(&self, pos: Position) -> bool {
        pos.x >= self.xmin && pos.x <= self.xmax && pos.y >= self.ymin && pos.y <= self.ymax
    }

    fn sort_key(&self) -> (u32, u32, u32, u32) {
        (self.xmax, self.xmin, self.ymin, self.ymax)
    }
}

/// Free-function form of [`Region::contains`].
pub fn membership(pos: Position, region: &Region) -> bool {
    region.contains(pos)
}

/// Rectangle as drawn by the operator: two opposite corners in any order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 4]", into = "[i64; 4]")]
pub struct CornerRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl From<[i64; 4]> for CornerRect {
    fn from(v: [i64; 4]) -> Self {
        Self {
            x1: v[0],
            y1: v[1],
            x2: v[2],
            y2: v[3],
        }
    }
}

impl From<CornerRect> for [i64; 4] {
    fn from(r: CornerRect) -> Self {
        [r.x1, r.y1, r.x2, r.y2]
    }
}

impl std::fmt::Display for CornerRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) x ({}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

impl CornerRect {
    /// Sorts the corners and clamps them into a `width` x `height` frame.
    fn to_frame_region(self, width: u32, height: u32) -> (Region, bool) {
        let (xmin, xmax) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (ymin, ymax) = (self.y1.min(self.y2), self.y1.max(self.y2));
        let clamp = |v: i64, hi: u32| v.clamp(0, hi as i64) as u32;
        let region = Region {
            xmin: clamp(xmin, width),
            xmax: clamp(xmax, width),
            ymin: clamp(ymin, height),
            ymax: clamp(ymax, height),
        };
        let clamped = region.xmin as i64 != xmin
            || region.xmax as i64 != xmax
            || region.ymin as i64 != ymin
            || region.ymax as i64 != ymax;
        (region, clamped)
    }
}

/// Calibration result handed over by the region-drawing collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub outer: CornerRect,
    pub region_a: CornerRect,
    pub region_b: CornerRect,
}

/// Stimulation regions ordered by side preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionOrder {
    pub primary: Region,
    pub secondary: Region,
}

impl RegionOrder {
    pub fn swapped(self) -> Self {
        Self {
            primary: self.secondary,
            secondary: self.primary,
        }
    }
}

/// Orders two regions by horizontal position.
///
/// With `Side::Right` the region reaching further right (larger `xmax`)
/// becomes primary; with `Side::Left` the one with the smaller `xmax` does.
/// Ties fall back to `xmin` then the y bounds, so argument order never
/// matters.
pub fn resolve_order(a: Region, b: Region, side: Side) -> RegionOrder {
    let (left, right) = if a.sort_key() <= b.sort_key() {
        (a, b)
    } else {
        (b, a)
    };
    match side {
        Side::Right => RegionOrder {
            primary: right,
            secondary: left,
        },
        Side::Left => RegionOrder {
            primary: left,
            secondary: right,
        },
    }
}

/// Translates `region` into coordinates relative to `outer`, clamping each
/// bound to `0..=outer.width()` and `0..=outer.height()`. An edge drawn on the
/// outer field's far border therefore lands one past the last cropped pixel,
/// which never changes membership of a located position. Returns whether
/// clamping changed anything.
fn relative_to(region: Region, outer: Region) -> (Region, bool) {
    let width = outer.width() as i64;
    let height = outer.height() as i64;
    let shift = |v: u32, origin: u32, hi: i64| -> (u32, bool) {
        let rel = v as i64 - origin as i64;
        let clamped = rel.clamp(0, hi);
        (clamped as u32, clamped != rel)
    };
    let (xmin, c1) = shift(region.xmin, outer.xmin, width);
    let (xmax, c2) = shift(region.xmax, outer.xmin, width);
    let (ymin, c3) = shift(region.ymin, outer.ymin, height);
    let (ymax, c4) = shift(region.ymax, outer.ymin, height);
    (
        Region {
            xmin,
            xmax,
            ymin,
            ymax,
        },
        c1 || c2 || c3 || c4,
    )
}

/// Outer field plus the side-ordered stimulation regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionModel {
    outer: Region,
    region_a: Region,
    region_b: Region,
    order: RegionOrder,
}

impl RegionModel {
    /// Builds the model from a calibration drawn on a `width` x `height` frame.
    ///
    /// Out-of-range rectangles are clamped (one warning per region), never
    /// rejected. An outer field with no area is rejected since there is
    /// nothing to track in.
    pub fn calibrate(calibration: &Calibration, width: u32, height: u32, side: Side) -> Result<Self> {
        let (outer, outer_clamped) = calibration.outer.to_frame_region(width, height);
        if outer_clamped {
            warn_clamped("outer", &calibration.outer, &outer);
        }
        if outer.width() == 0 || outer.height() == 0 {
            return Err(anyhow!(
                "outer field {} has no area inside a {}x{} frame",
                calibration.outer,
                width,
                height
            ));
        }

        let translate = |name: &'static str, rect: &CornerRect| {
            let (full, clamped_frame) = rect.to_frame_region(width, height);
            let (rel, clamped_outer) = relative_to(full, outer);
            if clamped_frame || clamped_outer {
                warn_clamped(name, rect, &rel);
            }
            rel
        };
        let region_a = translate("region_a", &calibration.region_a);
        let region_b = translate("region_b", &calibration.region_b);
        let order = resolve_order(region_a, region_b, side);

        log::info!(
            "calibration: outer x {}..{} y {}..{}, primary x {}..{} y {}..{}, secondary x {}..{} y {}..{} (first side {})",
            outer.xmin,
            outer.xmax,
            outer.ymin,
            outer.ymax,
            order.primary.xmin,
            order.primary.xmax,
            order.primary.ymin,
            order.primary.ymax,
            order.secondary.xmin,
            order.secondary.xmax,
            order.secondary.ymin,
            order.secondary.ymax,
            side.as_str()
        );

        Ok(Self {
            outer,
            region_a,
            region_b,
            order,
        })
    }

    /// Outer field in full-frame coordinates, as a half-open crop window.
    pub fn outer(&self) -> Region {
        self.outer
    }

    /// First drawn stimulation region, outer-relative.
    pub fn region_a(&self) -> Region {
        self.region_a
    }

    /// Second drawn stimulation region, outer-relative.
    pub fn region_b(&self) -> Region {
        self.region_b
    }

    pub fn order(&self) -> RegionOrder {
        self.order
    }

    pub fn in_primary(&self, pos: Position) -> bool {
        self.order.primary.contains(pos)
    }

    pub fn in_secondary(&self, pos: Position) -> bool {
        self.order.secondary.contains(pos)
    }
}

fn warn_clamped(name: &'static str, raw: &CornerRect, adjusted: &Region) {
    let err = ControlError::CalibrationOutOfRange {
        region: name,
        detail: format!(
            "{} clamped to x {}..{} y {}..{}",
            raw, adjusted.xmin, adjusted.xmax, adjusted.ymin, adjusted.ymax
        ),
    };
    log::warn!("{}", err);
}
