//! Binary-image contour extraction.
//!
//! Foreground components are 8-connected. Each component contributes one
//! outer border, traced with Suzuki-Abe border following from its first
//! pixel in raster order. Area and centroid come from the polygon moments
//! of the traced border (Green's theorem over the vertex list), which is
//! what the moment-based centroid of a contour means.

/// Neighbour offsets (dx, dy), counterclockwise on screen starting east.
const DIRS: [(i64, i64); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];
const WEST: usize = 4;

/// Foreground mask from luma with an inverse threshold: pixels at or below
/// `threshold` are foreground.
pub(crate) fn binarize_inverse(luma: &[u8], threshold: u8) -> Vec<bool> {
    luma.iter().map(|&v| v <= threshold).collect()
}

/// Polygon moments up to first order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
}

impl Moments {
    pub fn area(&self) -> f64 {
        self.m00.abs()
    }

    /// Centroid, or `None` for a zero-area contour.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.m00 == 0.0 {
            return None;
        }
        Some((self.m10 / self.m00, self.m01 / self.m00))
    }
}

/// Closed outer border as an ordered vertex list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Contour {
    pub points: Vec<(i64, i64)>,
}

impl Contour {
    pub fn moments(&self) -> Moments {
        let n = self.points.len();
        if n < 3 {
            return Moments::default();
        }
        let mut m = Moments::default();
        for i in 0..n {
            let (x0, y0) = self.points[i];
            let (x1, y1) = self.points[(i + 1) % n];
            let cross = (x0 * y1 - x1 * y0) as f64;
            m.m00 += cross;
            m.m10 += (x0 + x1) as f64 * cross;
            m.m01 += (y0 + y1) as f64 * cross;
        }
        m.m00 /= 2.0;
        m.m10 /= 6.0;
        m.m01 /= 6.0;
        m
    }
}

struct Mask<'a> {
    bits: &'a [bool],
    width: i64,
    height: i64,
}

impl Mask<'_> {
    fn is_set(&self, x: i64, y: i64) -> bool {
        x >= 0
            && y >= 0
            && x < self.width
            && y < self.height
            && self.bits[(y * self.width + x) as usize]
    }
}

/// Outer borders of every 8-connected foreground component.
pub(crate) fn outer_contours(mask: &[bool], width: usize, height: usize) -> Vec<Contour> {
    debug_assert_eq!(mask.len(), width * height);
    let view = Mask {
        bits: mask,
        width: width as i64,
        height: height as i64,
    };
    let mut labelled = vec![false; mask.len()];
    let mut contours = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || labelled[start] {
            continue;
        }
        let sx = (start % width) as i64;
        let sy = (start / width) as i64;
        contours.push(trace_outer(&view, (sx, sy)));

        labelled[start] = true;
        stack.push((sx, sy));
        while let Some((x, y)) = stack.pop() {
            for (dx, dy) in DIRS {
                let (nx, ny) = (x + dx, y + dy);
                if view.is_set(nx, ny) {
                    let idx = (ny * view.width + nx) as usize;
                    if !labelled[idx] {
                        labelled[idx] = true;
                        stack.push((nx, ny));
                    }
                }
            }
        }
    }
    contours
}

fn dir_index(dx: i64, dy: i64) -> usize {
    DIRS.iter()
        .position(|&d| d == (dx, dy))
        .unwrap_or(WEST)
}

/// Suzuki-Abe outer border following. `start` must be the component's first
/// pixel in raster order, so its west neighbour is background.
fn trace_outer(mask: &Mask<'_>, start: (i64, i64)) -> Contour {
    let step = |p: (i64, i64), d: usize| (p.0 + DIRS[d].0, p.1 + DIRS[d].1);

    // Clockwise from west for the first neighbour.
    let first = (0..8)
        .map(|k| (WEST + 8 - k) % 8)
        .map(|d| step(start, d))
        .find(|&(x, y)| mask.is_set(x, y));
    let Some(p1) = first else {
        return Contour {
            points: vec![start],
        };
    };

    let limit = 4 * (mask.width * mask.height) as usize + 8;
    let mut points = Vec::new();
    let mut prev = p1;
    let mut cur = start;
    while points.len() < limit {
        let from = dir_index(prev.0 - cur.0, prev.1 - cur.1);
        // Counterclockwise from the neighbour after `prev`; `prev` itself is
        // foreground so the search always succeeds by the eighth step.
        let next = (1..=8)
            .map(|k| step(cur, (from + k) % 8))
            .find(|&(x, y)| mask.is_set(x, y))
            .unwrap_or(prev);
        points.push(cur);
        if next == start && cur == p1 {
            break;
        }
        prev = cur;
        cur = next;
    }
    Contour { points }
}

/// Rec. 601 luma of an RGB24 buffer.
pub(crate) fn rgb_to_luma(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(3)
        .map(|px| {
            let weighted = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
            ((weighted + 500) / 1000) as u8
        })
        .collect()
}
