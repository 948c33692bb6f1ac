use image::imageops::{crop_imm, resize, FilterType};
use image::RgbaImage;
use log::debug;

/// Cells per board axis. The board is always 5x5.
pub const GRID_CELLS: u32 = 5;

/// Longest edge the region of interest is downsampled to before peak search.
const MAX_ANALYSIS_EDGE: u32 = 640;

/// A user-adjustable board estimate in [0,1] coordinates relative to the
/// screenshot. The tuner UI keeps it square; [FractionBox::to_geometry]
/// enforces that again by taking the smaller side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FractionBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl FractionBox {
    /// The centered inscribed square, the default when no tuner box was saved.
    pub fn centered(image_width: u32, image_height: u32) -> FractionBox {
        let (w, h) = (image_width.max(1) as f32, image_height.max(1) as f32);
        let side = w.min(h);
        FractionBox {
            left: (w - side) / 2.0 / w,
            top: (h - side) / 2.0 / h,
            width: side / w,
            height: side / h,
        }
    }

    /// Convert to pixel space, clamped into the image bounds.
    pub fn to_geometry(&self, image_width: u32, image_height: u32) -> GridGeometry {
        let (w, h) = (image_width.max(1) as f32, image_height.max(1) as f32);
        let size = (self.width * w).min(self.height * h);
        clamp_geometry(
            GridGeometry {
                x: self.left * w,
                y: self.top * h,
                size,
            },
            image_width,
            image_height,
        )
    }
}

/// The located board: top-left corner and side length of the 5x5 square,
/// in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

impl GridGeometry {
    /// Side length of a single cell.
    pub fn cell_pitch(&self) -> f32 {
        self.size / GRID_CELLS as f32
    }

    /// Pixel bounds `(x, y, side)` of the cell at `row`, `col`.
    pub fn cell(&self, row: u32, col: u32) -> (f32, f32, f32) {
        let pitch = self.cell_pitch();
        (
            self.x + col as f32 * pitch,
            self.y + row as f32 * pitch,
            pitch,
        )
    }
}

fn clamp_geometry(mut g: GridGeometry, image_width: u32, image_height: u32) -> GridGeometry {
    let (w, h) = (image_width.max(1) as f32, image_height.max(1) as f32);
    g.size = g.size.min(w).min(h).max(1.0);
    g.x = g.x.max(0.0).min(w - g.size);
    g.y = g.y.max(0.0).min(h - g.size);
    g
}

/// Locate the board square by refining a coarse box with edge-projection
/// peak detection.
///
/// The region of interest (coarse box plus a small pad) is downsampled,
/// row and column edge-energy profiles are extracted and smoothed, and the
/// six strongest well-separated peaks per axis are taken as grid lines.
/// The outermost peaks define the board; pitch is equalized between the
/// axes by symmetrically growing the shorter span.
///
/// If either axis yields fewer than six peaks the coarse box is returned
/// unchanged. That is graceful degradation, not an error: a hand-tuned box
/// is still usable as-is.
pub fn locate_grid(img: &RgbaImage, coarse: &FractionBox) -> GridGeometry {
    let (iw, ih) = img.dimensions();
    let fallback = coarse.to_geometry(iw, ih);
    if iw < 8 || ih < 8 {
        return fallback;
    }

    // region of interest: the coarse box plus ~4% pad on each side
    let pad = 0.04 * fallback.size;
    let rx = (fallback.x - pad).max(0.0).floor();
    let ry = (fallback.y - pad).max(0.0).floor();
    let rr = (fallback.x + fallback.size + pad).min(iw as f32).ceil();
    let rb = (fallback.y + fallback.size + pad).min(ih as f32).ceil();
    let (rw, rh) = ((rr - rx) as u32, (rb - ry) as u32);
    if rw < 8 || rh < 8 {
        return fallback;
    }
    let roi = crop_imm(img, rx as u32, ry as u32, rw, rh).to_image();

    // downsample for speed; peak positions scale back up afterwards
    let long_edge = rw.max(rh);
    let (small, sx, sy) = if long_edge > MAX_ANALYSIS_EDGE {
        let s = MAX_ANALYSIS_EDGE as f32 / long_edge as f32;
        let sw = ((rw as f32 * s).round() as u32).max(8);
        let sh = ((rh as f32 * s).round() as u32).max(8);
        let small = resize(&roi, sw, sh, FilterType::Triangle);
        (small, rw as f32 / sw as f32, rh as f32 / sh as f32)
    } else {
        (roi, 1.0, 1.0)
    };
    let (sw, sh) = small.dimensions();

    let mut col_energy = edge_profile(&small, Axis::X);
    let mut row_energy = edge_profile(&small, Axis::Y);
    col_energy = box_smooth(&col_energy, (sw as usize / 100).max(1));
    row_energy = box_smooth(&row_energy, (sh as usize / 100).max(1));

    let wanted = (GRID_CELLS + 1) as usize;
    let col_peaks = pick_peaks(&col_energy, wanted, 0.6 * sw as f32 / GRID_CELLS as f32);
    let row_peaks = pick_peaks(&row_energy, wanted, 0.6 * sh as f32 / GRID_CELLS as f32);
    if col_peaks.len() < wanted || row_peaks.len() < wanted {
        debug!(
            "grid refine found {} column / {} row peaks, keeping coarse box",
            col_peaks.len(),
            row_peaks.len()
        );
        return fallback;
    }

    // outermost peaks, mapped back to full-image pixels
    let cmin = *col_peaks.iter().min().unwrap_or(&0);
    let cmax = *col_peaks.iter().max().unwrap_or(&0);
    let rmin = *row_peaks.iter().min().unwrap_or(&0);
    let rmax = *row_peaks.iter().max().unwrap_or(&0);
    let mut x0 = rx + cmin as f32 * sx;
    let mut x1 = rx + cmax as f32 * sx;
    let mut y0 = ry + rmin as f32 * sy;
    let mut y1 = ry + rmax as f32 * sy;

    // equalize cell pitch: grow the shorter span around its center,
    // never shrink the longer one
    let pitch_h = (x1 - x0) / GRID_CELLS as f32;
    let pitch_v = (y1 - y0) / GRID_CELLS as f32;
    if (pitch_h - pitch_v).abs() * GRID_CELLS as f32 > 0.5 {
        if pitch_h < pitch_v {
            let c = (x0 + x1) / 2.0;
            let half = (y1 - y0) / 2.0;
            x0 = c - half;
            x1 = c + half;
        } else {
            let c = (y0 + y1) / 2.0;
            let half = (x1 - x0) / 2.0;
            y0 = c - half;
            y1 = c + half;
        }
    }

    clamp_geometry(
        GridGeometry {
            x: x0,
            y: y0,
            size: (x1 - x0).max(y1 - y0).max(1.0),
        },
        iw,
        ih,
    )
}

enum Axis {
    X,
    Y,
}

/// Per-row or per-column edge energy: sum of channel-wise absolute
/// differences between adjacent pixels along the axis.
fn edge_profile(img: &RgbaImage, axis: Axis) -> Vec<f32> {
    let (w, h) = img.dimensions();
    match axis {
        Axis::X => {
            let mut out = vec![0.0f32; w as usize];
            for y in 0..h {
                for x in 0..w.saturating_sub(1) {
                    let a = img.get_pixel(x, y);
                    let b = img.get_pixel(x + 1, y);
                    let mut d = 0i32;
                    for c in 0..3 {
                        d += (a.0[c] as i32 - b.0[c] as i32).abs();
                    }
                    out[x as usize] += d as f32;
                }
            }
            out
        }
        Axis::Y => {
            let mut out = vec![0.0f32; h as usize];
            for y in 0..h.saturating_sub(1) {
                for x in 0..w {
                    let a = img.get_pixel(x, y);
                    let b = img.get_pixel(x, y + 1);
                    let mut d = 0i32;
                    for c in 0..3 {
                        d += (a.0[c] as i32 - b.0[c] as i32).abs();
                    }
                    out[y as usize] += d as f32;
                }
            }
            out
        }
    }
}

/// Box filter with clamped window ends.
fn box_smooth(profile: &[f32], radius: usize) -> Vec<f32> {
    let n = profile.len();
    let mut prefix = vec![0.0f32; n + 1];
    for i in 0..n {
        prefix[i + 1] = prefix[i] + profile[i];
    }
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(n);
            (prefix[hi] - prefix[lo]) / (hi - lo) as f32
        })
        .collect()
}

/// Greedily pick up to `wanted` local maxima, highest energy first, each at
/// least `min_sep` away from every already-accepted peak. Candidates with
/// equal energy keep extraction (index) order.
fn pick_peaks(profile: &[f32], wanted: usize, min_sep: f32) -> Vec<usize> {
    let n = profile.len();
    let mut candidates: Vec<usize> = (0..n)
        .filter(|&i| {
            let v = profile[i];
            if v <= 0.0 {
                return false;
            }
            let left_ok = i == 0 || profile[i - 1] <= v;
            let right_ok = i + 1 == n || profile[i + 1] <= v;
            left_ok && right_ok
        })
        .collect();
    // stable sort keeps index order for equal energies
    candidates.sort_by(|&a, &b| {
        profile[b]
            .partial_cmp(&profile[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut peaks: Vec<usize> = Vec::with_capacity(wanted);
    for i in candidates {
        if peaks
            .iter()
            .all(|&p| (p as f32 - i as f32).abs() >= min_sep)
        {
            peaks.push(i);
            if peaks.len() == wanted {
                break;
            }
        }
    }
    peaks
}
