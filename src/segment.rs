//! Background segmentation for a single board cell.
//!
//! The segmenter runs a fixed pipeline of named stages, each a pure
//! function from one mask snapshot to the next:
//!
//! 1. ring background estimate (trimmed median of the outer border)
//! 2. seeded flood fill from the four edges (pass 1)
//! 3. k-means cluster refinement of the background model (pass 2)
//! 4. rail sweep for resistant thin grid-line remnants
//! 5. degenerate-coverage recovery
//!
//! Foreground is 255 in the mask, background 0. A degenerate result is
//! recovered into a low-quality mask rather than reported as an error.

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::morphology::{dilate, erode};
use log::debug;
use std::collections::VecDeque;

type IntegralImage = ImageBuffer<Luma<u64>, Vec<u64>>;

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Per-row/column luma standard deviation below which a margin counts as
/// uniform during degenerate recovery.
const UNIFORM_STD: f64 = 6.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentParams {
    /// Width of the outer border ring sampled for the background estimate.
    pub ring_band: u32,
    /// Color distance to the ring estimate below which a pixel may seed
    /// the background flood.
    pub color_tol: f32,
    /// 3x3 luma variance above which a pixel is considered textured and
    /// never seeds the background.
    pub var_threshold: f64,
    /// HSV saturation above which a pixel never seeds the background.
    pub sat_threshold: f32,
    /// Cluster radius = max(color_tol, alpha_mad * MAD + beta).
    pub alpha_mad: f32,
    pub beta: f32,
    /// Fraction of ring-colored pixels a rail row/column needs before it
    /// is blanked.
    pub rail_match_frac: f32,
}

impl Default for SegmentParams {
    fn default() -> SegmentParams {
        SegmentParams {
            ring_band: 2,
            color_tol: 12.0,
            var_threshold: 140.0,
            sat_threshold: 0.30,
            alpha_mad: 2.5,
            beta: 4.0,
            rail_match_frac: 0.72,
        }
    }
}

impl SegmentParams {
    /// Scale the color tolerance from the tuning store's `bg_sigma` knob.
    pub fn with_color_tol(mut self, tol: f32) -> SegmentParams {
        if tol > 0.0 {
            self.color_tol = tol;
        }
        self
    }
}

/// Result of segmenting one cell.
pub struct Segmentation {
    /// Mask after the edge flood only, kept for diagnostics.
    pub pass1: GrayImage,
    /// Final foreground mask.
    pub mask: GrayImage,
    /// Estimated background color, reused by padding/compositing.
    pub bg: Rgb<u8>,
}

/// Segment a square cell into foreground sprite and board background.
pub fn segment(cell: &RgbaImage, params: &SegmentParams) -> Segmentation {
    let (w, h) = cell.dimensions();
    if w < 8 || h < 8 {
        // too small to model a background ring; treat everything as sprite
        return Segmentation {
            pass1: GrayImage::from_pixel(w.max(1), h.max(1), Luma([FOREGROUND])),
            mask: GrayImage::from_pixel(w.max(1), h.max(1), Luma([FOREGROUND])),
            bg: Rgb([0, 0, 0]),
        };
    }

    let luma = luma_image(cell);
    let integral: IntegralImage = integral_image::<_, u64>(&luma);
    let integral_sq: IntegralImage = integral_squared_image::<_, u64>(&luma);

    let bg = ring_background(cell, params.ring_band);
    let seeds = seed_background(cell, &integral, &integral_sq, bg, params);
    let pass1 = flood_from_edges(w, h, &seeds);

    let mut mask = pass1.clone();
    if let Some(clusters) = background_clusters(cell, &mask, 3, params) {
        let refined_seeds = cluster_seeds(cell, &clusters, params);
        let mut refined = flood_from_edges(w, h, &refined_seeds);
        force_cluster_borders(cell, &mut refined, &clusters);
        mask = refined;
    }

    mask = rail_sweep(cell, mask, bg, &integral, &integral_sq, params);
    mask = recover_degenerate(mask, &integral, &integral_sq);

    Segmentation { pass1, mask, bg }
}

/// Fraction of mask pixels that are foreground.
pub fn coverage(mask: &GrayImage) -> f32 {
    let total = (mask.width() * mask.height()).max(1);
    let fg = mask.pixels().filter(|p| p.0[0] == FOREGROUND).count();
    fg as f32 / total as f32
}

fn luma_image(cell: &RgbaImage) -> GrayImage {
    let (w, h) = cell.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let p = cell.get_pixel(x, y);
        Luma([luma(p.0[0], p.0[1], p.0[2]) as u8])
    })
}

fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32
}

fn saturation(r: u8, g: u8, b: u8) -> f32 {
    let max = r.max(g).max(b) as f32;
    let min = r.min(g).min(b) as f32;
    if max <= 0.0 {
        0.0
    } else {
        (max - min) / max
    }
}

fn color_dist(p: &image::Rgba<u8>, c: Rgb<u8>) -> f32 {
    let dr = p.0[0] as f32 - c.0[0] as f32;
    let dg = p.0[1] as f32 - c.0[1] as f32;
    let db = p.0[2] as f32 - c.0[2] as f32;
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Estimate the board color as a per-channel trimmed median of the outer
/// `band` pixels.
fn ring_background(cell: &RgbaImage, band: u32) -> Rgb<u8> {
    let (w, h) = cell.dimensions();
    let band = band.max(1).min(w / 2).min(h / 2);
    let mut channels: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    let mut push = |x: u32, y: u32| {
        let p = cell.get_pixel(x, y);
        for c in 0..3 {
            channels[c].push(p.0[c]);
        }
    };
    for x in 0..w {
        for t in 0..band {
            push(x, t);
            push(x, h - 1 - t);
        }
    }
    for y in band..h - band {
        for t in 0..band {
            push(t, y);
            push(w - 1 - t, y);
        }
    }
    let mut out = [0u8; 3];
    for c in 0..3 {
        channels[c].sort_unstable();
        let n = channels[c].len();
        let trim = n / 10;
        let mid = trim + (n - 2 * trim) / 2;
        out[c] = channels[c][mid.min(n - 1)];
    }
    Rgb(out)
}

/// This is a modified copy of [imageproc::integral_image::variance]().
fn variance(
    integral: &IntegralImage,
    integral_sq: &IntegralImage,
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
) -> f64 {
    let n = (right - left + 1) as f64 * (bottom - top + 1) as f64;
    let sum_sq = sum_image_pixels(integral_sq, left, top, right, bottom)[0];
    let sum = sum_image_pixels(integral, left, top, right, bottom)[0];
    (sum_sq as f64 - (sum as f64).powi(2) / n) / n
}

fn window_variance(
    integral: &IntegralImage,
    integral_sq: &IntegralImage,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
) -> f64 {
    let left = x.saturating_sub(1);
    let top = y.saturating_sub(1);
    let right = (x + 1).min(w - 1);
    let bottom = (y + 1).min(h - 1);
    variance(integral, integral_sq, left, top, right, bottom)
}

/// Pass-1 seeding: a pixel may belong to the background when it is close
/// to the ring color, locally flat, and unsaturated.
fn seed_background(
    cell: &RgbaImage,
    integral: &IntegralImage,
    integral_sq: &IntegralImage,
    bg: Rgb<u8>,
    params: &SegmentParams,
) -> Vec<bool> {
    let (w, h) = cell.dimensions();
    let mut seeds = vec![false; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let p = cell.get_pixel(x, y);
            if color_dist(p, bg) > params.color_tol {
                continue;
            }
            if saturation(p.0[0], p.0[1], p.0[2]) >= params.sat_threshold {
                continue;
            }
            if window_variance(integral, integral_sq, x, y, w, h) >= params.var_threshold {
                continue;
            }
            seeds[(y * w + x) as usize] = true;
        }
    }
    seeds
}

/// 4-connected flood from all four edges through seeded pixels. The
/// unreached complement becomes the foreground mask.
fn flood_from_edges(w: u32, h: u32, seeds: &[bool]) -> GrayImage {
    let mut reached = vec![false; (w * h) as usize];
    let mut queue: VecDeque<(u32, u32)> = VecDeque::new();
    let mut try_push = |x: u32, y: u32, reached: &mut Vec<bool>, queue: &mut VecDeque<(u32, u32)>| {
        let i = (y * w + x) as usize;
        if seeds[i] && !reached[i] {
            reached[i] = true;
            queue.push_back((x, y));
        }
    };
    for x in 0..w {
        try_push(x, 0, &mut reached, &mut queue);
        try_push(x, h - 1, &mut reached, &mut queue);
    }
    for y in 0..h {
        try_push(0, y, &mut reached, &mut queue);
        try_push(w - 1, y, &mut reached, &mut queue);
    }
    while let Some((x, y)) = queue.pop_front() {
        if x > 0 {
            try_push(x - 1, y, &mut reached, &mut queue);
        }
        if x + 1 < w {
            try_push(x + 1, y, &mut reached, &mut queue);
        }
        if y > 0 {
            try_push(x, y - 1, &mut reached, &mut queue);
        }
        if y + 1 < h {
            try_push(x, y + 1, &mut reached, &mut queue);
        }
    }
    GrayImage::from_fn(w, h, |x, y| {
        if reached[(y * w + x) as usize] {
            Luma([BACKGROUND])
        } else {
            Luma([FOREGROUND])
        }
    })
}

#[derive(Debug, Clone, Copy)]
struct Cluster {
    center: [f32; 3],
    radius: f32,
}

impl Cluster {
    fn dist(&self, p: &image::Rgba<u8>) -> f32 {
        let dr = p.0[0] as f32 - self.center[0];
        let dg = p.0[1] as f32 - self.center[1];
        let db = p.0[2] as f32 - self.center[2];
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

fn passes_clusters(clusters: &[Cluster], p: &image::Rgba<u8>) -> bool {
    clusters.iter().any(|c| c.dist(p) <= c.radius)
}

/// K-means over the pass-1 background pixels. Each surviving cluster gets
/// an acceptance radius derived from its mean absolute deviation.
fn background_clusters(
    cell: &RgbaImage,
    mask: &GrayImage,
    k: usize,
    params: &SegmentParams,
) -> Option<Vec<Cluster>> {
    let (w, h) = cell.dimensions();
    let mut samples: Vec<[f32; 3]> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if mask.get_pixel(x, y).0[0] == BACKGROUND {
                let p = cell.get_pixel(x, y);
                samples.push([p.0[0] as f32, p.0[1] as f32, p.0[2] as f32]);
            }
        }
    }
    if samples.len() < 16 {
        return None;
    }

    // init centers at luma percentiles so light and dark board tones both
    // get a seed
    let mut by_luma: Vec<usize> = (0..samples.len()).collect();
    by_luma.sort_by(|&a, &b| {
        let la = samples[a][0] * 0.2126 + samples[a][1] * 0.7152 + samples[a][2] * 0.0722;
        let lb = samples[b][0] * 0.2126 + samples[b][1] * 0.7152 + samples[b][2] * 0.0722;
        la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut centers: Vec<[f32; 3]> = (0..k)
        .map(|i| samples[by_luma[(2 * i + 1) * samples.len() / (2 * k)]])
        .collect();

    let mut assignment = vec![0usize; samples.len()];
    for _ in 0..8 {
        let mut moved = false;
        for (i, s) in samples.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = f32::MAX;
            for (j, c) in centers.iter().enumerate() {
                let d = sq_dist(s, c);
                if d < best_d {
                    best_d = d;
                    best = j;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                moved = true;
            }
        }
        let mut sums = vec![[0.0f32; 3]; k];
        let mut counts = vec![0usize; k];
        for (i, s) in samples.iter().enumerate() {
            let j = assignment[i];
            for c in 0..3 {
                sums[j][c] += s[c];
            }
            counts[j] += 1;
        }
        for j in 0..k {
            if counts[j] > 0 {
                for c in 0..3 {
                    centers[j][c] = sums[j][c] / counts[j] as f32;
                }
            }
        }
        if !moved {
            break;
        }
    }

    let mut clusters = Vec::new();
    for j in 0..k {
        let dists: Vec<f32> = samples
            .iter()
            .zip(&assignment)
            .filter(|(_, &a)| a == j)
            .map(|(s, _)| sq_dist(s, &centers[j]).sqrt())
            .collect();
        if dists.is_empty() {
            continue;
        }
        let mean = dists.iter().sum::<f32>() / dists.len() as f32;
        let mad = dists.iter().map(|d| (d - mean).abs()).sum::<f32>() / dists.len() as f32;
        let radius = params
            .color_tol
            .max(params.alpha_mad * mad + params.beta);
        clusters.push(Cluster {
            center: centers[j],
            radius,
        });
    }
    Some(clusters)
}

fn sq_dist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    d0 * d0 + d1 * d1 + d2 * d2
}

/// Pass-2 seeding from the clustered background model.
fn cluster_seeds(cell: &RgbaImage, clusters: &[Cluster], params: &SegmentParams) -> Vec<bool> {
    let (w, h) = cell.dimensions();
    let mut seeds = vec![false; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let p = cell.get_pixel(x, y);
            if saturation(p.0[0], p.0[1], p.0[2]) >= params.sat_threshold {
                continue;
            }
            if passes_clusters(clusters, p) {
                seeds[(y * w + x) as usize] = true;
            }
        }
    }
    seeds
}

/// Force a border row/column to background when at least 80% of its
/// pixels pass the cluster test. Closes thin rails the flood could not
/// enter because of a few blocking pixels.
fn force_cluster_borders(cell: &RgbaImage, mask: &mut GrayImage, clusters: &[Cluster]) {
    let (w, h) = cell.dimensions();
    let row_passes = |y: u32| {
        let hits = (0..w)
            .filter(|&x| passes_clusters(clusters, cell.get_pixel(x, y)))
            .count();
        hits as f32 >= 0.8 * w as f32
    };
    let col_passes = |x: u32| {
        let hits = (0..h)
            .filter(|&y| passes_clusters(clusters, cell.get_pixel(x, y)))
            .count();
        hits as f32 >= 0.8 * h as f32
    };
    for &y in &[0, h - 1] {
        if row_passes(y) {
            for x in 0..w {
                mask.put_pixel(x, y, Luma([BACKGROUND]));
            }
        }
    }
    for &x in &[0, w - 1] {
        if col_passes(x) {
            for y in 0..h {
                mask.put_pixel(x, y, Luma([BACKGROUND]));
            }
        }
    }
}

/// Up to three passes blanking near-uniform outer rows/columns that match
/// the ring color on enough pixels. Stops early when a pass changes
/// nothing.
fn rail_sweep(
    cell: &RgbaImage,
    mut mask: GrayImage,
    bg: Rgb<u8>,
    integral: &IntegralImage,
    integral_sq: &IntegralImage,
    params: &SegmentParams,
) -> GrayImage {
    let (w, h) = cell.dimensions();
    let depth = 3.min(w / 2).min(h / 2);
    let tol = params.color_tol * 1.5;

    for _ in 0..3 {
        let mut changed = false;
        for d in 0..depth {
            for &y in &[d, h - 1 - d] {
                if !row_has_fg(&mask, y) {
                    continue;
                }
                let hits = (0..w)
                    .filter(|&x| color_dist(cell.get_pixel(x, y), bg) <= tol)
                    .count();
                let var = variance(integral, integral_sq, 0, y, w - 1, y);
                if hits as f32 >= params.rail_match_frac * w as f32
                    && var < params.var_threshold
                {
                    for x in 0..w {
                        mask.put_pixel(x, y, Luma([BACKGROUND]));
                    }
                    changed = true;
                }
            }
            for &x in &[d, w - 1 - d] {
                if !col_has_fg(&mask, x) {
                    continue;
                }
                let hits = (0..h)
                    .filter(|&y| color_dist(cell.get_pixel(x, y), bg) <= tol)
                    .count();
                let var = variance(integral, integral_sq, x, 0, x, h - 1);
                if hits as f32 >= params.rail_match_frac * h as f32
                    && var < params.var_threshold
                {
                    for y in 0..h {
                        mask.put_pixel(x, y, Luma([BACKGROUND]));
                    }
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    mask
}

fn row_has_fg(mask: &GrayImage, y: u32) -> bool {
    (0..mask.width()).any(|x| mask.get_pixel(x, y).0[0] == FOREGROUND)
}

fn col_has_fg(mask: &GrayImage, x: u32) -> bool {
    (0..mask.height()).any(|y| mask.get_pixel(x, y).0[0] == FOREGROUND)
}

/// When coverage leaves [5%, 95%] the mask carries no usable shape.
/// Rebuild it by trimming uniform-luma margins from the full cell and
/// regrowing once (dilate + erode).
fn recover_degenerate(
    mask: GrayImage,
    integral: &IntegralImage,
    integral_sq: &IntegralImage,
) -> GrayImage {
    let cov = coverage(&mask);
    if (0.05..=0.95).contains(&cov) {
        return mask;
    }
    let (w, h) = mask.dimensions();
    debug!("degenerate mask coverage {:.3}, trimming uniform margins", cov);

    let row_uniform =
        |y: u32| variance(integral, integral_sq, 0, y, w - 1, y).sqrt() < UNIFORM_STD;
    let col_uniform =
        |x: u32| variance(integral, integral_sq, x, 0, x, h - 1).sqrt() < UNIFORM_STD;

    let (max_tx, max_ty) = (w / 4, h / 4);
    let mut left = 0;
    while left < max_tx && col_uniform(left) {
        left += 1;
    }
    let mut right = 0;
    while right < max_tx && col_uniform(w - 1 - right) {
        right += 1;
    }
    let mut top = 0;
    while top < max_ty && row_uniform(top) {
        top += 1;
    }
    let mut bottom = 0;
    while bottom < max_ty && row_uniform(h - 1 - bottom) {
        bottom += 1;
    }

    let mut out = GrayImage::from_pixel(w, h, Luma([BACKGROUND]));
    for y in top..h - bottom {
        for x in left..w - right {
            out.put_pixel(x, y, Luma([FOREGROUND]));
        }
    }
    erode(&dilate(&out, Norm::LInf, 1), Norm::LInf, 1)
}
