//! The analysis pipeline: locate the board, extract the 25 tiles, match
//! each one, and report incremental progress.

use crate::crops::{extract_crops, CropOptions, TileCrop};
use crate::error::Error;
use crate::geometry::{locate_grid, FractionBox, GridGeometry, GRID_CELLS};
use crate::index::{IndexCache, ReferenceIndex};
use crate::matcher::{l2_normalize, log_top_candidates, match_embedding, MatchResult};
use crate::phash::{match_signature, signature, HashMatchConfig, RefSignature};
use crate::segment::SegmentParams;
use crate::tuning::{Tuning, TuningStore};
use image::RgbaImage;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tiles per board.
pub const TILE_COUNT: u32 = GRID_CELLS * GRID_CELLS;

/// Deterministic jitter directions for multi-crop sampling, tried in
/// order after the unshifted crop.
const JITTER_DIRS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, -1),
    (1, -1),
    (-1, 1),
];

/// External feature encoder for composited tiles.
///
/// The returned vector is not required to be normalized; the analyzer
/// normalizes before search.
pub trait TileEncoder {
    fn embed(&self, tile: &RgbaImage) -> Result<Vec<f32>, Error>;
}

/// Cooperative cancellation flag, checked between tiles. Cloning shares
/// the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of one full-board analysis: the located geometry and one
/// [MatchResult] per tile, row-major.
pub struct Analysis {
    pub geometry: GridGeometry,
    pub matches: Vec<MatchResult>,
}

/// Embedding-based board analyzer. Holds the encoder, the shared index
/// cache and the tuning store.
pub struct Analyzer<E> {
    encoder: E,
    cache: Arc<IndexCache>,
    tuning: Arc<TuningStore>,
}

impl<E: TileEncoder> Analyzer<E> {
    pub fn new(encoder: E, cache: Arc<IndexCache>, tuning: Arc<TuningStore>) -> Analyzer<E> {
        Analyzer {
            encoder,
            cache,
            tuning,
        }
    }

    /// Analyze one screenshot.
    ///
    /// `load_index` runs only if the shared cache is cold (single-flight).
    /// Tiles are processed sequentially in row-major order; `progress`
    /// receives a monotonic percentage after each tile and reaches 100 on
    /// completion. Tuning is snapshotted once up front so a live change
    /// cannot mix parameters within one run.
    pub fn analyze<L, P>(
        &self,
        screenshot: &RgbaImage,
        coarse: &FractionBox,
        load_index: L,
        cancel: &CancelToken,
        mut progress: P,
    ) -> Result<Analysis, Error>
    where
        L: FnOnce() -> Result<ReferenceIndex, Error>,
        P: FnMut(u32),
    {
        let tuning = self.tuning.snapshot();
        cancel.check()?;
        let index = self.cache.get_or_load(load_index)?;
        cancel.check()?;

        let geometry = locate_grid(screenshot, coarse);
        let options = crop_options(&tuning);
        let crops = extract_crops(screenshot, &geometry, &options);

        let mut matches = Vec::with_capacity(crops.len());
        for (i, crop) in crops.iter().enumerate() {
            cancel.check()?;
            let result = self.match_tile(i, crop, &tuning, &index)?;
            matches.push(result);
            progress(progress_percent(i));
        }

        info!(
            "analysis complete: {}/{} tiles matched",
            matches.iter().filter(|m| m.is_match()).count(),
            matches.len()
        );
        Ok(Analysis { geometry, matches })
    }

    fn match_tile(
        &self,
        tile: usize,
        crop: &TileCrop,
        tuning: &Tuning,
        index: &ReferenceIndex,
    ) -> Result<MatchResult, Error> {
        let mut best = self.match_image(tile, &crop.output, tuning, index)?;
        // extra jittered crops; the best-scoring variant wins
        let amp = (tuning.jitter_frac * crop.crop_box.side as f32).round() as i32;
        if amp > 0 {
            for &(dx, dy) in JITTER_DIRS
                .iter()
                .take(tuning.multi_crop.saturating_sub(1) as usize)
            {
                let variant = crop.render_jittered(dx * amp, dy * amp);
                let result = self.match_image(tile, &variant, tuning, index)?;
                if result.score > best.score {
                    best = result;
                }
            }
        }
        Ok(best)
    }

    fn match_image(
        &self,
        tile: usize,
        image: &RgbaImage,
        tuning: &Tuning,
        index: &ReferenceIndex,
    ) -> Result<MatchResult, Error> {
        let mut query = self.encoder.embed(image)?;
        l2_normalize(&mut query);
        if tuning.debug_top_k > 0 {
            log_top_candidates(tile, &query, index, tuning.debug_top_k);
        }
        match_embedding(&query, index, tuning.score_threshold)
    }
}

/// Analyze with the perceptual-hash fallback matcher instead of an
/// embedding encoder. Reference signatures are precomputed by the caller
/// (hashing reference images requires fetching them, which is not this
/// crate's job).
pub fn analyze_with_hashes<P>(
    screenshot: &RgbaImage,
    coarse: &FractionBox,
    refs: &[RefSignature],
    config: &HashMatchConfig,
    tuning: &Tuning,
    cancel: &CancelToken,
    mut progress: P,
) -> Result<Analysis, Error>
where
    P: FnMut(u32),
{
    cancel.check()?;
    let geometry = locate_grid(screenshot, coarse);
    let options = crop_options(tuning);
    let crops = extract_crops(screenshot, &geometry, &options);

    let mut matches = Vec::with_capacity(crops.len());
    for (i, crop) in crops.iter().enumerate() {
        cancel.check()?;
        let sig = signature(&crop.output, true);
        let result =
            match_signature(&sig, refs, config).unwrap_or_else(|| MatchResult::no_match(0.0));
        matches.push(result);
        progress(progress_percent(i));
    }
    Ok(Analysis { geometry, matches })
}

fn crop_options(tuning: &Tuning) -> CropOptions {
    CropOptions {
        inset_pct: tuning.crop_inset_pct,
        segment: SegmentParams::default().with_color_tol(tuning.bg_sigma),
        ..CropOptions::default()
    }
}

/// Percentage after finishing tile `i` (zero-based).
fn progress_percent(i: usize) -> u32 {
    ((100 * (i + 1)) as f32 / TILE_COUNT as f32).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexItem, ReferenceIndex};
    use crate::phash::ref_signature;
    use image::Rgba;

    /// Encoder mapping a tile to its dominant color axis: mean RGB with
    /// the smallest channel subtracted from all three.
    struct ColorEncoder;

    impl TileEncoder for ColorEncoder {
        fn embed(&self, tile: &RgbaImage) -> Result<Vec<f32>, Error> {
            let n = (tile.width() * tile.height()) as f32;
            let mut mean = [0.0f32; 3];
            for p in tile.pixels() {
                for c in 0..3 {
                    mean[c] += p.0[c] as f32;
                }
            }
            for m in mean.iter_mut() {
                *m /= n;
            }
            let lo = mean[0].min(mean[1]).min(mean[2]);
            Ok(mean.iter().map(|m| m - lo).collect())
        }
    }

    const SPRITE_COLORS: [([u8; 3], &str); 3] = [
        ([200, 40, 40], "red"),
        ([40, 200, 40], "green"),
        ([40, 40, 200], "blue"),
    ];

    fn board_screenshot() -> RgbaImage {
        let mut img = RgbaImage::from_pixel(500, 500, Rgba([139, 139, 139, 255]));
        for row in 0..5u32 {
            for col in 0..5u32 {
                let ([r, g, b], _) = SPRITE_COLORS[((row * 5 + col) % 3) as usize];
                for y in 0..30 {
                    for x in 0..30 {
                        img.put_pixel(
                            col * 100 + 35 + x,
                            row * 100 + 35 + y,
                            Rgba([r, g, b, 255]),
                        );
                    }
                }
            }
        }
        img
    }

    fn color_index() -> ReferenceIndex {
        let items = SPRITE_COLORS
            .iter()
            .map(|(_, name)| IndexItem {
                slug: Some(name.to_string()),
                url: Some(format!("{}.png", name)),
                ..IndexItem::default()
            })
            .collect();
        ReferenceIndex {
            dim: 3,
            vectors: vec![
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0,
                0.0, 0.0, 1.0,
            ],
            items,
        }
    }

    fn analyzer() -> Analyzer<ColorEncoder> {
        Analyzer::new(
            ColorEncoder,
            Arc::new(IndexCache::new()),
            Arc::new(TuningStore::new()),
        )
    }

    #[test]
    fn all_tiles_match_their_color() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let analysis = analyzer()
            .analyze(&img, &coarse, || Ok(color_index()), &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(analysis.matches.len(), 25);
        for (i, m) in analysis.matches.iter().enumerate() {
            let (_, expected) = SPRITE_COLORS[i % 3];
            assert_eq!(m.ref_key.as_deref(), Some(expected), "tile {}", i);
            assert!(m.score > 0.9, "tile {} score = {}", i, m.score);
        }
    }

    #[test]
    fn progress_is_monotonic_and_reaches_100() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let mut reported = Vec::new();
        analyzer()
            .analyze(
                &img,
                &coarse,
                || Ok(color_index()),
                &CancelToken::new(),
                |p| reported.push(p),
            )
            .unwrap();
        assert_eq!(reported.len(), 25);
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reported.first(), Some(&4));
        assert_eq!(reported.last(), Some(&100));
    }

    #[test]
    fn cancelled_token_aborts_before_work() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut called = false;
        let result = analyzer().analyze(
            &img,
            &coarse,
            || Ok(color_index()),
            &cancel,
            |_| called = true,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!called);
    }

    #[test]
    fn index_load_failure_propagates() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let result = analyzer().analyze(
            &img,
            &coarse,
            || Err(Error::EmptyIndex),
            &CancelToken::new(),
            |_| {},
        );
        assert!(result.is_err());
    }

    #[test]
    fn multi_crop_still_matches() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let tuning = Arc::new(TuningStore::new());
        tuning.update(|t| {
            t.multi_crop = 3;
            t.jitter_frac = 0.05;
        });
        let analyzer = Analyzer::new(ColorEncoder, Arc::new(IndexCache::new()), tuning);
        let analysis = analyzer
            .analyze(&img, &coarse, || Ok(color_index()), &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(analysis.matches[0].ref_key.as_deref(), Some("red"));
    }

    #[test]
    fn hash_analysis_matches_identical_tiles() {
        let img = board_screenshot();
        let coarse = FractionBox::centered(500, 500);
        let tuning = Tuning::default();

        // reference signatures taken from the first three extracted crops
        let geometry = locate_grid(&img, &coarse);
        let crops = extract_crops(&img, &geometry, &crop_options(&tuning));
        let refs: Vec<RefSignature> = (0..3)
            .map(|i| {
                let (_, name) = SPRITE_COLORS[i % 3];
                ref_signature(name, Some("x.png"), &crops[i].output, true)
            })
            .collect();

        let analysis = analyze_with_hashes(
            &img,
            &coarse,
            &refs,
            &HashMatchConfig::default(),
            &tuning,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        for (i, m) in analysis.matches.iter().enumerate() {
            let (_, expected) = SPRITE_COLORS[i % 3];
            assert_eq!(m.ref_key.as_deref(), Some(expected), "tile {}", i);
        }
    }

    #[test]
    fn progress_percent_covers_25_steps() {
        assert_eq!(progress_percent(0), 4);
        assert_eq!(progress_percent(12), 52);
        assert_eq!(progress_percent(24), 100);
    }
}
