//! Diagnostic helpers for inspecting extracted crops.

use crate::crops::TileCrop;
use crate::error::Error;
use crate::geometry::GRID_CELLS;
use image::{Rgba, RgbaImage};
use std::fs;
use std::path::Path;

const GAP: u32 = 2;

/// Stitch tile outputs into one collage, five per row, for eyeballing a
/// whole board at once.
pub fn collage(crops: &[TileCrop]) -> RgbaImage {
    let tile = crops
        .first()
        .map(|c| c.output.width())
        .unwrap_or(1)
        .max(1);
    let cols = GRID_CELLS;
    let rows = (crops.len() as u32 + cols - 1) / cols.max(1);
    let width = cols * tile + (cols + 1) * GAP;
    let height = rows.max(1) * tile + (rows.max(1) + 1) * GAP;
    let mut out = RgbaImage::from_pixel(width, height, Rgba([32, 32, 32, 255]));
    for (i, crop) in crops.iter().enumerate() {
        let col = i as u32 % cols;
        let row = i as u32 / cols;
        let ox = GAP + col * (tile + GAP);
        let oy = GAP + row * (tile + GAP);
        for (x, y, p) in crop.output.enumerate_pixels() {
            if x < tile && y < tile {
                out.put_pixel(ox + x, oy + y, *p);
            }
        }
    }
    out
}

/// Write each tile's composited output and mask under `dir` as
/// `tile_<row>_<col>.png` / `tile_<row>_<col>_mask.png`.
pub fn save_crops<P: AsRef<Path>>(crops: &[TileCrop], dir: P) -> Result<(), Error> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    for crop in crops {
        let stem = format!("tile_{}_{}", crop.row, crop.col);
        crop.output.save(dir.join(format!("{}.png", stem)))?;
        crop.mask.save(dir.join(format!("{}_mask.png", stem)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crops::{extract_crops, CropOptions};
    use crate::geometry::FractionBox;

    fn crops() -> Vec<TileCrop> {
        let img = RgbaImage::from_pixel(250, 250, Rgba([139, 139, 139, 255]));
        let geom = FractionBox::centered(250, 250).to_geometry(250, 250);
        let options = CropOptions {
            out_size: 32,
            ..CropOptions::default()
        };
        extract_crops(&img, &geom, &options)
    }

    #[test]
    fn collage_has_expected_dimensions() {
        let c = collage(&crops());
        // 5 tiles of 32px plus 6 gaps of 2px per axis
        assert_eq!(c.dimensions(), (172, 172));
    }

    #[test]
    fn collage_of_nothing_is_empty() {
        let c = collage(&[]);
        assert!(c.width() >= 1 && c.height() >= 1);
    }

    #[test]
    fn crops_are_written_to_disk() {
        let dir = std::env::temp_dir().join(format!("bingo-ocr-crops-{}", std::process::id()));
        let crops = crops();
        save_crops(&crops, &dir).unwrap();
        assert!(dir.join("tile_0_0.png").exists());
        assert!(dir.join("tile_4_4_mask.png").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
