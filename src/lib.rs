//! A library that reads a 5x5 bingo card from a screenshot
//!
//! Given a screenshot and a coarse board estimate, this library locates
//! the card square, cuts it into 25 background-stripped tile crops, and
//! matches each tile against a precomputed sprite index — either by
//! cosine search over embedding vectors from an external encoder, or by
//! perceptual hashes when no encoder is available.
//!
//! # Basic usage
//! ```no_run
//! # use bingo_ocr::{Analyzer, CancelToken, Error, FractionBox, IndexCache, TileEncoder, TuningStore};
//! # use std::sync::Arc;
//! # struct MyEncoder;
//! # impl TileEncoder for MyEncoder {
//! #     fn embed(&self, _tile: &image::RgbaImage) -> Result<Vec<f32>, Error> { Ok(vec![0.0; 512]) }
//! # }
//! let screenshot = image::open("card.png")?.into_rgba8();
//! let coarse = FractionBox::centered(screenshot.width(), screenshot.height());
//! let analyzer = Analyzer::new(
//!     MyEncoder,
//!     Arc::new(IndexCache::new()),
//!     Arc::new(TuningStore::new()),
//! );
//! let analysis = analyzer.analyze(
//!     &screenshot,
//!     &coarse,
//!     || {
//!         let text = std::fs::read_to_string("sprite_index_clip.json")?;
//!         bingo_ocr::parse_index(&text)
//!     },
//!     &CancelToken::new(),
//!     |pct| println!("{}%", pct),
//! )?;
//! for (i, m) in analysis.matches.iter().enumerate() {
//!     match &m.ref_key {
//!         Some(key) => println!("tile {}: {} ({:.2})", i, key, m.score),
//!         None => println!("tile {}: no match", i),
//!     }
//! }
//! # Ok::<(), Error>(())
//! ```

mod crops;
mod error;
mod geometry;
mod index;
mod matcher;
mod phash;
mod recognizer;
mod segment;
mod tuning;
mod utils;

pub use crops::{crop_tile, extract_crops, CropBox, CropOptions, TileCrop};
pub use error::Error;
pub use geometry::{locate_grid, FractionBox, GridGeometry, GRID_CELLS};
pub use index::{parse_index, IndexCache, IndexItem, ReferenceIndex};
pub use matcher::{l2_normalize, match_embedding, MatchResult};
pub use phash::{
    hamming, match_signature, ref_signature, signature, ChannelHashes, HashMatchConfig,
    RefSignature, RgbHashes, TileSignature,
};
pub use recognizer::{
    analyze_with_hashes, Analysis, Analyzer, CancelToken, TileEncoder, TILE_COUNT,
};
pub use segment::{segment, SegmentParams, Segmentation};
pub use tuning::{Tuning, TuningStore};
pub use utils::{collage, save_crops};
