//! Perceptual-hash matching, the fallback path when no embedding encoder
//! is available.
//!
//! A signature is three 64-bit luma hashes (aHash 8x8, dHash 9x8
//! horizontal, dHash 8x9 vertical), optionally paired with the same three
//! hashes per RGB channel. Ranking is by summed Hamming distance over the
//! luma hashes; color distances refine the score only when a candidate
//! carries all nine channel hashes and its color distance stays under an
//! absolute cap.

use crate::matcher::MatchResult;
use image::imageops::{resize, FilterType};
use image::RgbaImage;

const HASH_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHashes {
    pub ahash: u64,
    pub dhash_x: u64,
    pub dhash_y: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbHashes {
    pub r: ChannelHashes,
    pub g: ChannelHashes,
    pub b: ChannelHashes,
}

/// Hashes computed for one query tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSignature {
    pub luma: ChannelHashes,
    pub rgb: Option<RgbHashes>,
}

/// Precomputed hashes for one reference sprite.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSignature {
    pub key: String,
    pub url: Option<String>,
    pub luma: ChannelHashes,
    pub rgb: Option<RgbHashes>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashMatchConfig {
    /// Winner is rejected when its pure luma distance exceeds this.
    pub luma_threshold: u32,
    /// Color distances above this cap are ignored for that candidate.
    pub color_cap: u32,
    /// Weight of the color distance sum blended into the score.
    pub color_weight: f32,
}

impl Default for HashMatchConfig {
    fn default() -> HashMatchConfig {
        HashMatchConfig {
            luma_threshold: 24,
            color_cap: 96,
            color_weight: 0.5,
        }
    }
}

/// Population count of the XOR. Symmetric, zero for equal values.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Luma,
    R,
    G,
    B,
}

impl Channel {
    fn value(self, p: &image::Rgba<u8>) -> f32 {
        match self {
            // BT.709 perceptual grayscale
            Channel::Luma => {
                (0.2126 * p.0[0] as f32 + 0.7152 * p.0[1] as f32 + 0.0722 * p.0[2] as f32).round()
            }
            Channel::R => p.0[0] as f32,
            Channel::G => p.0[1] as f32,
            Channel::B => p.0[2] as f32,
        }
    }
}

fn sample(img: &RgbaImage, w: u32, h: u32, chan: Channel) -> Vec<f32> {
    let small = if img.dimensions() == (w, h) {
        img.clone()
    } else {
        resize(img, w, h, FilterType::Triangle)
    };
    small.pixels().map(|p| chan.value(p)).collect()
}

/// 8x8 average hash: bit set where the pixel is at or above the mean,
/// most significant bit first.
fn ahash64(img: &RgbaImage, chan: Channel) -> u64 {
    let pix = sample(img, HASH_SIZE, HASH_SIZE, chan);
    let avg = pix.iter().sum::<f32>() / pix.len() as f32;
    pix.iter()
        .fold(0u64, |bits, &v| (bits << 1) | (v >= avg) as u64)
}

/// 9x8 horizontal difference hash: bit set where a pixel is darker than
/// its right neighbor.
fn dhash_x64(img: &RgbaImage, chan: Channel) -> u64 {
    let (w, h) = (HASH_SIZE + 1, HASH_SIZE);
    let pix = sample(img, w, h, chan);
    let mut bits = 0u64;
    for y in 0..h {
        for x in 0..w - 1 {
            let lt = pix[(y * w + x) as usize] < pix[(y * w + x + 1) as usize];
            bits = (bits << 1) | lt as u64;
        }
    }
    bits
}

/// 8x9 vertical difference hash: bit set where a pixel is darker than the
/// one below it.
fn dhash_y64(img: &RgbaImage, chan: Channel) -> u64 {
    let (w, h) = (HASH_SIZE, HASH_SIZE + 1);
    let pix = sample(img, w, h, chan);
    let mut bits = 0u64;
    for y in 0..h - 1 {
        for x in 0..w {
            let lt = pix[(y * w + x) as usize] < pix[((y + 1) * w + x) as usize];
            bits = (bits << 1) | lt as u64;
        }
    }
    bits
}

fn channel_hashes(img: &RgbaImage, chan: Channel) -> ChannelHashes {
    ChannelHashes {
        ahash: ahash64(img, chan),
        dhash_x: dhash_x64(img, chan),
        dhash_y: dhash_y64(img, chan),
    }
}

/// Hash one tile. `with_color` adds the nine RGB channel hashes.
pub fn signature(img: &RgbaImage, with_color: bool) -> TileSignature {
    TileSignature {
        luma: channel_hashes(img, Channel::Luma),
        rgb: if with_color {
            Some(RgbHashes {
                r: channel_hashes(img, Channel::R),
                g: channel_hashes(img, Channel::G),
                b: channel_hashes(img, Channel::B),
            })
        } else {
            None
        },
    }
}

/// Hash one reference sprite image.
pub fn ref_signature(key: &str, url: Option<&str>, img: &RgbaImage, with_color: bool) -> RefSignature {
    let sig = signature(img, with_color);
    RefSignature {
        key: key.to_string(),
        url: url.map(str::to_string),
        luma: sig.luma,
        rgb: sig.rgb,
    }
}

fn luma_distance(a: &ChannelHashes, b: &ChannelHashes) -> u32 {
    hamming(a.ahash, b.ahash) + hamming(a.dhash_x, b.dhash_x) + hamming(a.dhash_y, b.dhash_y)
}

fn color_distance(a: &RgbHashes, b: &RgbHashes) -> u32 {
    luma_distance(&a.r, &b.r) + luma_distance(&a.g, &b.g) + luma_distance(&a.b, &b.b)
}

/// Find the nearest reference by weighted Hamming distance.
///
/// Lower score wins; ties keep the first candidate. After the scan the
/// winner's pure luma distance is re-checked against `luma_threshold` so a
/// candidate cannot win on color blending alone despite a poor luma match.
/// `None` means no acceptable match, which is a normal outcome.
pub fn match_signature(
    sig: &TileSignature,
    refs: &[RefSignature],
    config: &HashMatchConfig,
) -> Option<MatchResult> {
    let mut best: Option<(usize, f32)> = None;
    for (i, r) in refs.iter().enumerate() {
        let luma = luma_distance(&sig.luma, &r.luma) as f32;
        let score = match (&sig.rgb, &r.rgb) {
            (Some(q), Some(c)) => {
                let color = color_distance(q, c);
                if color <= config.color_cap {
                    luma + config.color_weight * color as f32
                } else {
                    luma
                }
            }
            // candidates without color hashes rank on luma alone
            _ => luma,
        };
        if best.map_or(true, |(_, b)| score < b) {
            best = Some((i, score));
        }
    }

    let (i, score) = best?;
    let winner = &refs[i];
    if luma_distance(&sig.luma, &winner.luma) > config.luma_threshold {
        return None;
    }
    Some(MatchResult {
        score,
        ref_key: Some(winner.key.clone()),
        ref_url: winner.url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn flat(value: u8) -> RgbaImage {
        RgbaImage::from_pixel(32, 32, Rgba([value, value, value, 255]))
    }

    fn half_split() -> RgbaImage {
        RgbaImage::from_fn(8, 8, |x, _| {
            if x < 4 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn hamming_is_symmetric_and_zero_on_equal() {
        let pairs = [(0u64, 0u64), (0xDEAD, 0xBEEF), (u64::MAX, 1)];
        for &(a, b) in &pairs {
            assert_eq!(hamming(a, b), hamming(b, a));
        }
        assert_eq!(hamming(0xDEAD, 0xDEAD), 0);
    }

    #[test]
    fn hamming_of_complements_is_64() {
        assert_eq!(hamming(u64::MAX, 0), 64);
    }

    #[test]
    fn ahash_of_split_image_alternates_nibbles() {
        // left half dark, right half light: each row hashes to 00001111
        let h = ahash64(&half_split(), Channel::Luma);
        assert_eq!(h, 0x0F0F_0F0F_0F0F_0F0F);
    }

    #[test]
    fn dhash_of_rising_gradient_is_all_ones() {
        let img = RgbaImage::from_fn(9, 8, |x, _| {
            let v = (x * 25) as u8;
            Rgba([v, v, v, 255])
        });
        assert_eq!(dhash_x64(&img, Channel::Luma), u64::MAX);
    }

    #[test]
    fn identical_images_match_with_zero_score() {
        let img = half_split();
        let sig = signature(&img, true);
        let refs = vec![
            ref_signature("other", Some("o.png"), &flat(10), true),
            ref_signature("same", Some("s.png"), &img, true),
        ];
        let m = match_signature(&sig, &refs, &HashMatchConfig::default()).unwrap();
        assert_eq!(m.ref_key.as_deref(), Some("same"));
        assert_eq!(m.score, 0.0);
    }

    #[test]
    fn poor_luma_match_is_rejected() {
        let sig = signature(&flat(0), false);
        // a reference whose hashes are far from any flat image
        let refs = vec![RefSignature {
            key: "noise".into(),
            url: None,
            luma: ChannelHashes {
                ahash: 0xAAAA_AAAA_AAAA_AAAA,
                dhash_x: 0x5555_5555_5555_5555,
                dhash_y: 0xAAAA_AAAA_AAAA_AAAA,
            },
            rgb: None,
        }];
        assert!(match_signature(&sig, &refs, &HashMatchConfig::default()).is_none());
    }

    #[test]
    fn color_blend_cannot_rescue_bad_luma() {
        let query = signature(&half_split(), true);
        let luma_far = ChannelHashes {
            ahash: !query.luma.ahash,
            dhash_x: !query.luma.dhash_x,
            dhash_y: !query.luma.dhash_y,
        };
        let refs = vec![RefSignature {
            key: "colorful".into(),
            url: None,
            luma: luma_far,
            rgb: query.rgb, // perfect color agreement
        }];
        assert!(match_signature(&query, &refs, &HashMatchConfig::default()).is_none());
    }

    #[test]
    fn missing_color_hashes_degrade_gracefully() {
        let img = half_split();
        let query = signature(&img, true);
        let mut only_luma = ref_signature("plain", Some("p.png"), &img, false);
        only_luma.rgb = None;
        let m = match_signature(&query, &[only_luma], &HashMatchConfig::default()).unwrap();
        assert_eq!(m.ref_key.as_deref(), Some("plain"));
    }

    #[test]
    fn empty_reference_list_yields_none() {
        let sig = signature(&flat(50), false);
        assert!(match_signature(&sig, &[], &HashMatchConfig::default()).is_none());
    }
}
