//! Cosine nearest-neighbor search over the reference index.

use crate::error::Error;
use crate::index::ReferenceIndex;
use log::{debug, warn};

/// Outcome of matching one tile. `ref_key == None` means "no match" and
/// is a normal result, not an error; `score` still carries the best
/// similarity seen for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub score: f32,
    pub ref_key: Option<String>,
    pub ref_url: Option<String>,
}

impl MatchResult {
    pub fn no_match(score: f32) -> MatchResult {
        MatchResult {
            score,
            ref_key: None,
            ref_url: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.ref_key.is_some()
    }
}

/// Scale `v` to unit L2 norm. A zero vector is left as-is.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Exhaustive cosine scan of `query` against every index row.
///
/// `query` must be L2-normalized and of the index dimension; a mismatch
/// fails fast rather than silently truncating. Ties keep the first row
/// seen, so equal-scoring candidates resolve by index order. A best score
/// below `threshold`, or a winner without any resolvable sprite URL,
/// yields the no-match sentinel.
pub fn match_embedding(
    query: &[f32],
    index: &ReferenceIndex,
    threshold: f32,
) -> Result<MatchResult, Error> {
    if index.is_empty() {
        return Err(Error::EmptyIndex);
    }
    if query.len() != index.dim {
        return Err(Error::DimensionMismatch {
            len: query.len(),
            dim: index.dim,
        });
    }

    let mut best = f32::MIN;
    let mut best_i = 0usize;
    for i in 0..index.count() {
        let score = dot(query, index.vector(i));
        if score > best {
            best = score;
            best_i = i;
        }
    }

    if best < threshold {
        return Ok(MatchResult::no_match(best));
    }
    let item = &index.items[best_i];
    let url = match item.display_url() {
        Some(u) => u.to_string(),
        None => {
            warn!(
                "winning candidate {:?} has no sprite URL, treating as no match",
                item.ident()
            );
            return Ok(MatchResult::no_match(best));
        }
    };
    Ok(MatchResult {
        score: best,
        ref_key: item.ident().map(str::to_string),
        ref_url: Some(url),
    })
}

/// The `k` best rows by score, for runner-up logging.
pub fn top_candidates(query: &[f32], index: &ReferenceIndex, k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = (0..index.count())
        .map(|i| (i, dot(query, index.vector(i))))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Log the runner-up candidates for one tile at debug level.
pub fn log_top_candidates(tile: usize, query: &[f32], index: &ReferenceIndex, k: usize) {
    for (rank, (i, score)) in top_candidates(query, index, k).into_iter().enumerate() {
        debug!(
            "tile {} candidate {}: {:?} score {:.4}",
            tile,
            rank,
            index.items[i].ident(),
            score
        );
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
