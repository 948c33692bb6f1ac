use std::sync::RwLock;

/// Tunable parameters for cropping and matching.
///
/// These are empirical knobs, not contracts: the defaults are good starting
/// points for typical screenshots but are meant to be adjusted live. An
/// analysis run takes one snapshot up front so a change made mid-run cannot
/// mix parameters between tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    /// Cosine score below which an embedding match is rejected (0..1).
    pub score_threshold: f32,
    /// Extra inset shaved from each cell to avoid grid-line bleed (0..0.4).
    pub crop_inset_pct: f32,
    /// Jitter amplitude for multi-crop sampling, as a fraction of the
    /// tile side (0..0.15).
    pub jitter_frac: f32,
    /// Number of jittered crops sampled per tile (1..9). The best-scoring
    /// variant wins.
    pub multi_crop: u8,
    /// Color tolerance used by the background segmenter ring test.
    pub bg_sigma: f32,
    /// When non-zero, log this many runner-up candidates per tile.
    pub debug_top_k: usize,
}

impl Default for Tuning {
    fn default() -> Tuning {
        Tuning {
            score_threshold: 0.28,
            crop_inset_pct: 0.08,
            jitter_frac: 0.0,
            multi_crop: 1,
            bg_sigma: 12.0,
            debug_top_k: 0,
        }
    }
}

impl Tuning {
    fn clamped(mut self) -> Tuning {
        self.score_threshold = self.score_threshold.max(0.0).min(1.0);
        self.crop_inset_pct = self.crop_inset_pct.max(0.0).min(0.4);
        self.jitter_frac = self.jitter_frac.max(0.0).min(0.15);
        self.multi_crop = self.multi_crop.max(1).min(9);
        self.bg_sigma = self.bg_sigma.max(0.0);
        self
    }
}

/// Shared store for [Tuning] values.
///
/// Readers get a snapshot; writers replace the whole value. Out-of-range
/// settings are clamped into their documented ranges rather than rejected.
#[derive(Debug, Default)]
pub struct TuningStore {
    inner: RwLock<Tuning>,
}

impl TuningStore {
    pub fn new() -> TuningStore {
        TuningStore::default()
    }

    pub fn with(tuning: Tuning) -> TuningStore {
        TuningStore {
            inner: RwLock::new(tuning.clamped()),
        }
    }

    /// Atomic snapshot of the current values.
    pub fn snapshot(&self) -> Tuning {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the stored values (clamped).
    pub fn set(&self, tuning: Tuning) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = tuning.clamped();
    }

    /// Apply a partial update under the write lock.
    pub fn update<F: FnOnce(&mut Tuning)>(&self, f: F) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        let next = guard.clone().clamped();
        *guard = next;
    }
}
