//! Sprite index loading.
//!
//! The on-disk index exists in three schema generations. All three are
//! sniffed into a tagged [RawIndex] first, then lifted by pure functions
//! into the one canonical [ReferenceIndex] shape: packed row-major float
//! vectors plus a parallel metadata list.

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Condvar, Mutex};

/// Species excluded from matching, as normalized slug tokens (lowercase,
/// separators stripped): legendaries, mythicals, ultra beasts, paradox
/// forms and the ruin quartet.
const EXCLUDED_SPECIES: &[&str] = &[
    // Kanto
    "articuno", "zapdos", "moltres", "mewtwo", "mew",
    // Johto
    "raikou", "entei", "suicune", "lugia", "hooh", "celebi",
    // Hoenn
    "regirock", "regice", "registeel", "latias", "latios", "kyogre", "groudon", "rayquaza",
    "jirachi", "deoxys",
    // Sinnoh
    "uxie", "mesprit", "azelf", "dialga", "palkia", "heatran", "regigigas", "giratina",
    "cresselia", "darkrai", "shaymin", "arceus", "manaphy", "phione",
    // Unova
    "victini", "cobalion", "terrakion", "virizion", "tornadus", "thundurus", "landorus",
    "reshiram", "zekrom", "kyurem", "keldeo", "meloetta", "genesect",
    // Kalos
    "xerneas", "yveltal", "zygarde", "diancie", "hoopa", "volcanion",
    // Alola
    "tapukoko", "tapulele", "tapubulu", "tapufini", "cosmog", "cosmoem", "solgaleo", "lunala",
    "necrozma", "magearna", "marshadow", "zeraora",
    // Galar
    "zacian", "zamazenta", "eternatus", "kubfu", "urshifu", "zarude", "regieleki", "regidrago",
    "glastrier", "spectrier", "calyrex",
    // Hisui / Paldea
    "enamorus", "terapagos",
    // Ultra beasts
    "nihilego", "buzzwole", "pheromosa", "xurkitree", "celesteela", "kartana", "guzzlord",
    "poipole", "naganadel", "stakataka", "blacephalon",
    // Paradox
    "greattusk", "screamtail", "brutebonnet", "fluttermane", "slitherwing", "sandyshocks",
    "roaringmoon", "irontreads", "ironbundle", "ironhands", "ironjugulis", "ironmoth",
    "ironthorns", "ironvaliant", "ironleaves", "walkingwake", "ragingbolt", "gougingfire",
    "ironboulder", "ironcrown",
    // Ruin quartet
    "wochien", "chienpao", "tinglu", "chiyu",
];

/// Metadata for one reference sprite. All fields are optional in the wild;
/// identity falls back from `slug` to `name` to `key`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexItem {
    pub key: Option<String>,
    pub dex: Option<u32>,
    pub slug: Option<String>,
    pub name: Option<String>,
    pub path: Option<String>,
    pub url: Option<String>,
    pub drive_cache: Option<String>,
    pub sprite: Option<String>,
    pub image: Option<String>,
    pub thumb: Option<String>,
}

/// Ordered accessor list for resolving a display URL. First non-empty
/// field wins; the order is part of the index contract.
const URL_FIELDS: &[fn(&IndexItem) -> Option<&str>] = &[
    |m| m.drive_cache.as_deref(),
    |m| m.sprite.as_deref(),
    |m| m.url.as_deref(),
    |m| m.image.as_deref(),
    |m| m.thumb.as_deref(),
    |m| m.path.as_deref(),
];

impl IndexItem {
    pub fn display_url(&self) -> Option<&str> {
        URL_FIELDS
            .iter()
            .filter_map(|f| f(self))
            .find(|s| !s.is_empty())
    }

    /// Best available identity for this item.
    pub fn ident(&self) -> Option<&str> {
        self.slug
            .as_deref()
            .or_else(|| self.name.as_deref())
            .or_else(|| self.key.as_deref())
    }

    fn slug_token(&self) -> Option<String> {
        self.ident().map(|s| {
            s.to_lowercase()
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
                .collect()
        })
    }
}

/// The canonical in-memory index: `count` rows of `dim` floats, packed
/// row-major, parallel to `items`. Every row is L2-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceIndex {
    pub dim: usize,
    pub vectors: Vec<f32>,
    pub items: Vec<IndexItem>,
}

impl ReferenceIndex {
    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Row `i` of the packed vector array.
    pub fn vector(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }
}

/// One of the three on-disk schema generations, sniffed before decode.
#[derive(Debug)]
enum RawIndex {
    V2(RawV2),
    V3(RawV3),
    V4(RawV4),
}

#[derive(Debug, Deserialize)]
struct RawV4 {
    dim: usize,
    vectors_b64: String,
    items: Vec<IndexItem>,
}

#[derive(Debug, Deserialize)]
struct RawV3 {
    dim: usize,
    #[serde(default)]
    vectors: Vec<V3Row>,
    #[serde(default)]
    meta: Vec<IndexItem>,
    #[serde(default)]
    items: Vec<IndexItem>,
}

/// v3 rows appear both as plain float arrays and as per-row base64 blobs.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum V3Row {
    Floats(Vec<f32>),
    Packed(String),
}

#[derive(Debug, Deserialize)]
struct RawV2 {
    items: Vec<V2Item>,
}

#[derive(Debug, Deserialize)]
struct V2Item {
    vector_b64: String,
    #[serde(flatten)]
    meta: IndexItem,
}

/// Parse an index document, lift it to the canonical shape, normalize the
/// rows and apply the species exclusion set.
pub fn parse_index(text: &str) -> Result<ReferenceIndex, Error> {
    let value: Value = serde_json::from_str(text)?;
    let raw = sniff(value)?;
    let mut index = lift(raw)?;
    normalize_rows(&mut index.vectors, index.dim);
    let index = apply_exclusions(index);
    info!(
        "sprite index ready: {} items, dim {}",
        index.count(),
        index.dim
    );
    Ok(index)
}

/// Version sniffing. Checked newest-first: an explicit `version: 4` with
/// a packed blob, an explicit `version: 3`, else a versionless document
/// whose items carry their own vectors.
fn sniff(value: Value) -> Result<RawIndex, Error> {
    let version = value.get("version").and_then(Value::as_u64);
    let has_items = value.get("items").map_or(false, Value::is_array);
    let has_meta = value.get("meta").map_or(false, Value::is_array);
    match version {
        Some(4) if has_items && value.get("vectors_b64").is_some() => {
            Ok(RawIndex::V4(serde_json::from_value(value)?))
        }
        Some(3) if has_items || has_meta => Ok(RawIndex::V3(serde_json::from_value(value)?)),
        None if value
            .get("items")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .map_or(false, |i| i.get("vector_b64").is_some()) =>
        {
            Ok(RawIndex::V2(serde_json::from_value(value)?))
        }
        _ => Err(Error::UnsupportedIndexFormat),
    }
}

/// Pure lift from any raw schema to the canonical shape. No normalization
/// or filtering happens here.
fn lift(raw: RawIndex) -> Result<ReferenceIndex, Error> {
    match raw {
        RawIndex::V4(v4) => {
            let vectors = decode_f32(&v4.vectors_b64)?;
            let expected = v4.items.len() * v4.dim;
            if vectors.len() != expected {
                return Err(Error::VectorCount {
                    len: vectors.len(),
                    expected,
                });
            }
            Ok(ReferenceIndex {
                dim: v4.dim,
                vectors,
                items: v4.items,
            })
        }
        RawIndex::V3(v3) => {
            let items = if v3.meta.is_empty() { v3.items } else { v3.meta };
            let mut vectors = Vec::with_capacity(v3.vectors.len() * v3.dim);
            for (i, row) in v3.vectors.into_iter().enumerate() {
                let floats = match row {
                    V3Row::Floats(f) => f,
                    V3Row::Packed(b64) => decode_f32(&b64)?,
                };
                if floats.len() != v3.dim {
                    return Err(Error::VectorLength {
                        index: i,
                        len: floats.len(),
                        dim: v3.dim,
                    });
                }
                vectors.extend_from_slice(&floats);
            }
            let expected = items.len() * v3.dim;
            if vectors.len() != expected {
                return Err(Error::VectorCount {
                    len: vectors.len(),
                    expected,
                });
            }
            Ok(ReferenceIndex {
                dim: v3.dim,
                vectors,
                items,
            })
        }
        RawIndex::V2(v2) => {
            if v2.items.is_empty() {
                return Err(Error::EmptyIndex);
            }
            // dimension is inferred from the first decoded vector
            let mut dim = 0usize;
            let mut vectors = Vec::new();
            let mut items = Vec::with_capacity(v2.items.len());
            for (i, item) in v2.items.into_iter().enumerate() {
                let floats = decode_f32(&item.vector_b64)?;
                if i == 0 {
                    dim = floats.len();
                }
                if floats.len() != dim || dim == 0 {
                    return Err(Error::VectorLength {
                        index: i,
                        len: floats.len(),
                        dim,
                    });
                }
                vectors.extend_from_slice(&floats);
                items.push(item.meta);
            }
            Ok(ReferenceIndex { dim, vectors, items })
        }
    }
}

/// base64 → little-endian float32. A trailing partial element is dropped,
/// matching how a byte buffer reinterpret would floor the length.
fn decode_f32(b64: &str) -> Result<Vec<f32>, Error> {
    let bytes = STANDARD.decode(b64)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// L2-normalize each row in place. Rows already within 1e-3 of unit norm
/// are left untouched, as are all-zero rows.
fn normalize_rows(vectors: &mut [f32], dim: usize) {
    if dim == 0 {
        return;
    }
    for row in vectors.chunks_exact_mut(dim) {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 && (norm - 1.0).abs() > 1e-3 {
            for x in row.iter_mut() {
                *x /= norm;
            }
        }
    }
}

/// Drop excluded species, re-packing vectors and items in original
/// relative order. When nothing matches the exclusion set the index is
/// returned unchanged, without copying.
fn apply_exclusions(index: ReferenceIndex) -> ReferenceIndex {
    let excluded: Vec<usize> = index
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.slug_token()
                .map_or(false, |t| EXCLUDED_SPECIES.contains(&t.as_str()))
        })
        .map(|(i, _)| i)
        .collect();
    if excluded.is_empty() {
        return index;
    }
    debug!("excluding {} species from the index", excluded.len());

    let dim = index.dim;
    let mut vectors = Vec::with_capacity(index.vectors.len() - excluded.len() * dim);
    let mut items = Vec::with_capacity(index.items.len() - excluded.len());
    let mut skip = excluded.iter().peekable();
    for (i, item) in index.items.into_iter().enumerate() {
        if skip.peek() == Some(&&i) {
            skip.next();
            continue;
        }
        vectors.extend_from_slice(&index.vectors[i * dim..(i + 1) * dim]);
        items.push(item);
    }
    ReferenceIndex { dim, vectors, items }
}

enum CacheState {
    Empty,
    Loading,
    Ready(Arc<ReferenceIndex>),
    Failed(String),
}

/// Settles the cache to `Failed` when the loader unwinds.
struct LoadGuard<'a> {
    cache: &'a IndexCache,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.settle_failed("sprite index loader panicked");
        }
    }
}

/// Process-wide single-flight cache for the reference index.
///
/// The first caller runs the loader; concurrent callers block until that
/// load settles and then share its outcome. A failed load is sticky (every
/// later call gets the same error) until [IndexCache::reset] is called, so
/// a retry is an explicit decision rather than a hammering loop.
pub struct IndexCache {
    state: Mutex<CacheState>,
    settled: Condvar,
}

impl Default for IndexCache {
    fn default() -> IndexCache {
        IndexCache::new()
    }
}

impl IndexCache {
    pub fn new() -> IndexCache {
        IndexCache {
            state: Mutex::new(CacheState::Empty),
            settled: Condvar::new(),
        }
    }

    /// Get the cached index, running `load` if this is the first call.
    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<ReferenceIndex>, Error>
    where
        F: FnOnce() -> Result<ReferenceIndex, Error>,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match &*state {
                CacheState::Ready(index) => return Ok(Arc::clone(index)),
                CacheState::Failed(msg) => return Err(Error::IndexLoad(msg.clone())),
                CacheState::Loading => {
                    state = self
                        .settled
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                CacheState::Empty => break,
            }
        }
        *state = CacheState::Loading;
        drop(state);

        // settle to Failed even if the loader panics, so waiters wake up
        // instead of blocking on a load that will never finish
        let mut guard = LoadGuard {
            cache: self,
            armed: true,
        };
        let result = load();
        guard.armed = false;
        drop(guard);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let out = match result {
            Ok(index) => {
                let index = Arc::new(index);
                *state = CacheState::Ready(Arc::clone(&index));
                Ok(index)
            }
            Err(e) => {
                *state = CacheState::Failed(e.to_string());
                Err(e)
            }
        };
        drop(state);
        self.settled.notify_all();
        out
    }

    /// The cached index, if a load already succeeded.
    pub fn get(&self) -> Option<Arc<ReferenceIndex>> {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            CacheState::Ready(index) => Some(Arc::clone(index)),
            _ => None,
        }
    }

    fn settle_failed(&self, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = CacheState::Failed(message.to_string());
        drop(state);
        self.settled.notify_all();
    }

    /// Clear a settled state so the next [IndexCache::get_or_load] loads
    /// again. A load in flight is left alone.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            CacheState::Loading => {}
            _ => *state = CacheState::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn b64(floats: &[f32]) -> String {
        let bytes: Vec<u8> = floats.iter().flat_map(|f| f.to_le_bytes()).collect();
        STANDARD.encode(bytes)
    }

    fn assert_unit_rows(index: &ReferenceIndex) {
        assert_eq!(index.vectors.len(), index.count() * index.dim);
        for i in 0..index.count() {
            let norm: f32 = index.vector(i).iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3, "row {} norm = {}", i, norm);
        }
    }

    #[test]
    fn v2_index_is_lifted() {
        // two items, dim 4, axis-aligned unit vectors
        let doc = json!({
            "items": [
                { "key": "a", "vector_b64": b64(&[1.0, 0.0, 0.0, 0.0]), "url": "a.png" },
                { "key": "b", "vector_b64": b64(&[0.0, 1.0, 0.0, 0.0]), "url": "b.png" },
            ]
        });
        let index = parse_index(&doc.to_string()).unwrap();
        assert_eq!(index.dim, 4);
        assert_eq!(index.count(), 2);
        assert_unit_rows(&index);
        assert_eq!(index.vector(0), &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn v3_index_accepts_float_and_packed_rows() {
        let doc = json!({
            "version": 3,
            "dim": 2,
            "meta": [{ "slug": "a" }, { "slug": "b" }],
            "vectors": [[3.0, 4.0], b64(&[0.0, 2.0])],
        });
        let index = parse_index(&doc.to_string()).unwrap();
        assert_eq!(index.count(), 2);
        assert_unit_rows(&index);
        // [3,4] normalizes to [0.6, 0.8]
        assert!((index.vector(0)[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn v4_index_decodes_packed_blob() {
        let doc = json!({
            "version": 4,
            "dim": 3,
            "count": 2,
            "normalized": false,
            "vectors_b64": b64(&[2.0, 0.0, 0.0, 0.0, 0.0, 5.0]),
            "items": [{ "name": "left" }, { "name": "right" }],
        });
        let index = parse_index(&doc.to_string()).unwrap();
        assert_eq!(index.dim, 3);
        assert_eq!(index.count(), 2);
        assert_unit_rows(&index);
    }

    #[test]
    fn v4_with_wrong_vector_count_is_rejected() {
        let doc = json!({
            "version": 4,
            "dim": 4,
            "vectors_b64": b64(&[1.0, 0.0]),
            "items": [{ "name": "a" }],
        });
        match parse_index(&doc.to_string()) {
            Err(Error::VectorCount { len: 2, expected: 4 }) => {}
            other => panic!("unexpected: {:?}", other.map(|i| i.count())),
        }
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let doc = json!({ "version": 9, "items": [] });
        assert!(matches!(
            parse_index(&doc.to_string()),
            Err(Error::UnsupportedIndexFormat)
        ));
    }

    #[test]
    fn excluded_species_are_filtered_in_order() {
        let doc = json!({
            "items": [
                { "slug": "bulbasaur", "vector_b64": b64(&[1.0, 0.0]) },
                { "slug": "Tapu Koko", "vector_b64": b64(&[0.0, 1.0]) },
                { "slug": "pikachu", "vector_b64": b64(&[0.6, 0.8]) },
                { "slug": "great-tusk", "vector_b64": b64(&[1.0, 0.0]) },
            ]
        });
        let index = parse_index(&doc.to_string()).unwrap();
        assert_eq!(index.count(), 2);
        assert_eq!(index.items[0].slug.as_deref(), Some("bulbasaur"));
        assert_eq!(index.items[1].slug.as_deref(), Some("pikachu"));
        assert_eq!(index.vector(1), &[0.6, 0.8]);
    }

    #[test]
    fn filter_without_matches_keeps_index_intact() {
        let doc = json!({
            "items": [
                { "slug": "bulbasaur", "vector_b64": b64(&[1.0, 0.0]) },
                { "slug": "pikachu", "vector_b64": b64(&[0.0, 1.0]) },
            ]
        });
        let index = parse_index(&doc.to_string()).unwrap();
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn display_url_follows_priority_order() {
        let mut item = IndexItem::default();
        item.path = Some("sprites/a.png".into());
        item.thumb = Some("thumb.png".into());
        assert_eq!(item.display_url(), Some("thumb.png"));
        item.drive_cache = Some("cache/a.png".into());
        assert_eq!(item.display_url(), Some("cache/a.png"));
        item.drive_cache = Some(String::new());
        assert_eq!(item.display_url(), Some("thumb.png"));
    }

    fn tiny_index() -> ReferenceIndex {
        ReferenceIndex {
            dim: 1,
            vectors: vec![1.0],
            items: vec![IndexItem {
                key: Some("only".into()),
                ..IndexItem::default()
            }],
        }
    }

    #[test]
    fn cache_is_single_flight() {
        let cache = Arc::new(IndexCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(thread::spawn(move || {
                cache.get_or_load(|| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(20));
                    Ok(tiny_index())
                })
            }));
        }
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_loader_fails_the_cache_instead_of_wedging_it() {
        let cache = Arc::new(IndexCache::new());
        let loader_cache = Arc::clone(&cache);
        let loader = thread::spawn(move || {
            let _ = loader_cache.get_or_load(|| -> Result<ReferenceIndex, Error> {
                panic!("loader blew up");
            });
        });
        assert!(loader.join().is_err());

        // waiters settle on an error rather than blocking forever
        let result = cache.get_or_load(|| Ok(tiny_index()));
        assert!(matches!(result, Err(Error::IndexLoad(_))));

        // an explicit reset allows a clean retry
        cache.reset();
        assert!(cache.get_or_load(|| Ok(tiny_index())).is_ok());
    }

    #[test]
    fn failed_load_is_sticky_until_reset() {
        let cache = IndexCache::new();
        let loads = AtomicUsize::new(0);
        let load_err = || -> Result<ReferenceIndex, Error> {
            loads.fetch_add(1, Ordering::SeqCst);
            Err(Error::EmptyIndex)
        };
        assert!(cache.get_or_load(load_err).is_err());
        // the second call must not run the loader again
        let second = cache.get_or_load(|| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(tiny_index())
        });
        assert!(matches!(second, Err(Error::IndexLoad(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.reset();
        assert!(cache
            .get_or_load(|| {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(tiny_index())
            })
            .is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(cache.get().is_some());
    }
}
