//! Approximate nearest-neighbour index (IVF-flat, cosine).
//!
//! The index keeps every vector L2-normalised so that cosine similarity is a
//! plain dot product. Below [`IndexParams::min_train_size`] live vectors it is
//! an exact flat scan. Once the collection reaches that size a coarse
//! quantiser is trained with spherical k-means and every vector is filed into
//! the inverted list of its nearest centroid.
//!
//! ## Search
//!
//! 1. Rank the centroids by similarity to the query.
//! 2. Scan the inverted lists of the `probes` best centroids, keeping only
//!    vectors whose key passes the equality filter and whose similarity is
//!    above the optional floor.
//! 3. If fewer than `k` candidates were collected, keep probing further lists
//!    until `k` are found or every list was scanned. A search therefore never
//!    returns fewer than `min(k, matching live vectors)` hits.
//! 4. Sort by descending similarity (ties keep insertion order) and truncate.
//!
//! ## Maintenance
//!
//! Inserts are incremental: a new vector is appended to its nearest list.
//! The quantiser is re-trained only when the live count has doubled since the
//! previous training, so the amortised cost per insert stays constant.
//! Removal tombstones the slot; tombstones are skipped by search and dropped
//! on the next re-training or once they outnumber live vectors.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Upper bound on training points per list; larger collections are sampled.
const MAX_TRAINING_POINTS_PER_LIST: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for the IVF quantiser.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexParams {
    /// Live vectors required before the quantiser is trained. Smaller
    /// collections are searched exhaustively.
    pub min_train_size: usize,
    /// Lists scanned per query before widening. `None` uses `sqrt(lists)`.
    pub probes: Option<usize>,
    /// Spherical k-means refinement passes per training.
    pub kmeans_iterations: usize,
    /// Seed for k-means++ initialisation and training-set sampling.
    pub seed: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            min_train_size: 256,
            probes: None,
            kmeans_iterations: 10,
            seed: 42,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: Uuid,
    /// `1 - cosine_distance(query, vector)`.
    pub similarity: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    similarity(&normalize(a), &normalize(b))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two unit vectors, clamped against rounding.
fn similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b).clamp(-1.0, 1.0)
}

/// Scale `v` to unit length. A zero vector stays zero.
fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        vec![0.0; v.len()]
    } else {
        v.iter().map(|x| x / norm).collect()
    }
}

fn nearest_centroid(unit: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_sim = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let sim = dot(unit, c);
        if sim > best_sim {
            best_sim = sim;
            best = i;
        }
    }
    best
}

/// k-means++ seeding over unit vectors with cosine distance.
fn kmeans_plus_plus_init(points: &[&[f32]], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f32>> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())].to_vec());

    for _ in 1..k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                let d = centroids
                    .iter()
                    .map(|c| 1.0 - dot(p, c))
                    .fold(f32::MAX, f32::min)
                    .max(0.0);
                d * d
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }
        let target = rng.random_range(0.0..total);
        let mut cumsum = 0.0;
        let mut selected = points.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            cumsum += w;
            if cumsum >= target {
                selected = i;
                break;
            }
        }
        centroids.push(points[selected].to_vec());
    }
    centroids
}

/// Spherical k-means: assign, average, re-normalise.
fn kmeans_refine(points: &[&[f32]], mut centroids: Vec<Vec<f32>>, iterations: usize) -> Vec<Vec<f32>> {
    let dims = centroids.first().map(Vec::len).unwrap_or(0);
    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; dims]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for p in points {
            let c = nearest_centroid(p, &centroids);
            for (s, v) in sums[c].iter_mut().zip(p.iter()) {
                *s += v;
            }
            counts[c] += 1;
        }
        for (i, centroid) in centroids.iter_mut().enumerate() {
            // Empty clusters keep their previous centroid.
            if counts[i] > 0 {
                let updated = normalize(&sums[i]);
                if updated.iter().any(|x| *x != 0.0) {
                    *centroid = updated;
                }
            }
        }
    }
    centroids
}

// ─────────────────────────────────────────────────────────────────────────────
// SimilarityIndex
// ─────────────────────────────────────────────────────────────────────────────

struct Slot {
    id: Uuid,
    key: Option<String>,
    unit: Vec<f32>,
    live: bool,
}

impl Slot {
    fn matches(&self, key: Option<&str>) -> bool {
        self.live && key.is_none_or(|k| self.key.as_deref() == Some(k))
    }
}

/// In-memory IVF-flat index over one collection's vectors.
///
/// Each entry carries an optional string key used as the equality filter of
/// [`query`][SimilarityIndex::query] (the record's category / memory type).
pub struct SimilarityIndex {
    dimension: usize,
    params: IndexParams,
    slots: Vec<Slot>,
    by_id: HashMap<Uuid, usize>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
    /// Live count at the last training; `0` while untrained.
    trained_at: usize,
}

impl SimilarityIndex {
    pub fn new(dimension: usize, params: IndexParams) -> Self {
        Self {
            dimension,
            params,
            slots: Vec::new(),
            by_id: HashMap::new(),
            centroids: Vec::new(),
            lists: Vec::new(),
            trained_at: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }

    /// Ids of every live vector, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.by_id.keys().copied()
    }

    /// `true` once the coarse quantiser has been trained.
    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Number of inverted lists (zero while untrained).
    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::dimension(self.dimension, vector.len()));
        }
        Ok(())
    }

    /// Add `vector` under `id` with an optional filter key.
    pub fn insert(&mut self, id: Uuid, vector: &[f32], key: Option<&str>) -> Result<()> {
        self.check_dimension(vector)?;
        if self.by_id.contains_key(&id) {
            return Err(MemoryError::DuplicateId(id));
        }
        let unit = normalize(vector);
        let slot = self.slots.len();
        if self.is_trained() {
            let list = nearest_centroid(&unit, &self.centroids);
            self.lists[list].push(slot);
        }
        self.slots.push(Slot {
            id,
            key: key.map(str::to_string),
            unit,
            live: true,
        });
        self.by_id.insert(id, slot);
        self.maybe_train();
        Ok(())
    }

    /// Tombstone `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, id: &Uuid) -> bool {
        let Some(slot) = self.by_id.remove(id) else {
            return false;
        };
        self.slots[slot].live = false;
        let tombstones = self.slots.len() - self.by_id.len();
        if tombstones > self.by_id.len() {
            self.compact();
        }
        true
    }

    /// Drop every vector and the trained quantiser.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_id.clear();
        self.centroids.clear();
        self.lists.clear();
        self.trained_at = 0;
    }

    /// Return up to `k` live vectors most similar to `query` whose key equals
    /// `key` (any key when `None`), in descending similarity.
    pub fn query(&self, query: &[f32], k: usize, key: Option<&str>) -> Result<Vec<Neighbor>> {
        self.query_above(query, k, key, f32::NEG_INFINITY)
    }

    /// Like [`query`][Self::query], but only vectors whose similarity is
    /// strictly greater than `min_similarity` count as hits. Probing widens
    /// until `k` such hits are found or every list has been scanned.
    pub fn query_above(
        &self,
        query: &[f32],
        k: usize,
        key: Option<&str>,
        min_similarity: f32,
    ) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let q = normalize(query);
        let mut hits: Vec<(usize, f32)> = Vec::new();

        if self.is_trained() {
            let mut order: Vec<(usize, f32)> = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, dot(&q, c)))
                .collect();
            order.sort_by(|a, b| b.1.total_cmp(&a.1));

            let probes = self.probes();
            for (probed, (list, _)) in order.iter().enumerate() {
                if probed >= probes && hits.len() >= k {
                    break;
                }
                for &slot in &self.lists[*list] {
                    let entry = &self.slots[slot];
                    if entry.matches(key) {
                        let sim = similarity(&q, &entry.unit);
                        if sim > min_similarity {
                            hits.push((slot, sim));
                        }
                    }
                }
            }
        } else {
            hits.extend(
                self.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.matches(key))
                    .map(|(slot, s)| (slot, similarity(&q, &s.unit)))
                    .filter(|(_, sim)| *sim > min_similarity),
            );
        }

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits
            .into_iter()
            .map(|(slot, sim)| Neighbor {
                id: self.slots[slot].id,
                similarity: sim,
            })
            .collect())
    }

    fn probes(&self) -> usize {
        let lists = self.lists.len().max(1);
        self.params
            .probes
            .unwrap_or_else(|| (lists as f64).sqrt().ceil() as usize)
            .clamp(1, lists)
    }

    fn maybe_train(&mut self) {
        let live = self.len();
        if live < self.params.min_train_size.max(1) {
            return;
        }
        if self.trained_at == 0 || live >= self.trained_at.saturating_mul(2) {
            self.train();
        }
    }

    /// Drop tombstones, then fit a fresh quantiser with `sqrt(live)` lists.
    fn train(&mut self) {
        self.compact();
        let live = self.len();
        let n_lists = ((live as f64).sqrt().round() as usize).clamp(1, live);

        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        let sample_size = live.min(n_lists * MAX_TRAINING_POINTS_PER_LIST);
        let points: Vec<&[f32]> = if sample_size < live {
            rand::seq::index::sample(&mut rng, live, sample_size)
                .into_iter()
                .map(|i| self.slots[i].unit.as_slice())
                .collect()
        } else {
            self.slots.iter().map(|s| s.unit.as_slice()).collect()
        };

        let seeds = kmeans_plus_plus_init(&points, n_lists, &mut rng);
        self.centroids = kmeans_refine(&points, seeds, self.params.kmeans_iterations);
        self.trained_at = live;
        self.assign_lists();
        info!(
            vectors = live,
            lists = self.lists.len(),
            "trained similarity index quantiser"
        );
    }

    /// Remove tombstoned slots and renumber the survivors in insertion order.
    fn compact(&mut self) {
        if self.slots.len() == self.by_id.len() {
            return;
        }
        let before = self.slots.len();
        self.slots.retain(|s| s.live);
        self.by_id = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();
        if self.is_trained() {
            self.assign_lists();
        }
        debug!(dropped = before - self.slots.len(), "compacted similarity index");
    }

    fn assign_lists(&mut self) {
        let mut lists = vec![Vec::new(); self.centroids.len()];
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.live {
                lists[nearest_centroid(&slot.unit, &self.centroids)].push(i);
            }
        }
        self.lists = lists;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
