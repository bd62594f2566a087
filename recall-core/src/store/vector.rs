//! Nearest-neighbor search over embeddings.
//!
//! Small candidate sets are scanned exactly. Large unfiltered sets go
//! through an HNSW graph built with `instant-distance`, which the store
//! caches per memory kind and rebuilds after writes.

use std::cmp::Ordering;

use instant_distance::{Builder, HnswMap, Point, Search};

use crate::embedding::normalize;
use crate::types::Embedding;

// ---------------------------------------------------------------------------
// VectorPoint: adapter from Embedding to the instant-distance Point trait
// ---------------------------------------------------------------------------

/// A unit-length vector; cosine distance reduces to `1 - dot`.
#[derive(Clone, Debug)]
struct VectorPoint {
    normalized: Vec<f32>,
}

impl VectorPoint {
    fn from_embedding(embedding: &Embedding) -> Self {
        Self {
            normalized: normalize(embedding.0.clone()),
        }
    }

    fn similarity(&self, other: &Self) -> f32 {
        if self.normalized.len() != other.normalized.len() {
            return 0.0;
        }
        self.normalized
            .iter()
            .zip(other.normalized.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>()
            .clamp(-1.0, 1.0)
    }
}

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// One neighbor: id plus cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Record id.
    pub id: String,
    /// Cosine similarity in \[-1, 1\].
    pub similarity: f32,
}

/// Most similar first; equal similarity falls back to id order.
fn by_similarity_then_id(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

/// Exact top-`k` by cosine similarity.
#[must_use]
pub fn brute_force(query: &Embedding, candidates: &[(String, Embedding)], k: usize) -> Vec<Neighbor> {
    let q = VectorPoint::from_embedding(query);
    let mut scored: Vec<Neighbor> = candidates
        .iter()
        .map(|(id, emb)| Neighbor {
            id: id.clone(),
            similarity: q.similarity(&VectorPoint::from_embedding(emb)),
        })
        .collect();
    scored.sort_by(by_similarity_then_id);
    scored.truncate(k);
    scored
}

// ---------------------------------------------------------------------------
// HnswIndex
// ---------------------------------------------------------------------------

/// An immutable HNSW graph over one memory kind.
///
/// Built in one shot from every (id, embedding) pair; any write to the
/// kind makes it stale and the owner rebuilds it on the next query.
pub struct HnswIndex {
    map: HnswMap<VectorPoint, String>,
    len: usize,
    ef_search: usize,
}

impl HnswIndex {
    /// Build from all points. O(N log N).
    #[must_use]
    pub fn build(points: Vec<(String, Embedding)>) -> Self {
        Self::build_with_params(points, 100, 50)
    }

    /// Build with explicit `ef_construction` / `ef_search`.
    #[must_use]
    pub fn build_with_params(
        points: Vec<(String, Embedding)>,
        ef_construction: usize,
        ef_search: usize,
    ) -> Self {
        let len = points.len();
        let (ids, vectors): (Vec<String>, Vec<VectorPoint>) = points
            .into_iter()
            .map(|(id, emb)| (id, VectorPoint::from_embedding(&emb)))
            .unzip();
        let map = Builder::default()
            .ef_construction(ef_construction)
            .ef_search(ef_search)
            .seed(42) // deterministic graph, deterministic results
            .build(vectors, ids);
        Self {
            map,
            len,
            ef_search,
        }
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest `k` a single search can answer.
    #[must_use]
    pub fn ef_search(&self) -> usize {
        self.ef_search
    }

    /// Approximate top-`k`, most similar first, ties by id.
    ///
    /// Returns at most [`HnswIndex::ef_search`] neighbors.
    #[must_use]
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<Neighbor> {
        let q = VectorPoint::from_embedding(query);
        let mut search = Search::default();
        let mut out: Vec<Neighbor> = self
            .map
            .search(&q, &mut search)
            .take(k)
            .map(|item| Neighbor {
                id: item.value.clone(),
                similarity: 1.0 - item.distance,
            })
            .collect();
        out.sort_by(by_similarity_then_id);
        out.truncate(k);
        out
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("len", &self.len)
            .field("ef_search", &self.ef_search)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, v: &[f32]) -> (String, Embedding) {
        (id.to_string(), Embedding(v.to_vec()))
    }

    #[test]
    fn brute_force_orders_by_similarity() {
        let candidates = vec![
            point("far", &[0.0, 1.0, 0.0]),
            point("near", &[1.0, 0.1, 0.0]),
            point("exact", &[1.0, 0.0, 0.0]),
        ];
        let out = brute_force(&Embedding(vec![1.0, 0.0, 0.0]), &candidates, 2);
        let ids: Vec<&str> = out.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);
        assert!((out[0].similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn brute_force_breaks_ties_by_id() {
        let candidates = vec![
            point("b", &[1.0, 0.0]),
            point("a", &[1.0, 0.0]),
            point("c", &[1.0, 0.0]),
        ];
        let out = brute_force(&Embedding(vec![1.0, 0.0]), &candidates, 3);
        let ids: Vec<&str> = out.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_candidates() {
        assert!(brute_force(&Embedding(vec![1.0]), &[], 5).is_empty());
    }

    #[test]
    fn hnsw_finds_exact_match() {
        let points: Vec<(String, Embedding)> = (0..200u16)
            .map(|i| {
                let x = f32::from(i) / 200.0;
                (format!("p{i:03}"), Embedding(vec![x.sin(), x.cos(), 0.5]))
            })
            .collect();
        let target = points[57].1.clone();
        let index = HnswIndex::build(points);
        assert_eq!(index.len(), 200);
        let out = index.search(&target, 5);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].id, "p057");
        assert!(out.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}
