//! Maintenance: decay of stale entities and duplicate detection.
//!
//! Decay is multiplicative and floor-bounded:
//!
//! ```text
//! decay_weight' = max(floor, decay_weight × factor)
//! importance'   = min(importance, max(floor, importance × factor))
//! ```
//!
//! applied in one batched update to every entity last accessed before the
//! cutoff whose decay weight is still above the floor. Any access resets the
//! decay weight to 1.0, so nothing decays out of reach for good.
//!
//! Duplicate detection only reports; it never merges or deletes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::call::CallContext;
use crate::config::MaintenanceConfig;
use crate::error::{RecallError, Result};
use crate::model::MemoryKind;
use crate::store::vector::{self, HnswIndex, Neighbor};
use crate::store::{DecayChange, DecaySpec, Store};
use crate::types::{Embedding, Limit, Timestamp, now};

/// Above this many entities, neighbor lookups go through an HNSW graph.
const EXACT_PAIR_SCAN_MAX: usize = 1024;

/// What a decay pass did, or would do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Whether this was a preview.
    pub dry_run: bool,
    /// Entities last accessed before this were candidates.
    pub cutoff: Timestamp,
    /// One entry per affected entity, ordered by id.
    pub changes: Vec<DecayChange>,
}

impl DecayReport {
    /// Number of entities affected.
    #[must_use]
    pub fn affected(&self) -> usize {
        self.changes.len()
    }
}

/// Two entities whose embeddings are close. `id_a < id_b` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPair {
    /// Lexicographically smaller id.
    pub id_a: String,
    /// Lexicographically larger id.
    pub id_b: String,
    /// Cosine similarity.
    pub similarity: f32,
}

/// Decay and duplicate detection.
pub struct MaintenanceEngine {
    store: Arc<dyn Store>,
    config: MaintenanceConfig,
}

impl std::fmt::Debug for MaintenanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MaintenanceEngine {
    /// Create an engine over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: MaintenanceConfig) -> Self {
        Self { store, config }
    }

    /// Decay entities not accessed in the last `cutoff_days` days.
    ///
    /// With `dry_run` the candidates and their projected values are
    /// returned and nothing is written.
    ///
    /// # Errors
    ///
    /// [`RecallError::Validation`] if the cutoff cannot be represented, or any
    /// store error. A failed pass writes nothing.
    pub async fn decay(
        &self,
        ctx: &CallContext,
        cutoff_days: u32,
        context: Option<&str>,
        dry_run: bool,
    ) -> Result<DecayReport> {
        let start = Instant::now();
        let cutoff = now()
            .checked_sub_signed(Duration::days(i64::from(cutoff_days)))
            .ok_or_else(|| {
                RecallError::validation(format!("cutoff of {cutoff_days} days is out of range"))
            })?;

        let changes = self
            .store
            .decay(
                ctx,
                DecaySpec {
                    cutoff,
                    context,
                    factor: self.config.decay_factor,
                    floor: self.config.decay_floor,
                    dry_run,
                },
            )
            .await?;

        info!(
            cutoff_days,
            context = ?context,
            dry_run,
            affected = changes.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "decay pass"
        );
        Ok(DecayReport {
            dry_run,
            cutoff,
            changes,
        })
    }

    /// Entity pairs whose embeddings are at least `threshold` similar,
    /// most similar first, at most `limit` pairs in total.
    ///
    /// # Errors
    ///
    /// [`RecallError::Validation`] for a threshold outside 0.0..=1.0 or an
    /// out-of-range limit, or any store error.
    pub async fn find_similar_pairs(
        &self,
        ctx: &CallContext,
        threshold: f32,
        limit: usize,
        context: Option<&str>,
    ) -> Result<Vec<SimilarPair>> {
        let start = Instant::now();
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(RecallError::validation(format!(
                "similarity threshold {threshold} must be within 0.0..=1.0"
            )));
        }
        let limit = Limit::within(limit, 1..=self.config.max_pair_limit)?;
        let points = self
            .store
            .embeddings(ctx, MemoryKind::Entity, context)
            .await?;
        let scanned = points.len();
        let neighbors = self.config.similarity_neighbors;

        let pairs = ctx
            .run(async move {
                let pairs = tokio::task::spawn_blocking(move || {
                    similar_pairs(&points, neighbors, threshold, limit.get())
                })
                .await?;
                Ok(pairs)
            })
            .await?;

        debug!(
            scanned,
            threshold,
            pairs = pairs.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "similar pairs"
        );
        Ok(pairs)
    }
}

/// Collect normalized, deduplicated pairs from each point's nearest
/// neighbors.
fn similar_pairs(
    points: &[(String, Embedding)],
    neighbors: usize,
    threshold: f32,
    limit: usize,
) -> Vec<SimilarPair> {
    // One extra slot for the point itself.
    let k = neighbors.saturating_add(1);
    let index = (points.len() > EXACT_PAIR_SCAN_MAX).then(|| {
        HnswIndex::build_with_params(points.to_vec(), 100, k.max(50))
    });
    let knn = |query: &Embedding| -> Vec<Neighbor> {
        match &index {
            Some(index) => index.search(query, k),
            None => vector::brute_force(query, points, k),
        }
    };

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut pairs = Vec::new();
    for (id, embedding) in points {
        for n in knn(embedding) {
            if n.id == *id || n.similarity < threshold {
                continue;
            }
            let (a, b) = if *id < n.id {
                (id.clone(), n.id)
            } else {
                (n.id, id.clone())
            };
            if seen.insert((a.clone(), b.clone())) {
                pairs.push(SimilarPair {
                    id_a: a,
                    id_b: b,
                    similarity: n.similarity,
                });
            }
        }
    }

    pairs.sort_by(|x, y| {
        y.similarity
            .total_cmp(&x.similarity)
            .then_with(|| x.id_a.cmp(&y.id_a))
            .then_with(|| x.id_b.cmp(&y.id_b))
    });
    pairs.truncate(limit);
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, v: &[f32]) -> (String, Embedding) {
        (id.to_string(), Embedding(v.to_vec()))
    }

    #[test]
    fn pairs_are_normalized_and_unique() {
        let points = vec![
            point("b", &[1.0, 0.0]),
            point("a", &[1.0, 0.01]),
            point("c", &[0.0, 1.0]),
        ];
        let pairs = similar_pairs(&points, 5, 0.9, 10);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].id_a, "a");
        assert_eq!(pairs[0].id_b, "b");
    }

    #[test]
    fn identical_vectors_are_not_self_pairs() {
        let points = vec![point("x", &[0.5, 0.5]), point("y", &[0.5, 0.5])];
        let pairs = similar_pairs(&points, 5, 0.99, 10);
        assert_eq!(pairs.len(), 1);
        assert!(pairs.iter().all(|p| p.id_a != p.id_b));
    }

    #[test]
    fn limit_caps_total_pairs() {
        let points: Vec<_> = (0..6)
            .map(|i| point(&format!("e{i}"), &[1.0, 0.001 * i as f32]))
            .collect();
        let pairs = similar_pairs(&points, 10, 0.9, 4);
        assert_eq!(pairs.len(), 4);
        assert!(pairs.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}
