//! Reciprocal Rank Fusion.
//!
//! ```text
//! score(d) = Σ_s 1 / (k + rank_s(d))      rank is 1-based, k = 60 by default
//! ```
//!
//! A stream that does not contain `d` contributes nothing. Results are sorted
//! by fused score descending with the id as the final tie-break, so the same
//! inputs always produce the same order.

use std::collections::{HashMap, HashSet};

use ordered_float::OrderedFloat;

use crate::types::FusedScore;

/// Smoothing constant from the RRF paper (Cormack et al., 2009).
pub const DEFAULT_RRF_K: u32 = 60;

/// One fused result.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused<T> {
    /// The candidate, taken from the first stream that ranked it.
    pub item: T,
    /// Sum of reciprocal-rank contributions.
    pub score: FusedScore,
}

/// Contribution of a single 1-based rank.
#[must_use]
pub fn contribution(k: u32, rank: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let r = rank as f64;
    1.0 / (f64::from(k) + r)
}

/// Fuse ranked streams into one list of at most `limit` items.
///
/// `id_of` identifies a candidate across streams. A candidate repeated
/// inside one stream only counts at its best rank there.
pub fn reciprocal_rank_fusion<T, F>(
    streams: Vec<Vec<T>>,
    k: u32,
    limit: usize,
    id_of: F,
) -> Vec<Fused<T>>
where
    F: Fn(&T) -> &str,
{
    let mut merged: HashMap<String, Fused<T>> = HashMap::new();

    for stream in streams {
        let mut seen_in_stream: HashSet<String> = HashSet::with_capacity(stream.len());
        for (idx, item) in stream.into_iter().enumerate() {
            let id = id_of(&item).to_string();
            if !seen_in_stream.insert(id.clone()) {
                continue;
            }
            let add = contribution(k, idx + 1);
            merged
                .entry(id)
                .and_modify(|f| f.score = FusedScore(OrderedFloat(f.score.value() + add)))
                .or_insert(Fused {
                    item,
                    score: FusedScore(OrderedFloat(add)),
                });
        }
    }

    let mut out: Vec<(String, Fused<T>)> = merged.into_iter().collect();
    out.sort_by(|(id_a, a), (id_b, b)| {
        b.score.cmp(&a.score).then_with(|| id_a.cmp(id_b))
    });
    out.truncate(limit);
    out.into_iter().map(|(_, f)| f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(out: &[Fused<&'static str>]) -> Vec<&'static str> {
        out.iter().map(|f| f.item).collect()
    }

    fn fuse(streams: Vec<Vec<&'static str>>, limit: usize) -> Vec<Fused<&'static str>> {
        reciprocal_rank_fusion(streams, DEFAULT_RRF_K, limit, |s: &&'static str| *s)
    }

    #[test]
    fn item_in_both_streams_wins() {
        let out = fuse(vec![vec!["a", "b"], vec!["c", "b"]], 10);
        assert_eq!(out[0].item, "b");
        let expected = contribution(60, 2) * 2.0;
        assert!((out[0].score.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn absent_stream_contributes_nothing() {
        let out = fuse(vec![vec!["a"], vec![]], 10);
        assert_eq!(out.len(), 1);
        assert!((out[0].score.value() - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn ties_break_by_id() {
        // "b" is first lexically and second by vector, "a" the reverse.
        let out = fuse(vec![vec!["b", "a"], vec!["a", "b"]], 10);
        assert_eq!(out[0].score, out[1].score);
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[test]
    fn duplicates_within_a_stream_count_once() {
        let out = fuse(vec![vec!["a", "a", "b"]], 10);
        assert_eq!(out.len(), 2);
        assert!((out[0].score.value() - 1.0 / 61.0).abs() < 1e-12);
        assert!((out[1].score.value() - 1.0 / 63.0).abs() < 1e-12);
    }

    #[test]
    fn limit_applies_after_fusion() {
        let out = fuse(vec![vec!["a", "b", "c"], vec!["c", "d"]], 2);
        assert_eq!(ids(&out), vec!["c", "a"]);
    }

    #[test]
    fn deterministic_across_input_order_of_equal_candidates() {
        let one = fuse(vec![vec!["x", "y", "z"], vec!["z", "y", "x"]], 3);
        let two = fuse(vec![vec!["x", "y", "z"], vec!["z", "y", "x"]], 3);
        assert_eq!(one, two);
        assert_eq!(ids(&one), vec!["x", "z", "y"]);
    }
}
