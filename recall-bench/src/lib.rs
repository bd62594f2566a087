//! Fixtures shared by the recall benchmarks.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]

use std::sync::Arc;

use recall_core::embedding::HashingEmbeddingProvider;
use recall_core::{CallContext, EntityDraft, MemoryEngine, RecallConfig};

/// Dimensions used by every benchmark embedder.
pub const DIMENSIONS: usize = 64;

const TOPICS: [&str; 8] = [
    "storage", "network", "parser", "scheduler", "cache", "auth", "billing", "search",
];

/// Two ranked id streams of length `n` with half their ids in common.
#[must_use]
pub fn ranked_streams(n: usize) -> (Vec<String>, Vec<String>) {
    let lexical = (0..n).map(|i| format!("e{i:05}")).collect();
    let vector = (n / 2..n + n / 2).rev().map(|i| format!("e{i:05}")).collect();
    (lexical, vector)
}

/// An in-memory engine holding `entities` entities, each linked to the
/// next `fan_out` ids in a ring.
///
/// # Errors
///
/// Any engine error while seeding.
pub async fn seeded_engine(entities: usize, fan_out: usize) -> anyhow::Result<MemoryEngine> {
    let mut config = RecallConfig::default();
    config.embedding.dimensions = DIMENSIONS;
    let engine = MemoryEngine::in_memory(
        config,
        Arc::new(HashingEmbeddingProvider::new(DIMENSIONS)),
    )?;
    let ctx = CallContext::background();

    for i in 0..entities {
        let topic = TOPICS[i % TOPICS.len()];
        let draft = EntityDraft::new(
            format!("node {i}"),
            topic,
            format!("{topic} component {i} handles {topic} requests and retries"),
        )
        .with_id(node_id(i))
        .with_labels([topic]);
        engine.upsert_entity(&ctx, draft).await?;
    }
    for i in 0..entities {
        for step in 1..=fan_out {
            let j = (i + step) % entities;
            if j != i {
                engine
                    .create_relation(&ctx, &node_id(i), &node_id(j), "calls", None)
                    .await?;
            }
        }
    }
    Ok(engine)
}

/// Id of the `i`th seeded entity.
#[must_use]
pub fn node_id(i: usize) -> String {
    format!("n{i:05}")
}
