//! # Recall Core Library
//!
//! Persistent semantic memory for autonomous agents.
//!
//! An agent's memory is a knowledge graph plus two kinds of free text:
//!
//! - **Entities**: named things with facts, labels and an embedding
//! - **Relations**: typed, weighted, directed edges between entities
//! - **Episodes**: timestamped experiences linked to the entities they mention
//! - **Procedures**: ordered steps describing how to do something
//!
//! Everything is stored in one SQLite file and reached through a
//! [`MemoryEngine`]:
//!
//! - hybrid search fuses full-text ranking with vector similarity using
//!   reciprocal rank fusion ([`retrieval::fusion`])
//! - graph queries walk relations in both directions ([`graph`])
//! - maintenance decays stale entities and finds likely duplicates
//!   ([`maintenance`])
//!
//! Every operation takes a [`CallContext`] carrying cancellation and an
//! optional deadline, and fails with a typed [`RecallError`].

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod call;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod maintenance;
pub mod model;
pub mod namespace;
pub mod retrieval;
pub mod store;
pub mod telemetry;
pub mod types;

pub use call::{CallContext, CancelHandle};
pub use config::RecallConfig;
pub use embedding::EmbeddingProvider;
pub use engine::MemoryEngine;
pub use error::{ErrorKind, RecallError, Result};
pub use graph::{GraphNeighbor, Hop, PathResult, Traversal};
pub use maintenance::{DecayReport, SimilarPair};
pub use model::{
    Direction, Entity, EntityDraft, EntityPatch, Episode, EpisodeDraft, Memory, MemoryKind,
    Procedure, ProcedureDraft, Record, Relation, Step,
};
pub use retrieval::{Scored, SearchQuery};
pub use store::{Filter, SqliteStore, Store};
pub use types::*;
