//! Graph queries over typed relations.
//!
//! Both operations walk edges in either direction and expand one BFS level
//! per store call, so each level sees the edges of the whole frontier at
//! once. A visited set keyed by entity id guarantees termination on cycles.
//! Edge order within a level is (from, to, type), which makes discovery
//! order, and therefore the reported `via` edge, deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::call::CallContext;
use crate::config::GraphConfig;
use crate::error::{RecallError, Result};
use crate::model::{Direction, Entity, Memory, MemoryKind, Relation};
use crate::store::Store;
use crate::types::Depth;

/// One edge crossed during a walk, oriented in walking order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hop {
    /// Entity the walk came from.
    pub from_id: String,
    /// Entity the walk arrived at.
    pub to_id: String,
    /// Type of the stored edge.
    pub relation_type: String,
    /// `Outgoing` when the stored edge points `from_id -> to_id`.
    pub direction: Direction,
}

impl Hop {
    fn across(relation: &Relation, from: &str) -> Option<Self> {
        relation.other_end(from).map(|(to, direction)| Self {
            from_id: from.to_string(),
            to_id: to.to_string(),
            relation_type: relation.relation_type.clone(),
            direction,
        })
    }
}

/// An entity reached by [`GraphEngine::traverse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNeighbor {
    /// The entity.
    pub entity: Entity,
    /// Hops from the start.
    pub depth: u32,
    /// The edge that first reached it.
    pub via: Hop,
}

/// Result of a traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    /// The start entity.
    pub start: Entity,
    /// Everything reachable within the depth, nearest first.
    pub neighbors: Vec<GraphNeighbor>,
}

/// Result of a path search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResult {
    /// Whether a path exists within the bound.
    pub found: bool,
    /// The hops from source to target. Empty when not found or when source
    /// and target are the same entity.
    pub hops: Vec<Hop>,
}

impl PathResult {
    /// Number of hops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the path has no hops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Neighbor expansion and shortest paths.
pub struct GraphEngine {
    store: Arc<dyn Store>,
    config: GraphConfig,
}

impl std::fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GraphEngine {
    /// Create an engine over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: GraphConfig) -> Self {
        Self { store, config }
    }

    async fn require_entity(&self, ctx: &CallContext, id: &str) -> Result<Entity> {
        self.store
            .get(ctx, MemoryKind::Entity, &[id.to_string()])
            .await?
            .into_iter()
            .find_map(Entity::from_record)
            .ok_or_else(|| RecallError::not_found(MemoryKind::Entity, id))
    }

    /// Expand one BFS level. Returns newly discovered ids with the hop that
    /// reached them, in discovery order.
    async fn expand(
        &self,
        ctx: &CallContext,
        frontier: &[String],
        types: &[String],
        visited: &mut HashSet<String>,
    ) -> Result<Vec<Hop>> {
        let edges = self.store.relations_touching(ctx, frontier, types).await?;
        let mut by_node: HashMap<&str, Vec<&Relation>> = HashMap::new();
        for edge in &edges {
            by_node.entry(edge.from_id.as_str()).or_default().push(edge);
            by_node.entry(edge.to_id.as_str()).or_default().push(edge);
        }

        let mut discovered = Vec::new();
        for node in frontier {
            let Some(incident) = by_node.get(node.as_str()) else {
                continue;
            };
            for edge in incident {
                let Some(hop) = Hop::across(edge, node) else {
                    continue;
                };
                if visited.insert(hop.to_id.clone()) {
                    discovered.push(hop);
                }
            }
        }
        Ok(discovered)
    }

    /// Everything reachable from `start` within `max_depth` hops, following
    /// edges in both directions, optionally only of the given types.
    ///
    /// `max_depth = 0` returns the start entity alone.
    ///
    /// # Errors
    ///
    /// - [`RecallError::Validation`] if `max_depth` exceeds the cap
    /// - [`RecallError::NotFound`] if `start` does not exist
    pub async fn traverse(
        &self,
        ctx: &CallContext,
        start: &str,
        max_depth: u32,
        relation_types: &[String],
    ) -> Result<Traversal> {
        let timer = Instant::now();
        let depth = Depth::within(max_depth, 0, self.config.max_traverse_depth)?;
        let start_entity = self.require_entity(ctx, start).await?;

        let mut visited: HashSet<String> = HashSet::from([start_entity.id.clone()]);
        let mut frontier = vec![start_entity.id.clone()];
        let mut reached: Vec<(u32, Hop)> = Vec::new();

        for level in 1..=depth.get() {
            if frontier.is_empty() {
                break;
            }
            let hops = self
                .expand(ctx, &frontier, relation_types, &mut visited)
                .await?;
            frontier = hops.iter().map(|h| h.to_id.clone()).collect();
            reached.extend(hops.into_iter().map(|h| (level, h)));
        }

        let ids: Vec<String> = reached.iter().map(|(_, h)| h.to_id.clone()).collect();
        let mut entities: HashMap<String, Entity> = self
            .store
            .get(ctx, MemoryKind::Entity, &ids)
            .await?
            .into_iter()
            .filter_map(Entity::from_record)
            .map(|e| (e.id.clone(), e))
            .collect();

        let neighbors: Vec<GraphNeighbor> = reached
            .into_iter()
            .filter_map(|(depth, via)| {
                entities.remove(&via.to_id).map(|entity| GraphNeighbor {
                    entity,
                    depth,
                    via,
                })
            })
            .collect();

        debug!(
            start = %start_entity.id,
            depth = depth.get(),
            neighbors = neighbors.len(),
            elapsed_us = timer.elapsed().as_micros(),
            "traverse"
        );
        Ok(Traversal {
            start: start_entity,
            neighbors,
        })
    }

    /// Shortest path from `from` to `to`, following edges in both
    /// directions, at most `max_depth` hops long.
    ///
    /// No path within the bound is `found = false`, not an error.
    ///
    /// # Errors
    ///
    /// - [`RecallError::Validation`] if `max_depth` is 0 or exceeds the cap
    /// - [`RecallError::NotFound`] if either endpoint does not exist
    pub async fn find_path(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        max_depth: u32,
    ) -> Result<PathResult> {
        let timer = Instant::now();
        let depth = Depth::within(max_depth, 1, self.config.max_path_depth)?;
        let source = self.require_entity(ctx, from).await?;
        let target = self.require_entity(ctx, to).await?;
        if source.id == target.id {
            return Ok(PathResult {
                found: true,
                hops: Vec::new(),
            });
        }

        let mut visited: HashSet<String> = HashSet::from([source.id.clone()]);
        let mut parents: HashMap<String, Hop> = HashMap::new();
        let mut frontier = vec![source.id.clone()];
        let mut found = false;

        for _ in 0..depth.get() {
            if frontier.is_empty() {
                break;
            }
            let hops = self.expand(ctx, &frontier, &[], &mut visited).await?;
            frontier = hops.iter().map(|h| h.to_id.clone()).collect();
            for hop in hops {
                parents.insert(hop.to_id.clone(), hop);
            }
            if parents.contains_key(&target.id) {
                found = true;
                break;
            }
        }

        let mut hops = Vec::new();
        if found {
            let mut cursor = target.id.clone();
            while let Some(hop) = parents.remove(&cursor) {
                cursor.clone_from(&hop.from_id);
                hops.push(hop);
            }
            hops.reverse();
        }

        debug!(
            from = %source.id,
            to = %target.id,
            found,
            hops = hops.len(),
            elapsed_us = timer.elapsed().as_micros(),
            "find path"
        );
        Ok(PathResult { found, hops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{EntityDraft, Record};
    use crate::store::SqliteStore;
    use crate::types::{Embedding, now};

    async fn graph(nodes: &[&str], edges: &[(&str, &str, &str)]) -> GraphEngine {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let ctx = CallContext::background();
        for id in nodes {
            let e = EntityDraft::new(*id, "node", "n").into_entity(
                (*id).to_string(),
                Embedding(vec![1.0]),
                now(),
            );
            store.upsert(&ctx, Record::Entity(e)).await.expect("node");
        }
        for (from, to, ty) in edges {
            store
                .create_relation(
                    &ctx,
                    Relation {
                        from_id: (*from).into(),
                        to_id: (*to).into(),
                        relation_type: (*ty).into(),
                        weight: 1.0,
                        created_at: now(),
                    },
                )
                .await
                .expect("edge");
        }
        GraphEngine::new(store, GraphConfig::default())
    }

    #[tokio::test]
    async fn depth_zero_returns_only_start() {
        let g = graph(&["a", "b"], &[("a", "b", "knows")]).await;
        let t = g
            .traverse(&CallContext::background(), "a", 0, &[])
            .await
            .expect("traverse");
        assert_eq!(t.start.id, "a");
        assert!(t.neighbors.is_empty());
    }

    #[tokio::test]
    async fn traverse_walks_both_directions_and_survives_cycles() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("a", "b", "uses"), ("c", "b", "uses"), ("c", "a", "loops"), ("d", "c", "owns")],
        )
        .await;
        let t = g
            .traverse(&CallContext::background(), "a", 10, &[])
            .await
            .expect("traverse");
        let found: Vec<(&str, u32)> = t
            .neighbors
            .iter()
            .map(|n| (n.entity.id.as_str(), n.depth))
            .collect();
        assert_eq!(found, vec![("b", 1), ("c", 1), ("d", 2)]);
        let c = &t.neighbors[1];
        assert_eq!(c.via.relation_type, "loops");
        assert_eq!(c.via.direction, Direction::Incoming);
    }

    #[tokio::test]
    async fn traverse_filters_relation_types() {
        let g = graph(&["a", "b", "c"], &[("a", "b", "uses"), ("a", "c", "owns")]).await;
        let t = g
            .traverse(&CallContext::background(), "a", 2, &["owns".to_string()])
            .await
            .expect("traverse");
        assert_eq!(t.neighbors.len(), 1);
        assert_eq!(t.neighbors[0].entity.id, "c");
    }

    #[tokio::test]
    async fn traverse_rejects_depth_over_cap_and_missing_start() {
        let g = graph(&["a"], &[]).await;
        let ctx = CallContext::background();
        let err = g.traverse(&ctx, "a", 11, &[]).await.expect_err("cap");
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = g.traverse(&ctx, "ghost", 1, &[]).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn find_path_reports_hops_with_direction() {
        let g = graph(
            &["a", "b", "c", "x"],
            &[("a", "b", "calls"), ("c", "b", "implements")],
        )
        .await;
        let ctx = CallContext::background();
        let path = g.find_path(&ctx, "a", "c", 5).await.expect("path");
        assert!(path.found);
        assert_eq!(path.len(), 2);
        assert_eq!(path.hops[0].direction, Direction::Outgoing);
        assert_eq!(path.hops[1].from_id, "b");
        assert_eq!(path.hops[1].to_id, "c");
        assert_eq!(path.hops[1].direction, Direction::Incoming);

        let none = g.find_path(&ctx, "a", "x", 5).await.expect("no path");
        assert!(!none.found);
        assert!(none.is_empty());

        let short = g.find_path(&ctx, "a", "c", 1).await.expect("bounded");
        assert!(!short.found);
    }

    #[tokio::test]
    async fn find_path_errors_on_missing_endpoint() {
        let g = graph(&["a"], &[]).await;
        let err = g
            .find_path(&CallContext::background(), "a", "ghost", 3)
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
