//! Relationship Explorer
//!
//! Bounded breadth-first traversal from one or more seed nodes. A visited set
//! keyed by uuid keeps cyclic graphs finite; depth is capped at
//! [`MAX_DEPTH`] and each expanded node fetches at most `max_nodes_per_hop`
//! neighbours per direction. File nodes are reported but never expanded, so
//! a traversal does not fan out to every sibling defined in the same file.

use crate::error::CoreError;
use crate::neo4j::models::{
    Direction, GraphNode, Relationship, RelationshipKey, SOURCE_FILE_LABEL,
};
use crate::neo4j::traits::GraphStore;
use crate::search::SearchResult;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_DEPTH: u8 = 3;
pub const DEFAULT_MAX_NODES_PER_HOP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreOptions {
    /// Hops from the roots, at most 3
    #[serde(default = "default_depth")]
    pub depth: u8,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default = "default_max_nodes_per_hop")]
    pub max_nodes_per_hop: usize,
}

fn default_depth() -> u8 {
    1
}

fn default_direction() -> Direction {
    Direction::Both
}

fn default_max_nodes_per_hop() -> usize {
    DEFAULT_MAX_NODES_PER_HOP
}

impl Default for ExploreOptions {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            direction: default_direction(),
            max_nodes_per_hop: default_max_nodes_per_hop(),
        }
    }
}

impl ExploreOptions {
    pub fn new(depth: u8, direction: Direction) -> Self {
        Self {
            depth,
            direction,
            ..Default::default()
        }
    }

    pub fn max_nodes_per_hop(mut self, max: usize) -> Self {
        self.max_nodes_per_hop = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploredNode {
    pub node: GraphNode,
    /// Hops from the nearest root
    pub depth: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploredEdge {
    pub relationship: Relationship,
    /// Relative to the node that was expanded when the edge was found
    pub direction: Direction,
    pub depth: u8,
}

/// Edges of one type seen in one direction. Incoming `CALLS` and outgoing
/// `CALLS` are separate groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeGroup {
    pub rel_type: String,
    pub direction: Direction,
    pub edges: Vec<RelationshipKey>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Exploration {
    pub roots: Vec<Uuid>,
    /// Nodes reached from the roots, roots excluded, in discovery order
    pub nodes: Vec<ExploredNode>,
    pub edges: Vec<ExploredEdge>,
    pub groups: Vec<EdgeGroup>,
    /// Some node had more neighbours than the per-hop cap
    pub truncated: bool,
}

impl Exploration {
    pub fn group(&self, rel_type: &str, direction: Direction) -> Option<&EdgeGroup> {
        self.groups
            .iter()
            .find(|g| g.rel_type == rel_type && g.direction == direction)
    }
}

pub struct RelationshipExplorer {
    store: Arc<dyn GraphStore>,
}

impl RelationshipExplorer {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Explore from a single node. Fails with `NotFound` if it does not exist.
    pub async fn explore(&self, root: Uuid, options: &ExploreOptions) -> Result<Exploration> {
        if self.store.get_node(root).await?.is_none() {
            return Err(CoreError::NotFound(format!("node {}", root)).into());
        }
        self.traverse(vec![root], options).await
    }

    /// Explore from several seeds at once. Missing seeds are skipped.
    pub async fn explore_many(
        &self,
        roots: &[Uuid],
        options: &ExploreOptions,
    ) -> Result<Exploration> {
        let existing: HashSet<Uuid> = self
            .store
            .get_nodes(roots)
            .await?
            .into_iter()
            .map(|n| n.uuid)
            .collect();
        let mut seeds = Vec::new();
        for uuid in roots {
            if existing.contains(uuid) && !seeds.contains(uuid) {
                seeds.push(*uuid);
            }
        }
        self.traverse(seeds, options).await
    }

    /// Attach relationship context to each result. A failed exploration
    /// leaves that result without context.
    pub async fn enrich_results(&self, results: &mut [SearchResult], options: &ExploreOptions) {
        for result in results.iter_mut() {
            match self.traverse(vec![result.node.uuid], options).await {
                Ok(exploration) => result.context = Some(exploration),
                Err(e) => warn!(uuid = %result.node.uuid, "Failed to explore result: {:#}", e),
            }
        }
    }

    async fn traverse(&self, roots: Vec<Uuid>, options: &ExploreOptions) -> Result<Exploration> {
        let max_depth = options.depth.min(MAX_DEPTH);
        let per_hop = options.max_nodes_per_hop.max(1);
        let directions: &[Direction] = match options.direction {
            Direction::Both => &[Direction::Outgoing, Direction::Incoming],
            Direction::Outgoing => &[Direction::Outgoing],
            Direction::Incoming => &[Direction::Incoming],
        };

        let mut visited: HashSet<Uuid> = roots.iter().copied().collect();
        let mut queue: VecDeque<(Uuid, u8)> = roots.iter().map(|r| (*r, 0)).collect();
        let mut seen_edges: HashSet<RelationshipKey> = HashSet::new();
        let mut groups: BTreeMap<(String, Direction), Vec<RelationshipKey>> = BTreeMap::new();
        let mut exploration = Exploration {
            roots,
            ..Default::default()
        };

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for direction in directions {
                // One extra row tells us whether the cap cut anything off
                let mut neighbors = self
                    .store
                    .get_neighbors(current, *direction, per_hop + 1)
                    .await?;
                if neighbors.len() > per_hop {
                    neighbors.truncate(per_hop);
                    exploration.truncated = true;
                }

                for neighbor in neighbors {
                    let key = neighbor.relationship.key();
                    if seen_edges.insert(key.clone()) {
                        groups
                            .entry((neighbor.relationship.rel_type.clone(), neighbor.direction))
                            .or_default()
                            .push(key);
                        exploration.edges.push(ExploredEdge {
                            relationship: neighbor.relationship,
                            direction: neighbor.direction,
                            depth: depth + 1,
                        });
                    }

                    let mut node = neighbor.node;
                    if !visited.insert(node.uuid) {
                        continue;
                    }
                    if node.label != SOURCE_FILE_LABEL {
                        queue.push_back((node.uuid, depth + 1));
                    }
                    node.strip_embeddings();
                    exploration.nodes.push(ExploredNode {
                        node,
                        depth: depth + 1,
                    });
                }
            }
        }

        exploration.groups = groups
            .into_iter()
            .map(|((rel_type, direction), edges)| EdgeGroup {
                rel_type,
                direction,
                edges,
            })
            .collect();
        debug!(
            roots = exploration.roots.len(),
            nodes = exploration.nodes.len(),
            edges = exploration.edges.len(),
            truncated = exploration.truncated,
            "Exploration finished"
        );
        Ok(exploration)
    }
}
