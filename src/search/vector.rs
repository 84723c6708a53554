//! Vector scoring helpers

use crate::neo4j::models::GraphNode;
use std::collections::HashMap;
use uuid::Uuid;

/// Cosine similarity in `[-1, 1]`. Mismatched lengths or a zero vector score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Merge per-field hit lists, keeping each node's best score. Output is
/// sorted best first with uuid as tie-breaker.
pub fn merge_field_hits(lists: Vec<Vec<(GraphNode, f64)>>) -> Vec<(GraphNode, f64)> {
    let mut best: HashMap<Uuid, (GraphNode, f64)> = HashMap::new();
    for (node, score) in lists.into_iter().flatten() {
        match best.get_mut(&node.uuid) {
            Some(entry) if entry.1 >= score => {}
            Some(entry) => entry.1 = score,
            None => {
                best.insert(node.uuid, (node, score));
            }
        }
    }
    let mut merged: Vec<(GraphNode, f64)> = best.into_values().collect();
    merged.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.uuid.cmp(&b.0.uuid)));
    merged
}
