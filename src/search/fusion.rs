//! Reciprocal Rank Fusion

use std::collections::HashMap;
use std::hash::Hash;

/// Default RRF constant
pub const RRF_K: f64 = 60.0;

/// Fuse ranked lists of ids. Each list is best first; an id at 1-based rank
/// `r` contributes `1 / (k + r)`. Ids missing from a list get nothing from it.
/// Output is sorted by fused score, ties keep first-seen order.
pub fn reciprocal_rank_fusion<T>(lists: &[Vec<T>], k: f64) -> Vec<(T, f64)>
where
    T: Clone + Eq + Hash,
{
    let mut scores: HashMap<T, (f64, usize)> = HashMap::new();
    let mut seen = 0usize;

    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            let entry = scores.entry(id.clone()).or_insert_with(|| {
                seen += 1;
                (0.0, seen)
            });
            entry.0 += 1.0 / (k + rank as f64 + 1.0);
        }
    }

    let mut fused: Vec<(T, f64, usize)> = scores
        .into_iter()
        .map(|(id, (score, order))| (id, score, order))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
    fused.into_iter().map(|(id, score, _)| (id, score)).collect()
}
