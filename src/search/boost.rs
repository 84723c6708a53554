//! Fuzzy keyword boosting
//!
//! Applied after fusion. A result whose name, path, title or signature
//! resembles one of the boost keywords gets `similarity * weight` added to its
//! score. Similarities under the floor add nothing.

use super::lexical::tokenize;
use super::models::{sort_results, SearchResult};
use crate::neo4j::models::props;

const BOOST_FIELDS: &[&str] = &[props::NAME, props::FILE_PATH, props::TITLE, props::SIGNATURE];

/// Similarity in `[0, 1]` between a keyword and a field value. A substring
/// match is 1.0; otherwise the best `1 - distance / max_len` over the
/// field's tokens.
pub fn keyword_similarity(keyword: &str, field: &str) -> f64 {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return 0.0;
    }
    let field = field.to_lowercase();
    if field.contains(&keyword) {
        return 1.0;
    }

    tokenize(&field)
        .iter()
        .map(|token| {
            let max_len = keyword.chars().count().max(token.chars().count());
            if max_len == 0 {
                return 0.0;
            }
            1.0 - strsim::levenshtein(&keyword, token) as f64 / max_len as f64
        })
        .fold(0.0, f64::max)
}

/// Best similarity of any keyword against any boost field of a result
fn best_similarity(result: &SearchResult, keywords: &[String]) -> f64 {
    let mut best = 0.0f64;
    for field in BOOST_FIELDS {
        let Some(value) = result.node.text(field) else {
            continue;
        };
        for keyword in keywords {
            best = best.max(keyword_similarity(keyword, value));
        }
    }
    best
}

/// Boost results in place and re-sort them. Returns whether any score changed.
pub fn apply_keyword_boost(
    results: &mut [SearchResult],
    keywords: &[String],
    weight: f64,
    floor: f64,
) -> bool {
    if keywords.iter().all(|k| k.trim().is_empty()) || weight <= 0.0 {
        return false;
    }

    let mut boosted = false;
    for result in results.iter_mut() {
        let similarity = best_similarity(result, keywords);
        if similarity < floor || similarity <= 0.0 {
            continue;
        }
        result.score += (similarity * weight).min(weight);
        boosted = true;
    }
    if boosted {
        sort_results(results);
    }
    boosted
}
