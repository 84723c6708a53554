//! Hybrid search
//!
//! - `lexical`: substring / fuzzy token / regex matching over text fields
//! - `vector`: cosine similarity over stored embeddings
//! - `fusion`: Reciprocal Rank Fusion of ranked lists
//! - `boost`: fuzzy keyword boosting after fusion
//! - `service`: `SearchService`, which waits for pending edits, runs the
//!   requested mode and reports staleness

pub mod boost;
pub mod fusion;
pub mod lexical;
pub mod models;
pub mod service;
pub mod vector;

pub use boost::{apply_keyword_boost, keyword_similarity};
pub use fusion::reciprocal_rank_fusion;
pub use lexical::{fuzzy_token_match, LexicalMatcher};
pub use models::{MatchedRange, SearchMode, SearchRequest, SearchResponse, SearchResult};
pub use service::SearchService;
pub use vector::cosine_similarity;
