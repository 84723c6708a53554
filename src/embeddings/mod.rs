//! Embedding generation
//!
//! - `EmbeddingProvider` trait: async interface for embedding generation
//! - `HttpEmbeddingProvider`: any OpenAI-compatible `/v1/embeddings` endpoint
//! - `MockEmbeddingProvider`: deterministic bag-of-words vectors for tests
//! - `EmbeddingService`: embeds nodes flagged `embeddings_dirty`, lazily
//!   before vector reads and from a periodic sweep

pub mod mock;
pub mod provider;
pub mod service;
pub mod traits;

pub use mock::MockEmbeddingProvider;
pub use provider::HttpEmbeddingProvider;
pub use service::{EmbeddingPass, EmbeddingService};
pub use traits::EmbeddingProvider;
