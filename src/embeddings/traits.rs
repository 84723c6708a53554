//! EmbeddingProvider trait definition

use anyhow::Result;
use async_trait::async_trait;

/// Abstract interface for generating vector embeddings from text.
///
/// Shared across tasks as `Arc<dyn EmbeddingProvider>`. Its absence restricts
/// search to lexical mode.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate a vector embedding for a single text input.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, one per input, in order.
    /// All-or-nothing: an error means no embedding of the batch is usable.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the produced vectors. Must match the vector
    /// index configuration.
    fn dimensions(&self) -> usize;

    /// The model name, stored alongside embeddings for traceability.
    fn model_name(&self) -> &str;
}
