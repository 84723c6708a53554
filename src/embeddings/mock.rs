//! Mock embedding provider for tests
//!
//! Vectors are bags of hashed tokens, so texts sharing words are closer in
//! cosine space than unrelated texts. Same text, same vector.

use super::traits::EmbeddingProvider;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic mock embedding provider.
///
/// ```rust
/// use knowledge_sync::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
///
/// # tokio_test::block_on(async {
/// let provider = MockEmbeddingProvider::new(64);
/// let a = provider.embed_text("parse the config file").await.unwrap();
/// assert_eq!(a.len(), 64);
/// assert_eq!(a, provider.embed_text("parse the config file").await.unwrap());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    /// Return `vector` for exactly `text`.
    pub fn with_override(self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(text.to_string(), vector);
        self
    }

    /// Make every following call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of texts embedded so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bucket(token: &str, salt: u8) -> u64 {
        let mut hasher = DefaultHasher::new();
        salt.hash(&mut hasher);
        token.hash(&mut hasher);
        hasher.finish()
    }

    fn text_to_embedding(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(text)
        {
            return v.clone();
        }

        let mut embedding = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return embedding;
        }
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let idx = (Self::bucket(token, 0) % self.dimensions as u64) as usize;
            let sign = if Self::bucket(token, 1) % 2 == 0 { 1.0 } else { -1.0 };
            embedding[idx] += sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("mock embedding provider set to fail");
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text_to_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("mock embedding provider set to fail");
        }
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.text_to_embedding(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "mock-bag-of-words"
    }
}
