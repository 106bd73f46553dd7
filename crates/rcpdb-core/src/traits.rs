//! Trait surfaces for the model seams.

use crate::error::Result;

/// Produces L2-normalized embedding vectors for input texts.
///
/// Implementations are shared across workers and must be safe for concurrent
/// invocation. Encoding is deterministic for a given model and input, up to
/// numerical tolerance.
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model, e.g. "BAAI/bge-m3".
    fn model_id(&self) -> &str;
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cross-encoder scoring of (query, passage) pairs.
///
/// Scores are model-dependent; only their ordering is meaningful.
pub trait Reranker: Send + Sync {
    fn model_id(&self) -> &str;
    /// One score per passage, in input order.
    fn score_pairs(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    /// Map a raw score into [0, 1] for the low-confidence check.
    /// Cross-encoder logits go through a sigmoid; scorers that already
    /// produce bounded values override this with the identity.
    fn confidence(&self, score: f32) -> f32 {
        1.0 / (1.0 + (-score).exp())
    }
}
