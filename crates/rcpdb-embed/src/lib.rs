//! Model services: the bi-encoder used for dense indexing/queries and the
//! cross-encoder used for reranking, both behind a process-wide cache.
//!
//! Real models are the XLM-Roberta family (BGE-M3 / BGE reranker) loaded
//! through candle from a local model directory. Setting
//! `RCPDB_USE_FAKE_MODELS=1` swaps in small deterministic stand-ins so tests
//! and development never touch multi-gigabyte weights.

pub mod cache;
pub mod device;
pub mod embedder;
pub mod encode;
pub mod pool;
pub mod rerank;
pub mod weights;

pub use cache::ModelCache;
pub use embedder::FAKE_EMBEDDING_DIM;

/// Env switch shared by the embedder and the reranker.
pub const FAKE_MODELS_ENV: &str = "RCPDB_USE_FAKE_MODELS";

pub(crate) fn use_fake_models() -> bool {
    std::env::var(FAKE_MODELS_ENV)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
