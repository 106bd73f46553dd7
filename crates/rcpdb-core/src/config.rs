//! Configuration loader for the retrieval core.
//!
//! Merges `config.toml` with bare environment variable overrides
//! (EMBEDDING_MODEL, BM25_K1, ...). Every key is optional and falls back to
//! the defaults below. Path helpers expand `~` and `${VAR}`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::Strategy;

const ENV_KEYS: &[&str] = &[
    "DATA_DIR",
    "EMBEDDING_MODEL",
    "RERANKER_MODEL",
    "RETRIEVAL_STRATEGY",
    "BM25_K1",
    "BM25_B",
    "HYBRID_ALPHA",
    "RETRIEVAL_TOP_K",
    "RERANKER_TOP_K",
    "CHUNK_BY_SECTION",
    "CHUNK_SIZE",
    "CHUNK_OVERLAP",
    "MAX_CONCURRENT",
    "BATCH_SIZE",
    "LOW_CONFIDENCE_THRESHOLD",
    "QUERY_TIMEOUT_MS",
    "FILE_TIMEOUT_SECS",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,
    #[serde(default = "default_strategy")]
    pub retrieval_strategy: String,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    /// Accepted for compatibility; inert while fusion is rank-based (RRF).
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_reranker_top_k")]
    pub reranker_top_k: usize,
    #[serde(default = "default_true")]
    pub chunk_by_section: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub normalize_embeddings: bool,
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_embedding_model() -> String {
    "BAAI/bge-m3".to_string()
}
fn default_reranker_model() -> String {
    "BAAI/bge-reranker-v2-m3".to_string()
}
fn default_strategy() -> String {
    "hybrid".to_string()
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_hybrid_alpha() -> f64 {
    0.5
}
fn default_retrieval_top_k() -> usize {
    20
}
fn default_reranker_top_k() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_max_concurrent() -> usize {
    20
}
fn default_batch_size() -> usize {
    500
}
fn default_low_confidence_threshold() -> f32 {
    0.25
}
fn default_query_timeout_ms() -> u64 {
    30_000
}
fn default_file_timeout_secs() -> u64 {
    300
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding_model: default_embedding_model(),
            reranker_model: default_reranker_model(),
            retrieval_strategy: default_strategy(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            hybrid_alpha: default_hybrid_alpha(),
            retrieval_top_k: default_retrieval_top_k(),
            reranker_top_k: default_reranker_top_k(),
            chunk_by_section: true,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            low_confidence_threshold: default_low_confidence_threshold(),
            query_timeout_ms: default_query_timeout_ms(),
            file_timeout_secs: default_file_timeout_secs(),
            normalize_embeddings: true,
        }
    }
}

impl RetrievalConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(toml_path: &Path) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(toml_path))
            .merge(
                Env::raw()
                    .only(ENV_KEYS)
                    .map(|key| key.as_str().to_ascii_lowercase().into()),
            )
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.bm25_k1 <= 0.0 {
            return Err(Error::Config("bm25_k1 must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(Error::Config("bm25_b must lie in [0, 1]".into()));
        }
        if self.retrieval_top_k == 0 || self.reranker_top_k == 0 {
            return Err(Error::Config("top_k values must be positive".into()));
        }
        if self.max_concurrent == 0 || self.batch_size == 0 {
            return Err(Error::Config(
                "max_concurrent and batch_size must be positive".into(),
            ));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(Error::Config("embedding_model must not be empty".into()));
        }
        Strategy::from_str(&self.retrieval_strategy)?;
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        // validate() has already vetted the string.
        Strategy::from_str(&self.retrieval_strategy).unwrap_or(Strategy::Hybrid)
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// Stable on-disk location of a collection's BM25 file.
    pub fn bm25_index_path(&self, collection: &str) -> PathBuf {
        self.data_dir()
            .join(format!("bm25_index_{}.bin", collection))
    }

    /// LanceDB database directory shared by all collections.
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir().join("lancedb")
    }

    pub fn jobs_log_path(&self) -> PathBuf {
        self.data_dir().join("jobs.log")
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}
