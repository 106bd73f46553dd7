use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

pub type ChunkId = String;

/// A numbered section of a leaflet, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// Section number such as "4", "4.1" or "4.2.1"; "0" for preamble/fallback.
    pub number: String,
    pub title: String,
    pub text: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingMethod {
    SectionAware,
    Fallback,
}

impl ChunkingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingMethod::SectionAware => "section_aware",
            ChunkingMethod::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for ChunkingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChunkingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "section_aware" => Ok(ChunkingMethod::SectionAware),
            "fallback" => Ok(ChunkingMethod::Fallback),
            other => Err(Error::Internal(format!("unknown chunking method: {}", other))),
        }
    }
}

/// The unit of retrieval. Immutable once indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub source_id: String,
    pub section_number: String,
    pub section_title: String,
    /// Position within the section, 0-based.
    pub chunk_index: usize,
    pub chunking_method: ChunkingMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Dense,
    Sparse,
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Dense => "dense",
            Strategy::Sparse => "sparse",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense" => Ok(Strategy::Dense),
            "sparse" => Ok(Strategy::Sparse),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(Error::Config(format!("unknown strategy: {}", other))),
        }
    }
}

/// A ranked passage with its citation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub source_id: String,
    pub section_number: String,
    pub section_title: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub results: Vec<RetrievedChunk>,
    pub strategy: Strategy,
    pub low_confidence: bool,
}

/// Cooperative cancellation flag shared between a caller and a worker.
/// Workers check it at file boundaries; queries check it between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
