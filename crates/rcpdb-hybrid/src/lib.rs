//! Hybrid retrieval over one collection.
//!
//! Strategies: dense (bi-encoder + vector store), sparse (tokenizer + BM25),
//! or hybrid (both in parallel, fused by Reciprocal Rank Fusion, then
//! reranked by the cross-encoder). Fusion is rank-based; the `hybrid_alpha`
//! setting is accepted for compatibility but has no effect under RRF.

pub mod fusion;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use rcpdb_core::error::{Error, Result};
use rcpdb_core::tokenize::tokenize;
use rcpdb_core::traits::{Embedder, Reranker};
use rcpdb_core::types::{
    CancelToken, Chunk, ChunkId, RetrievalResponse, RetrievedChunk, Strategy,
};
use rcpdb_text::Bm25Index;
use rcpdb_vector::VectorStore;

pub use fusion::reciprocal_rank_fusion;

pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub default_strategy: Strategy,
    pub retrieval_top_k: usize,
    pub reranker_top_k: usize,
    pub rerank: bool,
    pub low_confidence_threshold: f32,
    pub query_timeout: Duration,
    /// Reserved for a score-based fusion mode; inert under RRF.
    pub hybrid_alpha: f64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Hybrid,
            retrieval_top_k: 20,
            reranker_top_k: 5,
            rerank: true,
            low_confidence_threshold: 0.25,
            query_timeout: Duration::from_secs(30),
            hybrid_alpha: 0.5,
        }
    }
}

/// Per-call parameters; unset fields fall back to the retriever config.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub query: String,
    pub strategy: Option<Strategy>,
    pub retrieval_top_k: Option<usize>,
    pub reranker_top_k: Option<usize>,
    pub rerank: Option<bool>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

pub struct HybridRetriever {
    bm25: Arc<Bm25Index>,
    vectors: Arc<VectorStore>,
    collection: String,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    config: RetrieverConfig,
}

/// A candidate between retrieval and reranking.
struct Candidate {
    chunk: Chunk,
    retrieval_score: f32,
}

impl HybridRetriever {
    /// Binds to a collection. The embedder and reranker must be the models
    /// recorded in the collection manifest; anything else is refused.
    pub async fn new(
        bm25: Arc<Bm25Index>,
        vectors: Arc<VectorStore>,
        collection: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        config: RetrieverConfig,
    ) -> Result<Self> {
        let collection = collection.into();
        let manifest = vectors.require_manifest(&collection).await?;
        if manifest.embedding_model != embedder.model_id() {
            return Err(Error::Config(format!(
                "collection '{}' is bound to embedding model '{}', got '{}'",
                collection,
                manifest.embedding_model,
                embedder.model_id()
            )));
        }
        if manifest.reranker_model != reranker.model_id() {
            return Err(Error::Config(format!(
                "collection '{}' is bound to reranker '{}', got '{}'",
                collection,
                manifest.reranker_model,
                reranker.model_id()
            )));
        }
        if manifest.dim != embedder.dim() {
            return Err(Error::Config(format!(
                "collection '{}' stores {}-dim vectors, embedder produces {}",
                collection,
                manifest.dim,
                embedder.dim()
            )));
        }
        Ok(Self {
            bm25,
            vectors,
            collection,
            embedder,
            reranker,
            config,
        })
    }

    /// Run a retrieval under the configured wall-clock budget. On expiry the
    /// call fails with `Timeout` and never returns partial results.
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        cancel: &CancelToken,
    ) -> Result<RetrievalResponse> {
        let budget = self.config.query_timeout;
        timeout(budget, self.retrieve_inner(request, cancel))
            .await
            .map_err(|_| Error::Timeout(format!("query exceeded {:?}", budget)))?
    }

    async fn retrieve_inner(
        &self,
        request: &RetrievalRequest,
        cancel: &CancelToken,
    ) -> Result<RetrievalResponse> {
        let strategy = request.strategy.unwrap_or(self.config.default_strategy);
        let retrieval_top_k = request.retrieval_top_k.unwrap_or(self.config.retrieval_top_k);
        let reranker_top_k = request.reranker_top_k.unwrap_or(self.config.reranker_top_k);
        let rerank = request.rerank.unwrap_or(self.config.rerank);
        cancel.check()?;

        let candidates = match strategy {
            Strategy::Dense => self.dense_candidates(&request.query, retrieval_top_k).await?,
            Strategy::Sparse => self.sparse_candidates(&request.query, retrieval_top_k).await?,
            Strategy::Hybrid => {
                self.hybrid_candidates(&request.query, retrieval_top_k, cancel)
                    .await?
            }
        };
        cancel.check()?;

        debug!(
            strategy = %strategy,
            candidates = candidates.len(),
            query = %request.query,
            "retrieval candidates gathered"
        );

        if candidates.is_empty() {
            return Ok(RetrievalResponse {
                results: Vec::new(),
                strategy,
                low_confidence: true,
            });
        }

        let max_retrieval_score = candidates
            .iter()
            .map(|c| c.retrieval_score)
            .fold(f32::MIN, f32::max);

        let (results, low_confidence) = if rerank {
            let ranked = self.rerank_candidates(&request.query, candidates).await?;
            let best = ranked.first().map(|r| r.relevance_score).unwrap_or(0.0);
            let confident = self.reranker.confidence(best) >= self.config.low_confidence_threshold;
            let mut ranked = ranked;
            ranked.truncate(reranker_top_k);
            (ranked, !confident)
        } else {
            let mut out: Vec<RetrievedChunk> = candidates.into_iter().map(to_retrieved).collect();
            out.truncate(reranker_top_k);
            // Without a reranker the dense similarity is the only bounded
            // signal available for the confidence check.
            let confident = match strategy {
                Strategy::Sparse => true,
                _ => max_retrieval_score >= self.config.low_confidence_threshold,
            };
            (out, !confident)
        };
        cancel.check()?;

        Ok(RetrievalResponse {
            results,
            strategy,
            low_confidence,
        })
    }

    async fn dense_candidates(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.embedder.clone();
        let text = query.to_string();
        let vector = tokio::task::spawn_blocking(move || {
            embedder.embed_batch(&[text]).map(|mut v| v.remove(0))
        })
        .await
        .map_err(|e| Error::Internal(format!("embedding task: {}", e)))??;

        let hits = self.vectors.query(&self.collection, &vector, top_k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| Candidate {
                chunk: hit.chunk,
                retrieval_score: hit.score,
            })
            .collect())
    }

    async fn sparse_candidates(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>> {
        let hits = self.bm25.query(&tokenize(query), top_k);
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ChunkId> = hits.iter().map(|(id, _)| id.clone()).collect();
        let chunks = self.hydrate(&ids).await?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                chunks.get(&id).map(|chunk| Candidate {
                    chunk: chunk.clone(),
                    retrieval_score: score as f32,
                })
            })
            .collect())
    }

    async fn hybrid_candidates(
        &self,
        query: &str,
        top_k: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Candidate>> {
        let (dense, sparse) = tokio::join!(
            self.dense_candidates(query, top_k),
            self.sparse_candidates(query, top_k)
        );
        let dense = dense?;
        let sparse = sparse?;
        cancel.check()?;

        // A dry sub-retrieval leaves the other ranking in charge.
        if dense.is_empty() {
            return Ok(sparse);
        }
        if sparse.is_empty() {
            return Ok(dense);
        }

        let dense_ids: Vec<ChunkId> = dense.iter().map(|c| c.chunk.chunk_id.clone()).collect();
        let sparse_ids: Vec<ChunkId> = sparse.iter().map(|c| c.chunk.chunk_id.clone()).collect();
        let fused = reciprocal_rank_fusion(&dense_ids, &sparse_ids, RRF_K);

        let mut by_id: HashMap<ChunkId, Chunk> = HashMap::new();
        for candidate in dense.into_iter().chain(sparse.into_iter()) {
            by_id.entry(candidate.chunk.chunk_id.clone())
                .or_insert(candidate.chunk);
        }

        Ok(fused
            .into_iter()
            .filter_map(|(id, score)| {
                by_id.remove(&id).map(|chunk| Candidate {
                    chunk,
                    retrieval_score: score as f32,
                })
            })
            .collect())
    }

    /// The vector store is the authoritative source of chunk text.
    async fn hydrate(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, Chunk>> {
        let rows = self.vectors.get_by_ids(&self.collection, ids).await?;
        Ok(rows
            .into_iter()
            .map(|chunk| (chunk.chunk_id.clone(), chunk))
            .collect())
    }

    async fn rerank_candidates(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<RetrievedChunk>> {
        let texts: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
        let reranker = self.reranker.clone();
        let query_owned = query.to_string();
        let scores = tokio::task::spawn_blocking(move || {
            reranker.score_pairs(&query_owned, &texts)
        })
        .await
        .map_err(|e| Error::Internal(format!("rerank task: {}", e)))??;
        if scores.len() != candidates.len() {
            return Err(Error::Internal(format!(
                "reranker returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let mut ranked: Vec<RetrievedChunk> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| {
                let mut retrieved = to_retrieved(candidate);
                retrieved.relevance_score = score;
                retrieved
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(ranked)
    }
}

fn to_retrieved(candidate: Candidate) -> RetrievedChunk {
    RetrievedChunk {
        chunk_id: candidate.chunk.chunk_id,
        text: candidate.chunk.text,
        source_id: candidate.chunk.source_id,
        section_number: candidate.chunk.section_number,
        section_title: candidate.chunk.section_title,
        relevance_score: candidate.retrieval_score,
    }
}
