//! Bulk corpus indexing.
//!
//! Files flow download -> extract -> parse -> chunk -> embed -> vector
//! upsert under a bounded number of in-flight workers. BM25 appends are
//! serialized through the index's single writer in enumeration order, so a
//! rerun (or a resumed run after a crash) reproduces the exact same
//! persisted bytes as one uninterrupted pass. A file only counts as
//! processed when both the vector upsert and the BM25 commit succeeded;
//! per-file failures are recorded and never abort the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use rcpdb_core::chunker::{Chunker, ChunkerConfig};
use rcpdb_core::config::RetrievalConfig;
use rcpdb_core::error::{Error, Result};
use rcpdb_core::section::{section_stats, SectionParser};
use rcpdb_core::tokenize::tokenize;
use rcpdb_core::traits::Embedder;
use rcpdb_core::types::{CancelToken, Chunk, ChunkId};
use rcpdb_text::{Bm25Index, Bm25Params};
use rcpdb_vector::{CollectionManifest, VectorStore};

use crate::jobs::FailedItem;
use crate::source::{DocumentStore, TextExtractor};

/// Progress receiver; the job manager implements this, and so does the CLI
/// progress bar.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, current: usize, total: usize, current_item: &str);
    fn file_ok(&self, _source_id: &str) {}
    fn file_failed(&self, _source_id: &str, _reason: &str) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _current: usize, _total: usize, _current_item: &str) {}
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub collection: String,
    pub reranker_model: String,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub use_section_chunking: bool,
    pub normalized_embeddings: bool,
    pub file_timeout: Duration,
    pub bm25_params: Bm25Params,
    pub bm25_path: PathBuf,
}

impl PipelineConfig {
    pub fn from_retrieval(config: &RetrievalConfig, collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            reranker_model: config.reranker_model.clone(),
            max_concurrent: config.max_concurrent,
            batch_size: config.batch_size,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            use_section_chunking: config.chunk_by_section,
            normalized_embeddings: config.normalize_embeddings,
            file_timeout: Duration::from_secs(config.file_timeout_secs),
            bm25_params: Bm25Params {
                k1: config.bm25_k1,
                b: config.bm25_b,
            },
            bm25_path: config.bm25_index_path(collection),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexReport {
    pub total: usize,
    pub skipped: usize,
    pub processed_ok: usize,
    pub processed_failed: usize,
    pub chunks_indexed: usize,
    pub failed_items: Vec<FailedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerFileReport {
    pub source_id: String,
    pub chunk_count: usize,
}

/// Per-file output handed to the ordered BM25 committer.
struct FileOutput {
    bm25_items: Vec<(ChunkId, Vec<String>)>,
    chunk_count: usize,
}

pub struct IndexingPipeline {
    store: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    bm25: Arc<Bm25Index>,
    parser: Arc<SectionParser>,
    chunker: Arc<Chunker>,
    config: PipelineConfig,
}

impl IndexingPipeline {
    /// Opens (or starts) the collection's BM25 state from disk. A corrupt
    /// file is logged and rebuilt from scratch.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let chunker = Chunker::new(ChunkerConfig {
            chunk_size: config.chunk_size,
            overlap: config.chunk_overlap,
            chunk_by_section: config.use_section_chunking,
        })?;
        let bm25 = Bm25Index::load_or_new(&config.bm25_path, config.bm25_params);
        Ok(Self {
            store,
            extractor,
            vectors,
            embedder,
            bm25: Arc::new(bm25),
            parser: Arc::new(SectionParser::new()),
            chunker: Arc::new(chunker),
            config,
        })
    }

    /// Shared handle to the collection's BM25 index, for query serving.
    pub fn bm25(&self) -> Arc<Bm25Index> {
        self.bm25.clone()
    }

    fn manifest(&self) -> CollectionManifest {
        CollectionManifest {
            embedding_model: self.embedder.model_id().to_string(),
            reranker_model: self.config.reranker_model.clone(),
            dim: self.embedder.dim(),
            normalized: self.config.normalized_embeddings,
        }
    }

    /// Index every document the store lists that is not already present in
    /// the collection. Cancellation is honored at file boundaries.
    pub async fn process_corpus(
        &self,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        self.vectors
            .ensure_collection(&self.config.collection, &self.manifest())
            .await?;

        let all = self.store.list().await?;
        let total = all.len();
        info!(collection = %self.config.collection, total, "corpus enumeration complete");

        // Resume safety: a source whose chunks are already in the vector
        // collection was fully processed by an earlier run.
        let mut to_process: Vec<String> = Vec::new();
        let mut skipped = 0usize;
        for source_id in all {
            if self
                .vectors
                .contains_source(&self.config.collection, &source_id)
                .await?
            {
                skipped += 1;
            } else {
                to_process.push(source_id);
            }
        }
        progress.progress(skipped, total, "");

        let checkpoint_every = (to_process.len() / 20).max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut workers: JoinSet<(usize, String, std::result::Result<FileOutput, String>)> =
            JoinSet::new();

        for (index, source_id) in to_process.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let extractor = self.extractor.clone();
            let vectors = self.vectors.clone();
            let embedder = self.embedder.clone();
            let parser = self.parser.clone();
            let chunker = self.chunker.clone();
            let cancel = cancel.clone();
            let collection = self.config.collection.clone();
            let batch_size = self.config.batch_size;
            let file_timeout = self.config.file_timeout;

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, source_id, Err("semaphore closed".to_string())),
                };
                if cancel.is_cancelled() {
                    return (index, source_id, Err("cancelled".to_string()));
                }
                let work = process_file(
                    store, extractor, vectors, embedder, parser, chunker, cancel, collection,
                    batch_size, &source_id,
                );
                let outcome = match timeout(file_timeout, work).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(Error::Cancelled)) => Err("cancelled".to_string()),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err("timeout".to_string()),
                };
                (index, source_id, outcome)
            });
        }

        let mut report = IndexReport {
            total,
            skipped,
            ..IndexReport::default()
        };
        let mut pending: BTreeMap<usize, (String, std::result::Result<FileOutput, String>)> =
            BTreeMap::new();
        let mut next_commit = 0usize;
        let mut committed = 0usize;

        while let Some(joined) = workers.join_next().await {
            let (index, source_id, outcome) =
                joined.map_err(|e| Error::Internal(format!("worker panicked: {}", e)))?;
            pending.insert(index, (source_id, outcome));

            // Commit in enumeration order so the BM25 writer sees a
            // deterministic document sequence.
            while let Some((source_id, outcome)) = pending.remove(&next_commit) {
                next_commit += 1;
                committed += 1;
                match outcome {
                    Ok(output) => {
                        self.bm25.add_documents(&output.bm25_items);
                        report.processed_ok += 1;
                        report.chunks_indexed += output.chunk_count;
                        progress.file_ok(&source_id);
                        debug!(%source_id, chunks = output.chunk_count, "file indexed");
                    }
                    Err(reason) => {
                        warn!(%source_id, %reason, "file failed");
                        report.processed_failed += 1;
                        progress.file_failed(&source_id, &reason);
                        report.failed_items.push(FailedItem {
                            id: source_id.clone(),
                            reason,
                        });
                    }
                }
                progress.progress(skipped + committed, total, &source_id);
                if committed % checkpoint_every == 0 {
                    self.bm25.save(&self.config.bm25_path)?;
                }
            }
        }

        self.bm25.save(&self.config.bm25_path)?;
        info!(
            collection = %self.config.collection,
            ok = report.processed_ok,
            failed = report.processed_failed,
            skipped = report.skipped,
            chunks = report.chunks_indexed,
            "corpus indexing finished"
        );
        Ok(report)
    }

    /// Index one document from bytes already in hand. Used by tests and by
    /// single-file ingestion; commits BM25 immediately.
    pub async fn process_single(&self, source_id: &str, bytes: &[u8]) -> Result<PerFileReport> {
        self.vectors
            .ensure_collection(&self.config.collection, &self.manifest())
            .await?;
        let text = self.extractor.extract(bytes).await?;
        let output = index_text(
            &self.vectors,
            &self.embedder,
            &self.parser,
            &self.chunker,
            &self.config.collection,
            self.config.batch_size,
            source_id,
            &text,
        )
        .await?;
        self.bm25.add_documents(&output.bm25_items);
        self.bm25.save(&self.config.bm25_path)?;
        Ok(PerFileReport {
            source_id: source_id.to_string(),
            chunk_count: output.chunk_count,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    store: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    parser: Arc<SectionParser>,
    chunker: Arc<Chunker>,
    cancel: CancelToken,
    collection: String,
    batch_size: usize,
    source_id: &str,
) -> Result<FileOutput> {
    let bytes = store.fetch(source_id).await?;
    let text = extractor.extract(&bytes).await?;
    cancel.check()?;
    index_text(
        &vectors, &embedder, &parser, &chunker, &collection, batch_size, source_id, &text,
    )
    .await
}

/// Parse, chunk, embed and upsert one document's text; BM25 material is
/// returned to the caller for ordered commit.
#[allow(clippy::too_many_arguments)]
async fn index_text(
    vectors: &VectorStore,
    embedder: &Arc<dyn Embedder>,
    parser: &SectionParser,
    chunker: &Chunker,
    collection: &str,
    batch_size: usize,
    source_id: &str,
    text: &str,
) -> Result<FileOutput> {
    let parsed = parser.parse(text);
    let stats = section_stats(&parsed.sections);
    debug!(
        %source_id,
        sections = stats.total_sections,
        chars = stats.total_characters,
        "document parsed"
    );
    let chunks: Vec<Chunk> = chunker.chunk_document(source_id, &parsed);
    if chunks.is_empty() {
        return Ok(FileOutput {
            bm25_items: Vec::new(),
            chunk_count: 0,
        });
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embedder_task = embedder.clone();
    let embeddings = tokio::task::spawn_blocking(move || embedder_task.embed_batch(&texts))
        .await
        .map_err(|e| Error::Internal(format!("embedding task: {}", e)))??;

    vectors
        .upsert_chunks(collection, &chunks, &embeddings, batch_size)
        .await?;

    let bm25_items = chunks
        .iter()
        .map(|chunk| (chunk.chunk_id.clone(), tokenize(&chunk.text)))
        .collect();
    Ok(FileOutput {
        bm25_items,
        chunk_count: chunks.len(),
    })
}
