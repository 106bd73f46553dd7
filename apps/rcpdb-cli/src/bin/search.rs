//! Query a collection and print ranked passages with their citations.
//!
//! Usage: search "<query>" [--collection NAME] [--strategy dense|sparse|hybrid]
//!        [--top-k N] [--no-rerank]

use std::str::FromStr;
use std::sync::Arc;

use tracing::error;

use rcpdb_cli::{exit_code, init_tracing};
use rcpdb_core::config::RetrievalConfig;
use rcpdb_core::error::{Error, Result};
use rcpdb_core::types::{CancelToken, Strategy};
use rcpdb_embed::ModelCache;
use rcpdb_hybrid::{HybridRetriever, RetrievalRequest, RetrieverConfig};
use rcpdb_text::{Bm25Index, Bm25Params};
use rcpdb_vector::VectorStore;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        error!(error = %err, "search failed");
        std::process::exit(exit_code(&err));
    }
}

fn run() -> Result<()> {
    let config = RetrievalConfig::load()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut query: Option<String> = None;
    let mut collection = "rcp_documents".to_string();
    let mut request = RetrievalRequest::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--collection" => {
                i += 1;
                collection = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| Error::Config("--collection requires a name".into()))?;
            }
            "--strategy" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| Error::Config("--strategy requires a value".into()))?;
                request.strategy = Some(Strategy::from_str(value)?);
            }
            "--top-k" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| Error::Config("--top-k requires a number".into()))?;
                let parsed = value
                    .parse::<usize>()
                    .map_err(|_| Error::Config(format!("--top-k: not a number: {}", value)))?;
                request.reranker_top_k = Some(parsed);
            }
            "--no-rerank" => request.rerank = Some(false),
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown flag: {}", flag)));
            }
            text => query = Some(text.to_string()),
        }
        i += 1;
    }
    request.query = query.ok_or_else(|| Error::Config("a query argument is required".into()))?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Internal(format!("runtime: {}", e)))?;
    runtime.block_on(run_query(config, collection, request))
}

async fn run_query(
    config: RetrievalConfig,
    collection: String,
    request: RetrievalRequest,
) -> Result<()> {
    let vectors = Arc::new(VectorStore::open(&config.vector_db_path().to_string_lossy()).await?);

    // The collection manifest decides which models serve it.
    let manifest = vectors.require_manifest(&collection).await?;
    let embedder = ModelCache::global().embedder(&manifest.embedding_model, manifest.normalized)?;
    let reranker = ModelCache::global().reranker(&manifest.reranker_model)?;

    let bm25_path = config.bm25_index_path(&collection);
    let bm25 = Arc::new(Bm25Index::load_or_new(
        &bm25_path,
        Bm25Params {
            k1: config.bm25_k1,
            b: config.bm25_b,
        },
    ));

    let retriever = HybridRetriever::new(
        bm25,
        vectors,
        &collection,
        embedder,
        reranker,
        RetrieverConfig {
            default_strategy: config.strategy(),
            retrieval_top_k: config.retrieval_top_k,
            reranker_top_k: config.reranker_top_k,
            rerank: true,
            low_confidence_threshold: config.low_confidence_threshold,
            query_timeout: std::time::Duration::from_millis(config.query_timeout_ms),
            hybrid_alpha: config.hybrid_alpha,
        },
    )
    .await?;

    let response = retriever.retrieve(&request, &CancelToken::new()).await?;

    println!(
        "strategy={} low_confidence={}",
        response.strategy, response.low_confidence
    );
    for (rank, result) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} §{} {}",
            rank + 1,
            result.relevance_score,
            result.source_id,
            result.section_number,
            result.section_title
        );
        println!("   {}", snippet(&result.text, 240));
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut)
}
