//! Bulk corpus indexer. Runs the pipeline through the job manager and
//! renders progress until the job reaches a terminal state.
//!
//! Usage: indexer [CORPUS_DIR] [--collection NAME]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use rcpdb_cli::{exit_code, init_tracing};
use rcpdb_core::config::RetrievalConfig;
use rcpdb_core::error::{Error, Result};
use rcpdb_embed::ModelCache;
use rcpdb_ingest::jobs::{JobManager, JobStatus};
use rcpdb_ingest::pipeline::{IndexingPipeline, PipelineConfig};
use rcpdb_ingest::source::{DirStore, PlainTextExtractor};
use rcpdb_vector::VectorStore;

fn main() {
    init_tracing();
    let code = match run() {
        Ok(status) => match status {
            JobStatus::Completed => 0,
            JobStatus::Cancelled => 4,
            _ => 5,
        },
        Err(err) => {
            error!(error = %err, "indexing failed");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<JobStatus> {
    let config = RetrievalConfig::load()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut corpus_dir: Option<PathBuf> = None;
    let mut collection = "rcp_documents".to_string();
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
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown flag: {}", flag)));
            }
            path => corpus_dir = Some(PathBuf::from(path)),
        }
        i += 1;
    }
    let corpus_dir = corpus_dir.unwrap_or_else(|| PathBuf::from("corpus"));
    if !corpus_dir.is_dir() {
        return Err(Error::Config(format!(
            "corpus directory {} does not exist",
            corpus_dir.display()
        )));
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Internal(format!("runtime: {}", e)))?;
    runtime.block_on(run_job(config, corpus_dir, collection))
}

async fn run_job(
    config: RetrievalConfig,
    corpus_dir: PathBuf,
    collection: String,
) -> Result<JobStatus> {
    let embedder = ModelCache::global().embedder(&config.embedding_model, config.normalize_embeddings)?;
    let vectors = Arc::new(VectorStore::open(&config.vector_db_path().to_string_lossy()).await?);
    let pipeline = Arc::new(IndexingPipeline::new(
        Arc::new(DirStore::new(corpus_dir)),
        Arc::new(PlainTextExtractor),
        vectors,
        embedder,
        PipelineConfig::from_retrieval(&config, &collection),
    )?);

    let manager = JobManager::with_persistence(config.jobs_log_path());
    let job_id = manager.start("indexing", &collection, move |ctx| async move {
        let report = pipeline
            .process_corpus(&ctx, &ctx.cancel_token())
            .await?;
        serde_json::to_value(report).map_err(|e| Error::Internal(format!("report: {}", e)))
    });
    println!("job {job_id} started");

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let record = loop {
        let record = manager.status(&job_id)?;
        bar.set_length(record.progress.total as u64);
        bar.set_position(record.progress.current as u64);
        if let Some(item) = &record.progress.current_item {
            bar.set_message(item.clone());
        }
        if record.status.is_terminal() {
            break record;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    bar.finish_and_clear();

    match &record.result {
        Some(result) => println!("{}", serde_json::to_string_pretty(result).unwrap_or_default()),
        None => {
            if let Some(err) = &record.error {
                eprintln!("job ended {}: [{}] {}", record.status.as_str(), err.kind, err.message);
            }
        }
    }
    Ok(record.status)
}
