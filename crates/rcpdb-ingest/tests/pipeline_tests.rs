use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcpdb_core::error::{Error, Result};
use rcpdb_core::types::CancelToken;
use rcpdb_embed::{ModelCache, FAKE_MODELS_ENV};
use rcpdb_ingest::pipeline::{IndexingPipeline, NoProgress, PipelineConfig};
use rcpdb_ingest::source::{DirStore, PlainTextExtractor, TextExtractor};
use rcpdb_text::Bm25Params;
use rcpdb_vector::VectorStore;

const COLLECTION: &str = "rcp_documents";

const LEAFLET_A: &str = "\
4.1 INDICAŢII TERAPEUTICE
Aspirina este indicată pentru durere uşoară şi moderată.
4.2 DOZE ŞI MOD DE ADMINISTRARE
Doza maximă zilnică este de 4 g.
";

const LEAFLET_B: &str = "\
4.1 INDICAŢII TERAPEUTICE
Paracetamolul este indicat pentru febră.
4.3 CONTRAINDICAŢII
Insuficienţă hepatică severă.
";

const LEAFLET_C: &str = "\
4.1 INDICAŢII TERAPEUTICE
Ibuprofenul este indicat pentru inflamaţie.
4.8 REACŢII ADVERSE
Reacţii gastrointestinale.
";

fn pipeline_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        collection: COLLECTION.to_string(),
        reranker_model: "BAAI/bge-reranker-v2-m3".to_string(),
        max_concurrent: 4,
        batch_size: 100,
        chunk_size: 512,
        chunk_overlap: 100,
        use_section_chunking: true,
        normalized_embeddings: true,
        file_timeout: Duration::from_secs(30),
        bm25_params: Bm25Params::default(),
        bm25_path: root.join("data").join("bm25_index_rcp_documents.bin"),
    }
}

async fn build_pipeline(root: &Path, corpus_dir: &Path) -> IndexingPipeline {
    std::env::set_var(FAKE_MODELS_ENV, "1");
    let embedder = ModelCache::global().embedder("BAAI/bge-m3", true).unwrap();
    let vectors = Arc::new(
        VectorStore::open(&root.join("lancedb").to_string_lossy())
            .await
            .unwrap(),
    );
    IndexingPipeline::new(
        Arc::new(DirStore::new(corpus_dir)),
        Arc::new(PlainTextExtractor),
        vectors,
        embedder,
        pipeline_config(root),
    )
    .unwrap()
}

async fn open_vectors(root: &Path) -> VectorStore {
    VectorStore::open(&root.join("lancedb").to_string_lossy())
        .await
        .unwrap()
}

#[tokio::test]
async fn corpus_run_populates_both_indexes_consistently() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    fs::write(corpus.join("a.txt"), LEAFLET_A).unwrap();
    fs::write(corpus.join("b.txt"), LEAFLET_B).unwrap();

    let pipeline = build_pipeline(dir.path(), &corpus).await;
    let report = pipeline
        .process_corpus(&NoProgress, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.processed_ok, 2);
    assert_eq!(report.processed_failed, 0);
    assert!(report.chunks_indexed >= 4, "two sections per document");

    // Sparse and dense state agree on the chunk id set.
    let bm25 = pipeline.bm25();
    let snapshot = bm25.snapshot();
    assert_eq!(snapshot.n_docs(), report.chunks_indexed);
    let vectors = open_vectors(dir.path()).await;
    assert_eq!(vectors.count(COLLECTION).await.unwrap(), report.chunks_indexed);
    let ids = snapshot.chunk_ids().to_vec();
    let rows = vectors.get_by_ids(COLLECTION, &ids).await.unwrap();
    assert_eq!(rows.len(), ids.len());

    // The persisted BM25 file is in place.
    assert!(pipeline_config(dir.path()).bm25_path.exists());
}

#[tokio::test]
async fn interrupted_run_resumes_to_identical_bm25_bytes() {
    // Corpus A: index {a, b} first, then resume with c added.
    let resumed = tempfile::tempdir().unwrap();
    let corpus_a = resumed.path().join("corpus");
    fs::create_dir_all(&corpus_a).unwrap();
    fs::write(corpus_a.join("a.txt"), LEAFLET_A).unwrap();
    fs::write(corpus_a.join("b.txt"), LEAFLET_B).unwrap();

    let pipeline = build_pipeline(resumed.path(), &corpus_a).await;
    pipeline
        .process_corpus(&NoProgress, &CancelToken::new())
        .await
        .unwrap();

    fs::write(corpus_a.join("c.txt"), LEAFLET_C).unwrap();
    let pipeline = build_pipeline(resumed.path(), &corpus_a).await;
    let second = pipeline
        .process_corpus(&NoProgress, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(second.total, 3);
    assert_eq!(second.skipped, 2, "already-indexed sources are skipped");
    assert_eq!(second.processed_ok, 1);

    // Corpus B: the same three files in one uninterrupted run.
    let straight = tempfile::tempdir().unwrap();
    let corpus_b = straight.path().join("corpus");
    fs::create_dir_all(&corpus_b).unwrap();
    fs::write(corpus_b.join("a.txt"), LEAFLET_A).unwrap();
    fs::write(corpus_b.join("b.txt"), LEAFLET_B).unwrap();
    fs::write(corpus_b.join("c.txt"), LEAFLET_C).unwrap();
    let pipeline = build_pipeline(straight.path(), &corpus_b).await;
    pipeline
        .process_corpus(&NoProgress, &CancelToken::new())
        .await
        .unwrap();

    let resumed_bytes = fs::read(pipeline_config(resumed.path()).bm25_path).unwrap();
    let straight_bytes = fs::read(pipeline_config(straight.path()).bm25_path).unwrap();
    assert_eq!(resumed_bytes, straight_bytes);
}

struct FailOnMarker;

#[async_trait]
impl TextExtractor for FailOnMarker {
    async fn extract(&self, bytes: &[u8]) -> Result<String> {
        let text = String::from_utf8_lossy(bytes).to_string();
        if text.starts_with("BROKEN") {
            return Err(Error::External("extraction failed".into()));
        }
        Ok(text)
    }
}

#[tokio::test]
async fn per_file_failures_are_recorded_without_aborting() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    fs::write(corpus.join("a.txt"), LEAFLET_A).unwrap();
    fs::write(corpus.join("broken.txt"), "BROKEN bytes").unwrap();

    std::env::set_var(FAKE_MODELS_ENV, "1");
    let embedder = ModelCache::global().embedder("BAAI/bge-m3", true).unwrap();
    let vectors = Arc::new(open_vectors(dir.path()).await);
    let pipeline = IndexingPipeline::new(
        Arc::new(DirStore::new(&corpus)),
        Arc::new(FailOnMarker),
        vectors,
        embedder,
        pipeline_config(dir.path()),
    )
    .unwrap();

    let report = pipeline
        .process_corpus(&NoProgress, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.processed_ok, 1);
    assert_eq!(report.processed_failed, 1);
    assert_eq!(report.failed_items.len(), 1);
    assert_eq!(report.failed_items[0].id, "broken.txt");
    assert!(report.failed_items[0].reason.contains("extraction failed"));
}

#[tokio::test]
async fn cancelled_run_marks_unprocessed_files() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    fs::write(corpus.join("a.txt"), LEAFLET_A).unwrap();
    fs::write(corpus.join("b.txt"), LEAFLET_B).unwrap();

    let pipeline = build_pipeline(dir.path(), &corpus).await;
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = pipeline.process_corpus(&NoProgress, &cancel).await.unwrap();

    assert_eq!(report.processed_ok, 0);
    assert_eq!(report.processed_failed, 2);
    assert!(report
        .failed_items
        .iter()
        .all(|item| item.reason == "cancelled"));
}

#[tokio::test]
async fn process_single_indexes_one_document() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();

    let pipeline = build_pipeline(dir.path(), &corpus).await;
    let report = pipeline
        .process_single("manual.pdf", LEAFLET_A.as_bytes())
        .await
        .unwrap();

    assert_eq!(report.source_id, "manual.pdf");
    assert_eq!(report.chunk_count, 2);
    assert!(pipeline.bm25().contains("manual.pdf:4.1:0"));
    let vectors = open_vectors(dir.path()).await;
    assert!(vectors.contains_source(COLLECTION, "manual.pdf").await.unwrap());
}
