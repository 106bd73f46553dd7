use rcpdb_core::types::{Chunk, ChunkingMethod};
use rcpdb_embed::{ModelCache, FAKE_MODELS_ENV};
use rcpdb_vector::{CollectionManifest, VectorStore};

fn manifest(dim: usize) -> CollectionManifest {
    CollectionManifest {
        embedding_model: "BAAI/bge-m3".to_string(),
        reranker_model: "BAAI/bge-reranker-v2-m3".to_string(),
        dim,
        normalized: true,
    }
}

fn chunk(id: &str, source: &str, text: &str) -> Chunk {
    Chunk {
        chunk_id: id.to_string(),
        text: text.to_string(),
        source_id: source.to_string(),
        section_number: "4.1".to_string(),
        section_title: "INDICAŢII".to_string(),
        chunk_index: 0,
        chunking_method: ChunkingMethod::SectionAware,
    }
}

async fn seeded_store(dir: &tempfile::TempDir) -> (VectorStore, Vec<Chunk>) {
    std::env::set_var(FAKE_MODELS_ENV, "1");
    let embedder = ModelCache::global()
        .embedder("BAAI/bge-m3", true)
        .expect("embedder");

    let store = VectorStore::open(&dir.path().to_string_lossy())
        .await
        .expect("open store");
    store
        .ensure_collection("rcp_documents", &manifest(embedder.dim()))
        .await
        .expect("ensure collection");

    let chunks = vec![
        chunk("a.pdf:4.1:0", "a.pdf", "aspirina pentru durere"),
        chunk("a.pdf:4.1:1", "a.pdf", "doza maxima zilnica"),
        chunk("b.pdf:4.1:0", "b.pdf", "paracetamol pentru febra"),
    ];
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).expect("embeddings");
    store
        .upsert_chunks("rcp_documents", &chunks, &embeddings, 2)
        .await
        .expect("upsert");
    (store, chunks)
}

#[tokio::test]
async fn upsert_then_query_returns_nearest_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = seeded_store(&dir).await;

    let embedder = ModelCache::global().embedder("BAAI/bge-m3", true).unwrap();
    let query = embedder
        .embed_batch(&["aspirina pentru durere".to_string()])
        .unwrap()
        .remove(0);

    let hits = store.query("rcp_documents", &query, 2).await.expect("query");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk.chunk_id, "a.pdf:4.1:0");
    assert!(hits[0].score >= hits[1].score);
    assert!(hits[0].score > 0.99, "identical text should be ~1.0 cosine");
    assert_eq!(hits[0].chunk.section_number, "4.1");
}

#[tokio::test]
async fn upsert_is_idempotent_per_chunk_id() {
    let dir = tempfile::tempdir().unwrap();
    let (store, chunks) = seeded_store(&dir).await;

    let embedder = ModelCache::global().embedder("BAAI/bge-m3", true).unwrap();
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).unwrap();
    store
        .upsert_chunks("rcp_documents", &chunks, &embeddings, 500)
        .await
        .expect("second upsert");

    assert_eq!(store.count("rcp_documents").await.unwrap(), 3);
}

#[tokio::test]
async fn source_presence_and_id_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = seeded_store(&dir).await;

    assert!(store
        .contains_source("rcp_documents", "a.pdf")
        .await
        .unwrap());
    assert!(!store
        .contains_source("rcp_documents", "missing.pdf")
        .await
        .unwrap());

    let rows = store
        .get_by_ids(
            "rcp_documents",
            &["a.pdf:4.1:1".to_string(), "b.pdf:4.1:0".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|c| c.text == "doza maxima zilnica"));
}

#[tokio::test]
async fn rebinding_a_collection_to_another_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = seeded_store(&dir).await;

    let mut other = manifest(1024);
    other.embedding_model = "some/other-model".to_string();
    let err = store
        .ensure_collection("rcp_documents", &other)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "config_error");

    let wrong_dim = manifest(768);
    let err = store
        .ensure_collection("rcp_documents", &wrong_dim)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "config_error");
}

#[tokio::test]
async fn dimension_mismatch_on_write_and_query_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (store, chunks) = seeded_store(&dir).await;

    let bad = vec![vec![0.5f32; 8]; chunks.len()];
    let err = store
        .upsert_chunks("rcp_documents", &chunks, &bad, 500)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "config_error");

    let err = store
        .query("rcp_documents", &[0.5f32; 8], 3)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "config_error");
}

#[tokio::test]
async fn collections_can_be_listed_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = seeded_store(&dir).await;

    let names = store.list_collections().await.unwrap();
    assert_eq!(names, vec!["rcp_documents".to_string()]);

    store.delete_collection("rcp_documents").await.unwrap();
    assert!(store.list_collections().await.unwrap().is_empty());
    assert!(store
        .manifest("rcp_documents")
        .await
        .unwrap()
        .is_none());

    let err = store.delete_collection("rcp_documents").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn unknown_collection_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var(FAKE_MODELS_ENV, "1");
    let store = VectorStore::open(&dir.path().to_string_lossy())
        .await
        .unwrap();
    let err = store.query("nope", &[0.0f32; 4], 3).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
