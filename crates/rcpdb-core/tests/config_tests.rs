use rcpdb_core::config::RetrievalConfig;
use rcpdb_core::types::Strategy;

#[test]
fn defaults_match_documented_values() {
    let config = RetrievalConfig::default();
    assert_eq!(config.bm25_k1, 1.5);
    assert_eq!(config.bm25_b, 0.75);
    assert_eq!(config.retrieval_top_k, 20);
    assert_eq!(config.reranker_top_k, 5);
    assert_eq!(config.chunk_size, 512);
    assert_eq!(config.chunk_overlap, 100);
    assert_eq!(config.max_concurrent, 20);
    assert_eq!(config.batch_size, 500);
    assert!(config.chunk_by_section);
    assert_eq!(config.strategy(), Strategy::Hybrid);
    assert!(config.validate().is_ok());
}

#[test]
fn bm25_path_is_stable_per_collection() {
    let config = RetrievalConfig::default();
    let path = config.bm25_index_path("rcp_documents");
    assert!(path.ends_with("bm25_index_rcp_documents.bin"));
}

#[test]
fn invalid_values_are_rejected() {
    let mut config = RetrievalConfig::default();
    config.chunk_overlap = config.chunk_size;
    assert!(config.validate().is_err());

    let mut config = RetrievalConfig::default();
    config.bm25_b = 1.5;
    assert!(config.validate().is_err());

    let mut config = RetrievalConfig::default();
    config.retrieval_strategy = "fulltext".into();
    assert!(config.validate().is_err());

    let mut config = RetrievalConfig::default();
    config.embedding_model = "  ".into();
    assert!(config.validate().is_err());
}
