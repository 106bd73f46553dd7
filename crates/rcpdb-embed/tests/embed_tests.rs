use rcpdb_embed::{ModelCache, FAKE_EMBEDDING_DIM, FAKE_MODELS_ENV};
use std::sync::Arc;

fn force_fake_models() {
    std::env::set_var(FAKE_MODELS_ENV, "1");
}

#[test]
fn fake_embedder_shapes_and_determinism() {
    force_fake_models();

    let embedder = ModelCache::global()
        .embedder("BAAI/bge-m3", true)
        .expect("embedder");
    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).expect("embed_batch");

    assert_eq!(embs[0].len(), FAKE_EMBEDDING_DIM);

    let norm: f32 = embs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "L2-normalized (norm={norm})");

    for (a, b) in embs[0].iter().zip(embs[1].iter()) {
        assert!((a - b).abs() <= 1e-6);
    }
}

#[test]
fn different_texts_embed_differently() {
    force_fake_models();

    let embedder = ModelCache::global()
        .embedder("BAAI/bge-m3", true)
        .expect("embedder");
    let embs = embedder
        .embed_batch(&["aspirina 500 mg".to_string(), "paracetamol".to_string()])
        .expect("embed_batch");
    let dot: f32 = embs[0].iter().zip(embs[1].iter()).map(|(a, b)| a * b).sum();
    assert!(dot < 0.99, "distinct inputs should not collide (dot={dot})");
}

#[test]
fn cache_returns_the_same_instance_per_id() {
    force_fake_models();

    let cache = ModelCache::global();
    let one = cache.embedder("BAAI/bge-m3", true).expect("first");
    let two = cache.embedder("BAAI/bge-m3", true).expect("second");
    assert!(Arc::ptr_eq(&one, &two));

    let other = cache.embedder("other/model", true).expect("other");
    assert!(!Arc::ptr_eq(&one, &other));
}

#[test]
fn fake_reranker_prefers_overlapping_passages() {
    force_fake_models();

    let reranker = ModelCache::global()
        .reranker("BAAI/bge-reranker-v2-m3")
        .expect("reranker");
    let scores = reranker
        .score_pairs(
            "doza de aspirina",
            &[
                "Aspirina: doza zilnică recomandată.".to_string(),
                "Complet alt subiect.".to_string(),
            ],
        )
        .expect("scores");
    assert!(scores[0] > scores[1]);
}

#[test]
fn reranker_scores_are_in_input_order_and_complete() {
    force_fake_models();

    let reranker = ModelCache::global()
        .reranker("BAAI/bge-reranker-v2-m3")
        .expect("reranker");
    let passages: Vec<String> = (0..40).map(|i| format!("passage number {}", i)).collect();
    let scores = reranker.score_pairs("passage", &passages).expect("scores");
    assert_eq!(scores.len(), passages.len());
}
