//! Reciprocal Rank Fusion.

use std::collections::HashMap;

use rcpdb_core::types::ChunkId;

/// Fuse two ranked id lists: each list contributes `1 / (k + rank)` with
/// 1-based ranks, ids absent from a list contribute nothing from it, and a
/// duplicate id simply accumulates both contributions. The result is sorted
/// by fused score descending with exact ties broken by ascending chunk id.
pub fn reciprocal_rank_fusion(
    dense: &[ChunkId],
    sparse: &[ChunkId],
    k: f64,
) -> Vec<(ChunkId, f64)> {
    let mut fused: HashMap<&ChunkId, f64> = HashMap::new();
    for (index, id) in dense.iter().enumerate() {
        *fused.entry(id).or_insert(0.0) += 1.0 / (k + (index + 1) as f64);
    }
    for (index, id) in sparse.iter().enumerate() {
        *fused.entry(id).or_insert(0.0) += 1.0 / (k + (index + 1) as f64);
    }

    let mut out: Vec<(ChunkId, f64)> = fused
        .into_iter()
        .map(|(id, score)| (id.clone(), score))
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}
