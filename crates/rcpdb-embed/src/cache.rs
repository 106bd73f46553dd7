//! Process-wide model cache.
//!
//! Model instances weigh gigabytes, so they are loaded once per id and
//! shared for the lifetime of the process; there is no eviction, teardown
//! happens at exit. Access goes through the typed `ModelCache` handle rather
//! than free-floating statics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rcpdb_core::error::Result;
use rcpdb_core::traits::{Embedder, Reranker};

use crate::embedder::build_embedder;
use crate::rerank::build_reranker;

static GLOBAL: OnceLock<ModelCache> = OnceLock::new();

#[derive(Default)]
pub struct ModelCache {
    embedders: Mutex<HashMap<String, Arc<dyn Embedder>>>,
    rerankers: Mutex<HashMap<String, Arc<dyn Reranker>>>,
}

impl ModelCache {
    pub fn global() -> &'static ModelCache {
        GLOBAL.get_or_init(ModelCache::default)
    }

    /// The bi-encoder for `model_id`, loading it on first use.
    pub fn embedder(&self, model_id: &str, normalize: bool) -> Result<Arc<dyn Embedder>> {
        let mut cache = self.embedders.lock().expect("embedder cache lock");
        if let Some(existing) = cache.get(model_id) {
            return Ok(existing.clone());
        }
        let built = build_embedder(model_id, normalize)?;
        cache.insert(model_id.to_string(), built.clone());
        Ok(built)
    }

    /// The cross-encoder for `model_id`, loading it on first use.
    pub fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>> {
        let mut cache = self.rerankers.lock().expect("reranker cache lock");
        if let Some(existing) = cache.get(model_id) {
            return Ok(existing.clone());
        }
        let built = build_reranker(model_id)?;
        cache.insert(model_id.to_string(), built.clone());
        Ok(built)
    }
}
