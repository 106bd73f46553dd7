//! Cross-encoder implementations of the `Reranker` trait.

use std::collections::HashSet;
use std::sync::Arc;

use candle_core::Device;
use candle_transformers::models::xlm_roberta::XLMRobertaForSequenceClassification;
use rcpdb_core::error::{Error, Result};
use rcpdb_core::tokenize::tokenize;
use rcpdb_core::traits::Reranker;
use tokenizers::Tokenizer;
use tracing::info;

use crate::device::select_device;
use crate::encode::{encode_fixed, to_batch_tensors};
use crate::weights::load_model;

const DEFAULT_MAX_LEN: usize = 512;
const DEFAULT_BATCH_SIZE: usize = 16;

/// BGE-reranker style scorer: XLM-Roberta with a single-logit head over the
/// jointly encoded (query, passage) pair. Raw logits are returned; only
/// their ordering is meaningful to callers.
pub struct CrossEncoder {
    model: XLMRobertaForSequenceClassification,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    max_len: usize,
    batch_size: usize,
}

impl CrossEncoder {
    pub fn load(model_id: &str) -> Result<Self> {
        let device = select_device();
        let loaded = load_model(model_id, device)?;
        let model = XLMRobertaForSequenceClassification::new(1, &loaded.config, loaded.vb)
            .map_err(|e| Error::External(format!("failed to build reranker: {}", e)))?;
        info!(model = model_id, "cross-encoder loaded");
        Ok(Self {
            model,
            tokenizer: loaded.tokenizer,
            device: loaded.device,
            model_id: model_id.to_string(),
            max_len: DEFAULT_MAX_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Bound the number of pairs scored per forward pass.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn score_window(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let rows = passages
            .iter()
            .map(|p| encode_fixed(&self.tokenizer, (query, p.as_str()), self.max_len))
            .collect::<Result<Vec<_>>>()?;
        let (input_ids, attention_mask) = to_batch_tensors(&rows, self.max_len, &self.device)?;
        let token_type_ids = input_ids
            .zeros_like()
            .map_err(|e| Error::Internal(format!("token type ids: {}", e)))?;

        let logits = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids)
            .map_err(|e| Error::Internal(format!("reranker forward failed: {}", e)))?;
        logits
            .squeeze(1)
            .and_then(|t| t.to_device(&Device::Cpu))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| Error::Internal(format!("reranker output failed: {}", e)))
    }
}

impl Reranker for CrossEncoder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score_pairs(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(passages.len());
        for window in passages.chunks(self.batch_size) {
            out.extend(self.score_window(query, window)?);
        }
        Ok(out)
    }
}

/// Lexical-overlap scorer standing in for the cross-encoder in tests.
pub struct FakeReranker {
    model_id: String,
}

impl FakeReranker {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }
}

impl Reranker for FakeReranker {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score_pairs(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        Ok(passages
            .iter()
            .map(|passage| {
                if query_terms.is_empty() {
                    return 0.0;
                }
                let passage_terms: HashSet<String> = tokenize(passage).into_iter().collect();
                let matched = query_terms.intersection(&passage_terms).count();
                matched as f32 / query_terms.len() as f32
            })
            .collect())
    }

    /// Overlap scores are already in [0, 1].
    fn confidence(&self, score: f32) -> f32 {
        score.clamp(0.0, 1.0)
    }
}

pub(crate) fn build_reranker(model_id: &str) -> Result<Arc<dyn Reranker>> {
    if crate::use_fake_models() {
        info!(model = model_id, "using fake reranker");
        return Ok(Arc::new(FakeReranker::new(model_id)));
    }
    Ok(Arc::new(CrossEncoder::load(model_id)?))
}
