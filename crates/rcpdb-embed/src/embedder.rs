//! Bi-encoder implementations of the `Embedder` trait.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use candle_core::Device;
use candle_transformers::models::xlm_roberta::XLMRobertaModel;
use rcpdb_core::error::{Error, Result};
use rcpdb_core::traits::Embedder;
use tokenizers::Tokenizer;
use tracing::info;
use twox_hash::XxHash64;

use crate::device::select_device;
use crate::encode::{encode_fixed, to_batch_tensors};
use crate::pool::masked_mean;
use crate::weights::load_model;

pub const FAKE_EMBEDDING_DIM: usize = 1024;
const DEFAULT_MAX_LEN: usize = 256;
const DEFAULT_BATCH_SIZE: usize = 32;

/// BGE-M3 style encoder: XLM-Roberta trunk, masked mean pooling, L2 norm.
pub struct BiEncoder {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    dim: usize,
    max_len: usize,
    batch_size: usize,
    normalize: bool,
}

impl BiEncoder {
    pub fn load(model_id: &str, normalize: bool) -> Result<Self> {
        let device = select_device();
        let loaded = load_model(model_id, device)?;
        let dim = loaded.config.hidden_size;
        let model = XLMRobertaModel::new(&loaded.config, loaded.vb)
            .map_err(|e| Error::External(format!("failed to build encoder: {}", e)))?;
        info!(model = model_id, dim, "bi-encoder loaded");
        Ok(Self {
            model,
            tokenizer: loaded.tokenizer,
            device: loaded.device,
            model_id: model_id.to_string(),
            dim,
            max_len: DEFAULT_MAX_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
            normalize,
        })
    }

    /// Bound the number of texts encoded per forward pass.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn embed_window(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let rows = texts
            .iter()
            .map(|t| encode_fixed(&self.tokenizer, t.as_str(), self.max_len))
            .collect::<Result<Vec<_>>>()?;
        let (input_ids, attention_mask) = to_batch_tensors(&rows, self.max_len, &self.device)?;
        let token_type_ids = input_ids
            .zeros_like()
            .map_err(|e| Error::Internal(format!("token type ids: {}", e)))?;

        let hidden = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)
            .map_err(|e| Error::Internal(format!("encoder forward failed: {}", e)))?;
        let pooled = masked_mean(&hidden, &attention_mask, self.normalize)?;
        pooled
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(|e| Error::Internal(format!("embedding transfer failed: {}", e)))
    }
}

impl Embedder for BiEncoder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.batch_size) {
            out.extend(self.embed_window(window)?);
        }
        Ok(out)
    }
}

/// Deterministic hashing embedder for tests and development.
pub struct FakeEmbedder {
    model_id: String,
    dim: usize,
}

impl FakeEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            dim: FAKE_EMBEDDING_DIM,
        }
    }
}

impl Embedder for FakeEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        DEFAULT_MAX_LEN
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; self.dim];
                for (i, token) in text.split_whitespace().enumerate() {
                    let mut hasher = XxHash64::with_seed(0);
                    token.hash(&mut hasher);
                    let h = hasher.finish();
                    let idx = (h as usize) % self.dim;
                    let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
                    v[idx] += val + (i as f32 % 3.0) * 0.01;
                }
                let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
                for x in &mut v {
                    *x /= norm;
                }
                v
            })
            .collect())
    }
}

/// Construct the embedder for a model id, honoring the fake-model switch.
pub(crate) fn build_embedder(model_id: &str, normalize: bool) -> Result<Arc<dyn Embedder>> {
    if crate::use_fake_models() {
        info!(model = model_id, "using fake embedder");
        return Ok(Arc::new(FakeEmbedder::new(model_id)));
    }
    Ok(Arc::new(BiEncoder::load(model_id, normalize)?))
}
