//! Locating and loading local model weights.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::Config as XLMRobertaConfig;
use rcpdb_core::error::{Error, Result};
use tokenizers::Tokenizer;
use tracing::info;

pub const MODEL_DIR_ENV: &str = "RCPDB_MODEL_DIR";
const DEFAULT_MODEL_ROOT: &str = "models";

/// Model files live under `<root>/<model name>` where the name is the last
/// path segment of the model id ("BAAI/bge-m3" -> "bge-m3"). The root comes
/// from RCPDB_MODEL_DIR and defaults to `models/`.
pub fn resolve_model_dir(model_id: &str) -> Result<PathBuf> {
    let root = std::env::var(MODEL_DIR_ENV).unwrap_or_else(|_| DEFAULT_MODEL_ROOT.to_string());
    let name = model_id.rsplit('/').next().unwrap_or(model_id);
    let dir = PathBuf::from(root).join(name);
    if dir.exists() {
        info!(model = model_id, dir = %dir.display(), "using model dir");
        Ok(dir)
    } else {
        Err(Error::External(format!(
            "model directory for '{}' not found at {}",
            model_id,
            dir.display()
        )))
    }
}

pub struct LoadedModel {
    pub config: XLMRobertaConfig,
    pub tokenizer: Tokenizer,
    pub vb: VarBuilder<'static>,
    pub device: Device,
}

/// Load tokenizer, config and weights (safetensors preferred, torch pickle
/// otherwise) for an XLM-Roberta family checkpoint.
pub fn load_model(model_id: &str, device: Device) -> Result<LoadedModel> {
    let dir = resolve_model_dir(model_id)?;

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        Error::External(format!(
            "failed to load tokenizer from {}: {}",
            tokenizer_path.display(),
            e
        ))
    })?;

    let config_path = dir.join("config.json");
    let config_text = std::fs::read_to_string(&config_path).map_err(|e| {
        Error::External(format!(
            "failed to read model config {}: {}",
            config_path.display(),
            e
        ))
    })?;
    let config: XLMRobertaConfig = serde_json::from_str(&config_text)
        .map_err(|e| Error::External(format!("invalid model config: {}", e)))?;

    let tensors = load_tensors(&dir, &device)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

    Ok(LoadedModel {
        config,
        tokenizer,
        vb,
        device,
    })
}

fn load_tensors(dir: &std::path::Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = dir.join("model.safetensors");
    if safetensors.exists() {
        return candle_core::safetensors::load(&safetensors, device)
            .map_err(|e| Error::External(format!("failed to load {}: {}", safetensors.display(), e)));
    }
    let pickle = dir.join("pytorch_model.bin");
    if pickle.exists() {
        let tensors = candle_core::pickle::read_all(&pickle)
            .map_err(|e| Error::External(format!("failed to load {}: {}", pickle.display(), e)))?;
        return Ok(tensors.into_iter().collect());
    }
    Err(Error::External(format!(
        "no model.safetensors or pytorch_model.bin under {}",
        dir.display()
    )))
}
