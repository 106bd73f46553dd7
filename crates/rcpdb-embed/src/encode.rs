//! Shared tokenization helpers for the XLM-Roberta models.

use candle_core::{Device, Tensor};
use rcpdb_core::error::{Error, Result};
use tokenizers::{EncodeInput, Tokenizer};

/// XLM-Roberta pad token id.
const PAD_ID: u32 = 1;

/// Encode one input (single text or pair), truncated and padded to a fixed
/// `max_len` so whole batches share one shape.
pub fn encode_fixed<'a>(
    tokenizer: &Tokenizer,
    input: impl Into<EncodeInput<'a>>,
    max_len: usize,
) -> Result<(Vec<u32>, Vec<u32>)> {
    let enc = tokenizer
        .encode(input, true)
        .map_err(|e| Error::Internal(format!("tokenization failed: {}", e)))?;
    let mut ids = enc.get_ids().to_vec();
    let mut mask = enc.get_attention_mask().to_vec();
    if ids.len() > max_len {
        ids.truncate(max_len);
        mask.truncate(max_len);
    }
    if ids.len() < max_len {
        let pad = max_len - ids.len();
        ids.extend(std::iter::repeat(PAD_ID).take(pad));
        mask.extend(std::iter::repeat(0).take(pad));
    }
    Ok((ids, mask))
}

/// Stack per-input id/mask rows into `(B, L)` tensors on the device.
pub fn to_batch_tensors(
    rows: &[(Vec<u32>, Vec<u32>)],
    max_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch = rows.len();
    let mut ids = Vec::with_capacity(batch * max_len);
    let mut mask = Vec::with_capacity(batch * max_len);
    for (row_ids, row_mask) in rows {
        ids.extend_from_slice(row_ids);
        mask.extend_from_slice(row_mask);
    }
    let input_ids = Tensor::from_vec(ids, (batch, max_len), device)
        .map_err(|e| Error::Internal(format!("input tensor: {}", e)))?;
    let attention_mask = Tensor::from_vec(mask, (batch, max_len), device)
        .map_err(|e| Error::Internal(format!("mask tensor: {}", e)))?;
    Ok((input_ids, attention_mask))
}
