use candle_core::{DType, Tensor};
use rcpdb_core::error::{Error, Result};

/// Mean pooling over unmasked positions, optionally L2-normalized.
/// `hidden` is `[B, T, H]`, `attention_mask` is `[B, T]`.
pub fn masked_mean(hidden: &Tensor, attention_mask: &Tensor, normalize: bool) -> Result<Tensor> {
    masked_mean_inner(hidden, attention_mask, normalize)
        .map_err(|e| Error::Internal(format!("pooling failed: {}", e)))
}

fn masked_mean_inner(
    hidden: &Tensor,
    attention_mask: &Tensor,
    normalize: bool,
) -> candle_core::Result<Tensor> {
    let dims = hidden.dims();
    let hidden_dim = dims[2];

    let mask = attention_mask
        .to_device(hidden.device())?
        .to_dtype(hidden.dtype())?;
    let mask_3d = mask.unsqueeze(2)?;
    let mask_broadcast = mask_3d
        .broadcast_as(hidden.shape())
        .unwrap_or(mask_3d.repeat((1, 1, hidden_dim))?);
    let masked = (hidden * &mask_broadcast)?;
    let sum = masked.sum(1)?;
    let lengths = mask.sum(1)?.unsqueeze(1)?.to_dtype(sum.dtype())?;
    let mut mean = sum.broadcast_div(&lengths)?;

    if normalize {
        let eps_val = match hidden.dtype() {
            DType::F16 => 1e-6f32,
            _ => 1e-12f32,
        };
        let eps = Tensor::new(&[eps_val], hidden.device())?
            .to_dtype(hidden.dtype())?
            .unsqueeze(0)?;
        let norm = mean.sqr()?.sum_keepdim(1)?.sqrt()?;
        let norm = norm.broadcast_add(&eps)?;
        mean = mean.broadcast_div(&norm)?;
    }
    Ok(mean)
}
