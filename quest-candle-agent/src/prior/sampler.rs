//! Sampling of tokens from logits.
use anyhow::Result;
use candle_core::Tensor;
use rand::{distributions::WeightedIndex, Rng};

/// Samples one index among the `k` largest logits after dividing them by `temperature`.
///
/// `k` is clamped to `1..=logits.len()`. With `k == 1` it returns the argmax, ties
/// resolved to the smaller index.
pub fn sample_top_k<R: Rng + ?Sized>(
    logits: &[f32],
    k: usize,
    temperature: f64,
    rng: &mut R,
) -> Result<u32> {
    let k = k.clamp(1, logits.len().max(1));
    let mut order = (0..logits.len()).collect::<Vec<_>>();
    order.sort_by(|&i, &j| logits[j].total_cmp(&logits[i]).then(i.cmp(&j)));
    order.truncate(k);

    if order.len() == 1 {
        return Ok(order[0] as u32);
    }
    let scaled = order
        .iter()
        .map(|&i| logits[i] as f64 / temperature)
        .collect::<Vec<_>>();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights = scaled.iter().map(|l| (l - max).exp()).collect::<Vec<_>>();
    let ix = rng.sample(WeightedIndex::new(&weights)?);
    Ok(order[ix] as u32)
}

/// Samples one index per row of `(n, v)` logits.
///
/// `k == None` samples from the full softmax.
pub fn sample_rows<R: Rng + ?Sized>(
    logits: &Tensor,
    k: Option<usize>,
    temperature: f64,
    rng: &mut R,
) -> Result<Vec<u32>> {
    let rows: Vec<Vec<f32>> = logits
        .detach()
        .to_device(&candle_core::Device::Cpu)?
        .to_dtype(candle_core::DType::F32)?
        .to_vec2()?;
    rows.iter()
        .map(|row| sample_top_k(row, k.unwrap_or(row.len()), temperature, rng))
        .collect()
}
