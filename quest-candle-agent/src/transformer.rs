//! Transformer blocks shared by the skill prior and the vision transformer.
//!
//! Normalization and softmax are written with primitive tensor ops, which all
//! have backward passes in candle.
use crate::util::softmax_last_dim;
use anyhow::Result;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{linear, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Configuration of a [`Block`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct BlockConfig {
    /// Width of the residual stream.
    pub n_embd: usize,

    /// Number of attention heads.
    pub n_head: usize,

    /// Width of the hidden layer of the feed-forward network.
    pub d_ff: usize,

    /// Dropout probability applied on attention weights and residual branches.
    pub dropout: f32,

    /// Epsilon of layer normalization.
    pub ln_eps: f64,
}

impl BlockConfig {
    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// Layer normalization with affine parameters.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Creates the layer, registering `weight` and `bias` under `vb`.
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let var = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

fn dropout(xs: Tensor, p: f32, train: bool) -> Result<Tensor> {
    match train && p > 0.0 {
        true => Ok(candle_nn::ops::dropout(&xs, p)?),
        false => Ok(xs),
    }
}

struct SelfAttention {
    qkv: Linear,
    proj: Linear,
    n_head: usize,
    head_dim: usize,
    dropout: f32,
}

impl SelfAttention {
    fn new(config: &BlockConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            qkv: linear(d, 3 * d, vb.pp("qkv"))?,
            proj: linear(d, d, vb.pp("proj"))?,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            dropout: config.dropout,
        })
    }

    fn forward_t(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (b, s, d) = x.dims3()?;
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((b, s, 3, self.n_head, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let att = dropout(softmax_last_dim(&att)?, self.dropout, train)?;
        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, d))?;
        dropout(self.proj.forward(&y)?, self.dropout, train)
    }
}

/// Pre-norm transformer block.
pub struct Block {
    ln1: LayerNorm,
    attn: SelfAttention,
    ln2: LayerNorm,
    fc: Linear,
    fc_out: Linear,
    dropout: f32,
}

impl Block {
    /// Creates a block with variables under `vb`.
    pub fn new(config: &BlockConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln1: LayerNorm::new(config.n_embd, config.ln_eps, vb.pp("ln1"))?,
            attn: SelfAttention::new(config, vb.pp("attn"))?,
            ln2: LayerNorm::new(config.n_embd, config.ln_eps, vb.pp("ln2"))?,
            fc: linear(config.n_embd, config.d_ff, vb.pp("fc"))?,
            fc_out: linear(config.d_ff, config.n_embd, vb.pp("fc_out"))?,
            dropout: config.dropout,
        })
    }

    /// Applies the block to `x` of shape `(batch, seq, n_embd)`.
    ///
    /// `mask` is added to the attention scores; use `-inf` for blocked pairs.
    pub fn forward_t(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let h = self.attn.forward_t(&self.ln1.forward(x)?, mask, train)?;
        let x = (x + h)?;
        let h = self.fc.forward(&self.ln2.forward(&x)?)?.gelu()?;
        let h = dropout(self.fc_out.forward(&h)?, self.dropout, train)?;
        Ok((x + h)?)
    }
}

/// Attention mask for a sequence of `n_prefix` context positions followed by
/// `n_tokens` autoregressive positions.
///
/// Context positions attend to the whole context and never to tokens. Token `i`
/// attends to the whole context and to tokens up to and including `i`.
/// The returned tensor has shape `(1, 1, n_prefix + n_tokens, n_prefix + n_tokens)`.
pub fn prefix_causal_mask(n_prefix: usize, n_tokens: usize, device: &Device) -> Result<Tensor> {
    let n = n_prefix + n_tokens;
    let mask = (0..n)
        .flat_map(|i| {
            (0..n).map(move |j| {
                let visible = j < n_prefix || (i >= n_prefix && j <= i);
                if visible {
                    0f32
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(mask, (1, 1, n, n), device)?)
}
