//! Vision transformer encoder with attention pooling.
use super::DinoConfig;
use crate::{
    transformer::{Block, BlockConfig, LayerNorm},
    util::{check_dims, copy_pretrained, softmax_last_dim},
};
use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Init, Linear, VarBuilder, VarMap};
use log::info;
use std::{collections::HashMap, path::Path};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const HEAD_DROPOUT: f32 = 0.1;

/// Variable prefix of the transformer.
pub(super) const VIT: &str = "vit";

struct Vit {
    patch_embed: Conv2d,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
}

impl Vit {
    fn new(config: &DinoConfig, vb: VarBuilder) -> Result<Self> {
        let e = config.embed_dim;
        let patch_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let block_config = BlockConfig {
            n_embd: e,
            n_head: config.n_heads,
            d_ff: config.mlp_ratio * e,
            dropout: 0.0,
            ln_eps: 1e-6,
        };
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };

        Ok(Self {
            patch_embed: conv2d(3, e, config.patch_size, patch_config, vb.pp("patch_embed"))?,
            cls_token: vb.get_with_hints((1, 1, e), "cls_token", init)?,
            pos_embed: vb.get_with_hints((1, 1 + config.n_patches(), e), "pos_embed", init)?,
            blocks: (0..config.depth)
                .map(|i| Block::new(&block_config, vb.pp("blocks").pp(i.to_string())))
                .collect::<Result<Vec<_>>>()?,
            norm: LayerNorm::new(e, 1e-6, vb.pp("norm"))?,
        })
    }

    /// Returns normalized patch tokens `(batch, n_patches, embed_dim)`.
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let patches = self.patch_embed.forward(x)?.flatten_from(2)?.transpose(1, 2)?;
        let (b, n, e) = patches.dims3()?;
        let cls = self.cls_token.broadcast_as((b, 1, e))?;
        let mut h = Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.pos_embed)?;
        for block in self.blocks.iter() {
            h = block.forward_t(&h, None, train)?;
        }
        Ok(self.norm.forward(&h)?.narrow(1, 1, n)?)
    }
}

/// Encodes an image `(batch, 3, H, W)` into `(batch, output_size)`.
///
/// Images are resized and normalized, the transformer produces patch tokens, and a
/// small feed-forward head scores each patch. The embedding is the softmax-weighted
/// sum of patch tokens, projected to `output_size`.
pub struct DinoEncoder {
    config: DinoConfig,
    mean: Tensor,
    std: Tensor,
    vit: Vit,
    attn_fc1: Linear,
    attn_fc2: Linear,
    projection: Linear,
}

impl DinoEncoder {
    /// Builds the encoder with variables under `vb`.
    ///
    /// The transformer starts from random weights, see [`DinoEncoder::load_pretrained`].
    pub fn build(vb: VarBuilder, config: DinoConfig) -> Result<Self> {
        config.check()?;
        let device = vb.device().clone();
        let vit = Vit::new(&config, vb.pp(VIT))?;
        let e = config.embed_dim;

        Ok(Self {
            mean: Tensor::new(&IMAGENET_MEAN, &device)?.reshape((1, 3, 1, 1))?,
            std: Tensor::new(&IMAGENET_STD, &device)?.reshape((1, 3, 1, 1))?,
            vit,
            attn_fc1: linear(e, 64, vb.pp("attn_head").pp("fc1"))?,
            attn_fc2: linear(64, 1, vb.pp("attn_head").pp("fc2"))?,
            projection: linear(e, config.output_size, vb.pp("projection"))?,
            config,
        })
    }

    /// Width of the output vector.
    pub fn out_dim(&self) -> usize {
        self.config.output_size
    }

    /// Returns `true` if the transformer is excluded from training.
    pub fn is_frozen(&self) -> bool {
        self.config.freeze
    }

    /// Pretrained transformer weights, if any.
    pub fn weights_path(&self) -> Option<&Path> {
        self.config.weights_path.as_deref()
    }

    /// Copies the pretrained transformer weights into the variables under
    /// `{prefix}.vit`, so they are trained unless the encoder is frozen.
    ///
    /// Does nothing if no weights file is configured.
    pub fn load_pretrained(&self, varmap: &VarMap, prefix: &str) -> Result<()> {
        let path = match self.weights_path() {
            Some(path) => path,
            None => return Ok(()),
        };
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?
            .into_iter()
            .map(|(k, t)| (format!("{}.{}", VIT, k), t))
            .collect::<HashMap<_, _>>();
        let n = copy_pretrained(varmap, prefix, &tensors, &[VIT])?;
        info!("Load {} vision transformer tensors into {} from {:?}", n, prefix, path);
        Ok(())
    }

    fn dropout(x: Tensor, train: bool) -> Result<Tensor> {
        match train {
            true => Ok(candle_nn::ops::dropout(&x, HEAD_DROPOUT)?),
            false => Ok(x),
        }
    }

    /// Encodes images with values in `[0, 1]`.
    pub fn forward_t(&self, image: &Tensor, train: bool) -> Result<Tensor> {
        let b = image.dims().first().copied().unwrap_or_default();
        let mut expected = vec![b];
        expected.extend_from_slice(&self.config.input_shape);
        check_dims("image", image, &expected)?;

        let s = self.config.image_size;
        let x = image
            .upsample_nearest2d(s, s)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&self.std)?;
        let tokens = match self.config.freeze {
            true => self.vit.forward_t(&x, false)?.detach(),
            false => self.vit.forward_t(&x, train)?,
        };

        let scores = self.attn_fc1.forward(&tokens)?.gelu()?;
        let scores = Self::dropout(scores, train)?;
        let scores = Self::dropout(self.attn_fc2.forward(&scores)?, train)?;
        let weights = softmax_last_dim(&scores.transpose(1, 2)?)?;
        let pooled = weights.matmul(&tokens)?.squeeze(1)?;
        Ok(self.projection.forward(&pooled)?)
    }
}
