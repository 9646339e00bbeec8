//! Configuration of vision backbones.
use quest_core::error::QuestError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of children of a ResNet-18 counted by `remove_layer_num`:
/// conv1, bn1, relu, maxpool, layer1 to layer4, avgpool and fc.
const RESNET18_CHILDREN: usize = 10;

/// Fusion of the language vector into convolutional features.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum LanguageFusion {
    /// Feature-wise linear modulation after every residual block.
    Film,

    /// The language vector is ignored.
    None,
}

/// Configuration of [`ResNetEncoder`](super::ResNetEncoder).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ResNetConfig {
    /// Shape of an image, `[channels, height, width]`.
    pub input_shape: Vec<usize>,

    /// Width of the output embedding, or of every token in token mode.
    pub output_size: usize,

    /// Normalizes 3-channel images with ImageNet statistics.
    pub pretrained: bool,

    /// Excludes the convolutional trunk from training.
    pub freeze: bool,

    /// Number of trailing ResNet-18 children removed.
    pub remove_layer_num: usize,

    /// Uses stride 1 in the stem convolution and max pooling.
    pub no_stride: bool,

    /// Width of the language vector.
    pub language_dim: usize,

    /// Fusion of the language vector.
    pub language_fusion: LanguageFusion,

    /// Projects the feature map to a vector with spatial softmax.
    pub do_projection: bool,

    /// Outputs a sequence of position-tagged tokens instead of a vector.
    pub keep_tokens: bool,

    /// Safetensors file with pretrained trunk weights.
    ///
    /// Tensors are named as in torchvision (`conv1.weight`, `layer1.0.bn1.running_mean`,
    /// `layer2.0.downsample.0.weight`) or as the variables of the encoder
    /// (`stem.conv1.weight`, `layer2.0.downsample.conv.weight`). Tensors of removed
    /// layers are ignored.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            input_shape: vec![3, 128, 128],
            output_size: 256,
            pretrained: false,
            freeze: false,
            remove_layer_num: 4,
            no_stride: false,
            language_dim: 768,
            language_fusion: LanguageFusion::Film,
            do_projection: true,
            keep_tokens: false,
            weights_path: None,
        }
    }
}

impl ResNetConfig {
    /// Sets the image shape.
    pub fn input_shape(mut self, v: Vec<usize>) -> Self {
        self.input_shape = v;
        self
    }

    /// Sets the output width.
    pub fn output_size(mut self, v: usize) -> Self {
        self.output_size = v;
        self
    }

    /// Enables ImageNet normalization.
    pub fn pretrained(mut self, v: bool) -> Self {
        self.pretrained = v;
        self
    }

    /// Freezes the trunk.
    pub fn freeze(mut self, v: bool) -> Self {
        self.freeze = v;
        self
    }

    /// Sets the number of removed layers.
    pub fn remove_layer_num(mut self, v: usize) -> Self {
        self.remove_layer_num = v;
        self
    }

    /// Disables striding in the stem.
    pub fn no_stride(mut self, v: bool) -> Self {
        self.no_stride = v;
        self
    }

    /// Sets the width of the language vector.
    pub fn language_dim(mut self, v: usize) -> Self {
        self.language_dim = v;
        self
    }

    /// Sets the language fusion.
    pub fn language_fusion(mut self, v: LanguageFusion) -> Self {
        self.language_fusion = v;
        self
    }

    /// Enables spatial softmax projection.
    pub fn do_projection(mut self, v: bool) -> Self {
        self.do_projection = v;
        self
    }

    /// Enables token mode.
    pub fn keep_tokens(mut self, v: bool) -> Self {
        self.keep_tokens = v;
        self
    }

    /// Sets the pretrained trunk weights.
    pub fn weights_path(mut self, v: Option<PathBuf>) -> Self {
        self.weights_path = v;
        self
    }

    /// Returns `(channels, height, width)` of an image.
    pub fn chw(&self) -> Result<(usize, usize, usize), QuestError> {
        match self.input_shape.as_slice() {
            [c, h, w] => Ok((*c, *h, *w)),
            _ => Err(QuestError::config(format!(
                "input shape of resnet should be [C, H, W], got {:?}",
                self.input_shape
            ))),
        }
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<(), QuestError> {
        let (c, _, _) = self.chw()?;
        // Token mode uses up to layer4, vector mode up to layer2
        let n_required = if self.keep_tokens { 8 } else { 6 };
        if self.remove_layer_num > RESNET18_CHILDREN - n_required {
            return Err(QuestError::config(format!(
                "cannot remove {} layers of resnet18 when keep_tokens is {}",
                self.remove_layer_num, self.keep_tokens
            )));
        }
        if self.freeze && c != 3 {
            return Err(QuestError::config(
                "cannot freeze pretrained resnet with the extra eye_in_hand input",
            ));
        }
        if self.weights_path.is_some() && c != 3 {
            return Err(QuestError::config(format!(
                "pretrained resnet takes 3 channels, got {}",
                c
            )));
        }
        if self.output_size == 0 {
            return Err(QuestError::config("output_size must be positive"));
        }
        Ok(())
    }
}

/// Configuration of [`DinoEncoder`](super::DinoEncoder).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct DinoConfig {
    /// Shape of an image, `[channels, height, width]`.
    pub input_shape: Vec<usize>,

    /// Width of the output embedding.
    pub output_size: usize,

    /// Side length images are resized to.
    pub image_size: usize,

    /// Side length of a patch.
    pub patch_size: usize,

    /// Width of the transformer.
    pub embed_dim: usize,

    /// Number of transformer blocks.
    pub depth: usize,

    /// Number of attention heads.
    pub n_heads: usize,

    /// Ratio of the feed-forward width to `embed_dim`.
    pub mlp_ratio: usize,

    /// Excludes the transformer from training.
    pub freeze: bool,

    /// Safetensors file with pretrained transformer weights, named as the variables
    /// under `vit`, e.g. `blocks.0.attn.qkv.weight`.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
}

impl Default for DinoConfig {
    fn default() -> Self {
        Self {
            input_shape: vec![3, 128, 128],
            output_size: 256,
            image_size: 224,
            patch_size: 14,
            embed_dim: 384,
            depth: 12,
            n_heads: 6,
            mlp_ratio: 4,
            freeze: true,
            weights_path: None,
        }
    }
}

impl DinoConfig {
    /// Sets the image shape.
    pub fn input_shape(mut self, v: Vec<usize>) -> Self {
        self.input_shape = v;
        self
    }

    /// Sets the output width.
    pub fn output_size(mut self, v: usize) -> Self {
        self.output_size = v;
        self
    }

    /// Sets the resize target and the patch size.
    pub fn image_size(mut self, image_size: usize, patch_size: usize) -> Self {
        self.image_size = image_size;
        self.patch_size = patch_size;
        self
    }

    /// Sets the transformer width, depth and number of heads.
    pub fn transformer(mut self, embed_dim: usize, depth: usize, n_heads: usize) -> Self {
        self.embed_dim = embed_dim;
        self.depth = depth;
        self.n_heads = n_heads;
        self
    }

    /// Freezes the transformer.
    pub fn freeze(mut self, v: bool) -> Self {
        self.freeze = v;
        self
    }

    /// Sets the pretrained weights.
    pub fn weights_path(mut self, v: Option<PathBuf>) -> Self {
        self.weights_path = v;
        self
    }

    /// Number of patches of a resized image.
    pub fn n_patches(&self) -> usize {
        let n = self.image_size / self.patch_size;
        n * n
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<(), QuestError> {
        if self.input_shape.len() != 3 || self.input_shape[0] != 3 {
            return Err(QuestError::config(format!(
                "vision transformer takes [3, H, W] images, got {:?}",
                self.input_shape
            )));
        }
        if self.patch_size == 0 || self.image_size < self.patch_size {
            return Err(QuestError::config(format!(
                "image_size {} must be at least patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.n_heads == 0 || self.embed_dim % self.n_heads != 0 {
            return Err(QuestError::config(format!(
                "embed_dim {} must be divisible by n_heads {}",
                self.embed_dim, self.n_heads
            )));
        }
        Ok(())
    }
}

/// Configuration of [`VisionBackbone`](super::VisionBackbone).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum VisionBackboneConfig {
    /// FiLM-conditioned ResNet-18.
    ResNet(ResNetConfig),

    /// Vision transformer with attention pooling.
    Dino(DinoConfig),
}

impl Default for VisionBackboneConfig {
    fn default() -> Self {
        Self::ResNet(ResNetConfig::default())
    }
}
