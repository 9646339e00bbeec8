//! Vision backbones encoding camera images, optionally conditioned on language.
mod config;
mod dino;
mod layers;
mod resnet;
use crate::model::SubModel2;
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{VarBuilder, VarMap};
pub use config::{DinoConfig, LanguageFusion, ResNetConfig, VisionBackboneConfig};
pub use dino::DinoEncoder;
use log::info;
pub use resnet::ResNetEncoder;

/// Vision backbone dispatched by [`VisionBackboneConfig`].
pub enum VisionBackbone {
    /// FiLM-conditioned ResNet-18.
    ResNet(ResNetEncoder),

    /// Vision transformer with attention pooling.
    Dino(DinoEncoder),
}

impl VisionBackbone {
    /// Encodes images `(batch, C, H, W)` with values in `[0, 1]`.
    ///
    /// The language vector `(batch, language_dim)` is used by FiLM layers of the
    /// convolutional backbone and ignored by the transformer.
    pub fn encode(&self, image: &Tensor, lang: Option<&Tensor>, train: bool) -> Result<Tensor> {
        match self {
            Self::ResNet(enc) => enc.forward_t(image, lang, train),
            Self::Dino(enc) => enc.forward_t(image, train),
        }
    }

    /// Width of the embedding, or of each token in token mode.
    pub fn out_dim(&self) -> usize {
        match self {
            Self::ResNet(enc) => enc.out_dim(),
            Self::Dino(enc) => enc.out_dim(),
        }
    }

    /// Number of output tokens, `None` if the output is a single vector.
    pub fn n_tokens(&self) -> Option<usize> {
        match self {
            Self::ResNet(enc) => enc.n_tokens(),
            Self::Dino(_) => None,
        }
    }

    /// Returns `true` for a transformer backbone whose weights are trained.
    ///
    /// Such a backbone is optimized with its own, lower learning rate.
    pub fn is_unfrozen_transformer(&self) -> bool {
        matches!(self, Self::Dino(enc) if !enc.is_frozen())
    }

    /// Variable prefixes, relative to the backbone, excluded from every optimizer group.
    pub fn frozen_segments(&self) -> Vec<&'static str> {
        match self {
            Self::ResNet(enc) if enc.is_frozen() => resnet::TRUNK.to_vec(),
            Self::Dino(enc) if enc.is_frozen() => vec![dino::VIT],
            _ => vec![],
        }
    }

    /// Copies configured pretrained weights into the backbone variables under `prefix`.
    pub fn load_pretrained(&self, varmap: &VarMap, prefix: &str) -> Result<()> {
        match self {
            Self::ResNet(enc) => enc.load_pretrained(varmap, prefix),
            Self::Dino(enc) => enc.load_pretrained(varmap, prefix),
        }
    }
}

impl SubModel2 for VisionBackbone {
    type Config = VisionBackboneConfig;
    type Input1 = Tensor;
    type Input2 = Option<Tensor>;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self> {
        match config {
            VisionBackboneConfig::ResNet(config) => {
                info!(
                    "Build resnet backbone: input {:?}, output {}, freeze {}, tokens {}",
                    config.input_shape, config.output_size, config.freeze, config.keep_tokens
                );
                Ok(Self::ResNet(ResNetEncoder::build(vb, config)?))
            }
            VisionBackboneConfig::Dino(config) => {
                info!(
                    "Build transformer backbone: input {:?}, output {}, freeze {}",
                    config.input_shape, config.output_size, config.freeze
                );
                Ok(Self::Dino(DinoEncoder::build(vb, config)?))
            }
        }
    }

    fn forward_t(&self, image: &Tensor, lang: &Option<Tensor>, train: bool) -> Result<Tensor> {
        self.encode(image, lang.as_ref(), train)
    }
}
