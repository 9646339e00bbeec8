//! FiLM-conditioned ResNet-18 encoder.
use super::{
    layers::{conv_out, sinusoidal_2d, BasicBlock, Film, SpatialProjection, Stem},
    LanguageFusion, ResNetConfig,
};
use crate::util::{check_dims, copy_pretrained};
use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, VarBuilder, VarMap};
use log::info;
use std::{collections::HashMap, path::Path};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Variable prefixes of the convolutional trunk.
pub(super) const TRUNK: [&str; 5] = ["stem", "layer1", "layer2", "layer3", "layer4"];

enum Head {
    Spatial(SpatialProjection),
    Tokens { conv: Conv2d, pos: Tensor },
    Flatten,
}

/// Encodes an image `(batch, C, H, W)` with a ResNet-18 trunk.
///
/// In vector mode, the stem is followed by the four blocks of `layer1` and `layer2`,
/// each modulated by the language vector, and the output is `(batch, out_dim)`.
/// In token mode, `layer1` and `layer2` belong to the unmodulated trunk, the blocks of
/// `layer3` and `layer4` are modulated and the output is `(batch, H' * W', output_size)`.
pub struct ResNetEncoder {
    config: ResNetConfig,
    normalizer: Option<(Tensor, Tensor)>,
    stem: Stem,
    trunk: Vec<BasicBlock>,
    blocks: Vec<BasicBlock>,
    films: Option<Vec<Film>>,
    head: Head,
    out_dim: usize,
    n_tokens: Option<usize>,
}

/// Maps a torchvision ResNet tensor name to the variable name of the encoder.
fn torchvision_key(name: &str) -> String {
    let name = match name.split_once('.') {
        Some(("conv1" | "bn1", _)) => format!("stem.{}", name),
        _ => name.to_string(),
    };
    name.replace(".downsample.0.", ".downsample.conv.")
        .replace(".downsample.1.", ".downsample.bn.")
}

fn build_layer(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<[BasicBlock; 2]> {
    Ok([
        BasicBlock::new(c_in, c_out, stride, vb.pp("0"))?,
        BasicBlock::new(c_out, c_out, 1, vb.pp("1"))?,
    ])
}

impl ResNetEncoder {
    /// Builds the encoder with variables under `vb`.
    pub fn build(vb: VarBuilder, config: ResNetConfig) -> Result<Self> {
        config.check()?;
        let (c, h, w) = config.chw()?;
        let device = vb.device().clone();
        let s = if config.no_stride { 1 } else { 2 };
        let (mut fh, mut fw) = (conv_out(conv_out(h, s), s), conv_out(conv_out(w, s), s));

        let stem = Stem::new(c, config.no_stride, vb.pp("stem"))?;
        let [l1a, l1b] = build_layer(64, 64, 1, vb.pp("layer1"))?;
        let [l2a, l2b] = build_layer(64, 128, 2, vb.pp("layer2"))?;
        (fh, fw) = (conv_out(fh, 2), conv_out(fw, 2));

        let (trunk, blocks, channels, fc) = match config.keep_tokens {
            false => (vec![], vec![l1a, l1b, l2a, l2b], [64, 64, 128, 128], 128),
            true => {
                let [l3a, l3b] = build_layer(128, 256, 2, vb.pp("layer3"))?;
                let [l4a, l4b] = build_layer(256, 512, 2, vb.pp("layer4"))?;
                (fh, fw) = (conv_out(conv_out(fh, 2), 2), conv_out(conv_out(fw, 2), 2));
                (
                    vec![l1a, l1b, l2a, l2b],
                    vec![l3a, l3b, l4a, l4b],
                    [256, 256, 512, 512],
                    512,
                )
            }
        };

        let films = match config.language_fusion {
            LanguageFusion::Film => Some(
                channels
                    .iter()
                    .enumerate()
                    .map(|(i, ch)| {
                        Film::new(config.language_dim, *ch, vb.pp(format!("lang_proj{}", i + 1)))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            LanguageFusion::None => None,
        };

        let out = config.output_size;
        let (head, out_dim, n_tokens) = match (config.keep_tokens, config.do_projection) {
            (true, _) => {
                let conv = conv2d(fc, out, 1, Default::default(), vb.pp("projection"))?;
                let pos = sinusoidal_2d(out, fh, fw, &device)?;
                (Head::Tokens { conv, pos }, out, Some(fh * fw))
            }
            (false, true) => {
                let sp = SpatialProjection::new((fc, fh, fw), out, vb.pp("projection"))?;
                (Head::Spatial(sp), out, None)
            }
            (false, false) => (Head::Flatten, fc * fh * fw, None),
        };

        let normalizer = match config.pretrained && c == 3 {
            true => Some((
                Tensor::new(&IMAGENET_MEAN, &device)?.reshape((1, 3, 1, 1))?,
                Tensor::new(&IMAGENET_STD, &device)?.reshape((1, 3, 1, 1))?,
            )),
            false => None,
        };

        Ok(Self {
            config,
            normalizer,
            stem,
            trunk,
            blocks,
            films,
            head,
            out_dim,
            n_tokens,
        })
    }

    /// Width of the output vector, or of each token in token mode.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Number of output tokens in token mode.
    pub fn n_tokens(&self) -> Option<usize> {
        self.n_tokens
    }

    /// Returns `true` if the trunk is excluded from training.
    pub fn is_frozen(&self) -> bool {
        self.config.freeze
    }

    /// Pretrained trunk weights, if any.
    pub fn weights_path(&self) -> Option<&Path> {
        self.config.weights_path.as_deref()
    }

    /// Variable prefixes of the layers built for the current mode.
    pub fn trunk_segments(&self) -> &'static [&'static str] {
        match self.config.keep_tokens {
            true => &TRUNK,
            false => &TRUNK[..3],
        }
    }

    /// Copies the pretrained trunk weights into the variables under `prefix`.
    ///
    /// Does nothing if no weights file is configured. Every variable of the trunk
    /// must be present in the file.
    pub fn load_pretrained(&self, varmap: &VarMap, prefix: &str) -> Result<()> {
        let path = match self.weights_path() {
            Some(path) => path,
            None => return Ok(()),
        };
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?
            .into_iter()
            .map(|(k, t)| (torchvision_key(&k), t))
            .collect::<HashMap<_, _>>();
        let n = copy_pretrained(varmap, prefix, &tensors, self.trunk_segments())?;
        info!("Load {} resnet tensors into {} from {:?}", n, prefix, path);
        Ok(())
    }

    /// Encodes images, modulated by `lang` of shape `(batch, language_dim)` if given.
    pub fn forward_t(&self, image: &Tensor, lang: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let b = image.dims().first().copied().unwrap_or_default();
        let mut expected = vec![b];
        expected.extend_from_slice(&self.config.input_shape);
        check_dims("image", image, &expected)?;

        let x = match &self.normalizer {
            Some((mean, std)) => image.broadcast_sub(mean)?.broadcast_div(std)?,
            None => image.clone(),
        };
        let train_trunk = train && !self.config.freeze;
        let mut h = self.stem.forward_t(&x, train_trunk)?;
        if self.config.freeze {
            h = h.detach();
        }
        for block in self.trunk.iter() {
            h = block.forward_t(&h, train_trunk)?;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            h = block.forward_t(&h, train_trunk)?;
            if let (Some(films), Some(lang)) = (&self.films, lang) {
                h = films[i].forward(&h, lang)?;
            }
        }

        match &self.head {
            Head::Spatial(sp) => sp.forward(&h),
            Head::Tokens { conv, pos } => {
                let h = conv.forward(&h)?.broadcast_add(pos)?;
                let (b, c, fh, fw) = h.dims4()?;
                Ok(h.reshape((b, c, fh * fw))?.transpose(1, 2)?.contiguous()?)
            }
            Head::Flatten => Ok(h.flatten_from(1)?),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use quest_core::error::QuestError;

    fn config() -> ResNetConfig {
        ResNetConfig::default()
            .input_shape(vec![3, 32, 32])
            .output_size(16)
            .language_dim(8)
    }

    #[test]
    fn test_vector_mode() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ResNetEncoder::build(vb, config())?;
        assert_eq!(enc.out_dim(), 16);
        assert_eq!(enc.n_tokens(), None);

        let image = Tensor::rand(0f32, 1., (2, 3, 32, 32), &Device::Cpu)?;
        let lang = Tensor::randn(0f32, 1., (2, 8), &Device::Cpu)?;
        let y = enc.forward_t(&image, Some(&lang), true)?;
        assert_eq!(y.dims(), &[2, 16]);

        // FiLM changes the output
        let y0 = enc.forward_t(&image, None, false)?;
        let y1 = enc.forward_t(&image, Some(&lang), false)?;
        let diff: f32 = (y0 - y1)?.abs()?.sum_all()?.to_scalar()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_flatten_and_token_modes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let image = Tensor::rand(0f32, 1., (2, 3, 32, 32), &Device::Cpu)?;

        // 32 -> 16 (stem) -> 8 (maxpool) -> 4 (layer2)
        let enc = ResNetEncoder::build(vb.pp("flat"), config().do_projection(false))?;
        assert_eq!(enc.out_dim(), 128 * 4 * 4);
        assert_eq!(enc.forward_t(&image, None, false)?.dims(), &[2, 2048]);

        // -> 2 (layer3) -> 1 (layer4)
        let enc = ResNetEncoder::build(
            vb.pp("tokens"),
            config().keep_tokens(true).remove_layer_num(2),
        )?;
        assert_eq!(enc.n_tokens(), Some(1));
        assert_eq!(enc.forward_t(&image, None, false)?.dims(), &[2, 1, 16]);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ResNetEncoder::build(vb, config())?;
        let image = Tensor::zeros((2, 3, 16, 32), DType::F32, &Device::Cpu)?;
        let e = enc.forward_t(&image, None, false).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<QuestError>(),
            Some(QuestError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_variable_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = ResNetEncoder::build(vb.pp("rgb"), config())?;
        let data = varmap.data().lock().unwrap();
        for name in [
            "rgb.stem.conv1.weight",
            "rgb.stem.bn1.running_mean",
            "rgb.layer2.0.downsample.conv.weight",
            "rgb.lang_proj4.weight",
            "rgb.projection.projection.weight",
        ] {
            assert!(data.contains_key(name), "{}", name);
        }
        assert!(!data.keys().any(|k| k.starts_with("rgb.layer3")));
        Ok(())
    }

    #[test]
    fn test_torchvision_key() {
        assert_eq!(torchvision_key("conv1.weight"), "stem.conv1.weight");
        assert_eq!(torchvision_key("bn1.running_var"), "stem.bn1.running_var");
        assert_eq!(torchvision_key("layer1.0.bn1.bias"), "layer1.0.bn1.bias");
        assert_eq!(
            torchvision_key("layer3.0.downsample.0.weight"),
            "layer3.0.downsample.conv.weight"
        );
        assert_eq!(
            torchvision_key("layer3.0.downsample.1.running_mean"),
            "layer3.0.downsample.bn.running_mean"
        );
        assert_eq!(torchvision_key("stem.conv1.weight"), "stem.conv1.weight");
        assert_eq!(torchvision_key("fc.weight"), "fc.weight");
    }
}
