//! Action autoencoder.
use super::{perplexity, ActionAutoencoderConfig, Quantizer};
use crate::{model::SubModel1, prior::CodeLookup, util::check_dims};
use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};
use log::info;

/// Nearest-neighbour upsampling by two along the last dimension of `(b, c, l)`.
fn upsample2(x: &Tensor) -> Result<Tensor> {
    let (b, c, l) = x.dims3()?;
    Ok(x.unsqueeze(3)?
        .broadcast_as((b, c, l, 2))?
        .reshape((b, c, 2 * l))?)
}

struct Encoder {
    proj_in: Linear,
    downs: Vec<Conv1d>,
    proj_out: Linear,
}

impl Encoder {
    fn new(config: &ActionAutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let conv_config = Conv1dConfig {
            stride: 2,
            ..Default::default()
        };
        let downs = (0..config.n_down())
            .map(|i| Ok(conv1d(h, h, 2, conv_config, vb.pp(format!("down{}", i)))?))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            proj_in: linear(config.action_dim, h, vb.pp("proj_in"))?,
            downs,
            proj_out: linear(h, config.quantizer.latent_dim(), vb.pp("proj_out"))?,
        })
    }

    /// `(b, t, action_dim)` -> `(b, t / factor, latent_dim)`
    fn forward(&self, actions: &Tensor) -> Result<Tensor> {
        let mut h = self.proj_in.forward(actions)?.relu()?.transpose(1, 2)?;
        for down in self.downs.iter() {
            h = down.forward(&h.contiguous()?)?.relu()?;
        }
        Ok(self.proj_out.forward(&h.transpose(1, 2)?)?)
    }
}

struct Decoder {
    proj_in: Linear,
    ups: Vec<Conv1d>,
    proj_out: Linear,
}

impl Decoder {
    fn new(config: &ActionAutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let conv_config = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let ups = (0..config.n_down())
            .map(|i| Ok(conv1d(h, h, 3, conv_config, vb.pp(format!("up{}", i)))?))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            proj_in: linear(config.quantizer.latent_dim(), h, vb.pp("proj_in"))?,
            ups,
            proj_out: linear(h, config.action_dim, vb.pp("proj_out"))?,
        })
    }

    /// `(b, len, latent_dim)` -> `(b, len * factor, action_dim)`
    fn forward(&self, codes: &Tensor) -> Result<Tensor> {
        let mut h = self.proj_in.forward(codes)?.relu()?.transpose(1, 2)?;
        for up in self.ups.iter() {
            h = up.forward(&upsample2(&h)?)?.relu()?;
        }
        Ok(self.proj_out.forward(&h.transpose(1, 2)?)?)
    }
}

/// Output of the full pass of [`ActionAutoencoder`].
pub struct AutoencoderOutput {
    /// Reconstructed actions, `(batch, skill_block_size, action_dim)`.
    pub recon: Tensor,

    /// Perplexity of code usage over the whole batch.
    pub pp: f32,

    /// Perplexity of code usage within a batch item, averaged over the batch.
    pub pp_sample: f32,

    /// Auxiliary loss, one element per codebook. Zeros for finite scalar quantization.
    pub aux_loss: Tensor,

    /// Quantized latent vectors, `(batch, len, latent_dim)`.
    pub codes: Tensor,
}

/// Autoencoder mapping action chunks to skill tokens and back.
///
/// Its variables are registered under `encoder`, `quantizer` and `decoder` below the
/// prefix of the [`VarBuilder`], so that the decoder can be fine-tuned alone.
pub struct ActionAutoencoder {
    config: ActionAutoencoderConfig,
    encoder: Encoder,
    quantizer: Quantizer,
    decoder: Decoder,
}

impl ActionAutoencoder {
    /// Prefix of the encoder variables.
    pub const ENCODER: &'static str = "encoder";

    /// Prefix of the codebook variables.
    pub const QUANTIZER: &'static str = "quantizer";

    /// Prefix of the decoder variables.
    pub const DECODER: &'static str = "decoder";

    /// Returns the configuration.
    pub fn config(&self) -> &ActionAutoencoderConfig {
        &self.config
    }

    /// Number of distinct skill tokens.
    pub fn codebook_size(&self) -> usize {
        self.config.quantizer.codebook_size()
    }

    /// Number of skill tokens per action chunk.
    pub fn code_len(&self) -> usize {
        self.config.code_len()
    }

    /// Width of the quantized latent vectors.
    pub fn latent_dim(&self) -> usize {
        self.config.quantizer.latent_dim()
    }

    /// Returns `true` if the quantizer has a learned codebook and an auxiliary loss.
    pub fn has_aux_loss(&self) -> bool {
        self.config.quantizer.has_aux_loss()
    }

    /// Returns the quantizer.
    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    fn check_actions(&self, actions: &Tensor) -> Result<()> {
        let b = actions.dims().first().copied().unwrap_or_default();
        check_dims(
            "actions",
            actions,
            &[b, self.config.skill_block_size, self.config.action_dim],
        )
    }

    /// Encodes action chunks into quantized codes and flattened indices.
    ///
    /// Returns `(codes, indices)` of shapes `(batch, len, latent_dim)` and `(batch, len)`.
    pub fn encode(&self, actions: &Tensor) -> Result<(Tensor, Tensor)> {
        self.check_actions(actions)?;
        let out = self.quantizer.quantize(&self.encoder.forward(actions)?)?;
        Ok((out.codes, out.indices))
    }

    /// Same as [`ActionAutoencoder::encode`] but detached from the computation graph.
    ///
    /// Used when the autoencoder is frozen.
    pub fn get_indices(&self, actions: &Tensor) -> Result<(Tensor, Tensor)> {
        let (codes, indices) = self.encode(&actions.detach())?;
        Ok((codes.detach(), indices))
    }

    /// Decodes quantized latent vectors into actions.
    pub fn decode_codes(&self, codes: &Tensor) -> Result<Tensor> {
        self.decoder.forward(codes)
    }

    /// Decodes flattened indices `(batch, len)` into actions `(batch, skill_block_size, action_dim)`.
    ///
    /// Decoding is a learned reconstruction, not an exact inverse of [`ActionAutoencoder::encode`].
    pub fn decode_actions(&self, indices: &Tensor) -> Result<Tensor> {
        let codes = self.quantizer.indices_to_codes(indices)?;
        self.decode_codes(&codes)
    }
}

impl CodeLookup for ActionAutoencoder {
    fn indices_to_codes(&self, indices: &Tensor) -> Result<Tensor> {
        self.quantizer.indices_to_codes(indices)
    }
}

impl SubModel1 for ActionAutoencoder {
    type Config = ActionAutoencoderConfig;
    type Input = Tensor;
    type Output = AutoencoderOutput;

    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self> {
        config.check()?;
        let encoder = Encoder::new(&config, vb.pp(Self::ENCODER))?;
        let quantizer = Quantizer::build(vb.pp(Self::QUANTIZER), &config.quantizer)?;
        let decoder = Decoder::new(&config, vb.pp(Self::DECODER))?;
        info!(
            "Build action autoencoder: chunk {}x{}, {} tokens per chunk, codebook size {}",
            config.skill_block_size,
            config.action_dim,
            config.code_len(),
            config.quantizer.codebook_size()
        );

        Ok(Self {
            config,
            encoder,
            quantizer,
            decoder,
        })
    }

    fn forward_t(&self, actions: &Self::Input, _train: bool) -> Result<Self::Output> {
        self.check_actions(actions)?;
        let out = self.quantizer.quantize(&self.encoder.forward(actions)?)?;
        let recon = self.decoder.forward(&out.codes)?;

        let codebook_size = self.codebook_size();
        let indices: Vec<Vec<u32>> = out.indices.to_vec2()?;
        let pp = perplexity(&indices.concat(), codebook_size);
        let pp_sample = match indices.len() {
            0 => 0.0,
            n => {
                indices
                    .iter()
                    .map(|ix| perplexity(ix, codebook_size))
                    .sum::<f32>()
                    / n as f32
            }
        };

        Ok(AutoencoderOutput {
            recon,
            pp,
            pp_sample,
            aux_loss: out.aux_loss,
            codes: out.codes,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::autoencoder::QuantizerConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use quest_core::error::QuestError;

    fn config(quantizer: QuantizerConfig) -> ActionAutoencoderConfig {
        ActionAutoencoderConfig::default()
            .action_dim(7)
            .skill_block_size(8)
            .downsample_factor(2)
            .hidden_dim(32)
            .quantizer(quantizer)
    }

    #[test]
    fn test_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ae = ActionAutoencoder::build(
            vb.pp("autoencoder"),
            config(QuantizerConfig::Fsq {
                levels: vec![8, 5, 5, 5],
            }),
        )?;
        assert_eq!(ae.codebook_size(), 1000);

        let actions = Tensor::randn(0f32, 1., (3, 8, 7), &Device::Cpu)?;
        let (codes, indices) = ae.encode(&actions)?;
        assert_eq!(codes.dims(), &[3, 4, 4]);
        assert_eq!(indices.dims(), &[3, 4]);

        let recon = ae.decode_actions(&indices)?;
        assert_eq!(recon.dims(), actions.dims());

        let out = ae.forward(&actions)?;
        assert_eq!(out.recon.dims(), actions.dims());
        assert!(out.pp >= 1.0 && out.pp <= 12.0);
        assert!(out.pp_sample >= 1.0 && out.pp_sample <= 4.0);
        assert_eq!(out.aux_loss.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_decoder_variables() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = ActionAutoencoder::build(
            vb.pp("autoencoder"),
            config(QuantizerConfig::Vq {
                codebook_size: 32,
                n_groups: 1,
                dim: 4,
                beta: 0.25,
            }),
        )?;
        let data = varmap.data().lock().unwrap();
        let mut names = data.keys().cloned().collect::<Vec<_>>();
        names.sort();

        assert!(names.contains(&"autoencoder.quantizer.codebook0".to_string()));
        assert!(names.contains(&"autoencoder.decoder.up0.weight".to_string()));
        assert!(names.contains(&"autoencoder.encoder.down0.weight".to_string()));
        assert!(names.iter().all(|k| k.starts_with("autoencoder.encoder.")
            || k.starts_with("autoencoder.quantizer.")
            || k.starts_with("autoencoder.decoder.")));
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ae = ActionAutoencoder::build(vb, config(QuantizerConfig::default()))?;
        let actions = Tensor::zeros((2, 6, 7), DType::F32, &Device::Cpu)?;
        let e = ae.encode(&actions).err().unwrap();
        assert!(matches!(
            e.downcast_ref::<QuestError>(),
            Some(QuestError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reconstruction_improves() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ae = ActionAutoencoder::build(vb, config(QuantizerConfig::default()))?;
        let mut opt = crate::opt::OptimizerConfig::default()
            .learning_rate(1e-3)
            .build(varmap.all_vars())?;
        let actions = Tensor::randn(0f32, 0.5, (4, 8, 7), &Device::Cpu)?;

        let loss0: f32 = (ae.forward(&actions)?.recon - &actions)?.abs()?.mean_all()?.to_scalar()?;
        for _ in 0..50 {
            let loss = (ae.forward(&actions)?.recon - &actions)?.abs()?.mean_all()?;
            opt.backward_step(&loss)?;
        }
        let loss1: f32 = (ae.forward(&actions)?.recon - &actions)?.abs()?.mean_all()?.to_scalar()?;
        assert!(loss1 < loss0);
        Ok(())
    }
}
