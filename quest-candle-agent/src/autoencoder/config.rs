//! Configuration of the action autoencoder.
use anyhow::Result;
use log::info;
use quest_core::error::QuestError;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Quantization strategy of the bottleneck.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum QuantizerConfig {
    /// Finite scalar quantization.
    ///
    /// Each latent dimension `i` is bounded and rounded to one of `levels[i]` values.
    /// It has no parameters and no auxiliary loss.
    Fsq {
        /// Number of quantization levels per latent dimension.
        levels: Vec<usize>,
    },

    /// Vector quantization with learned codebooks.
    ///
    /// The latent vector is split into `n_groups` chunks of width `dim`, each matched
    /// to its nearest entry in a codebook of `codebook_size` vectors.
    Vq {
        /// Number of entries of each codebook.
        codebook_size: usize,

        /// Number of codebooks.
        n_groups: usize,

        /// Width of each codebook entry.
        dim: usize,

        /// Weight of the commitment loss.
        beta: f64,
    },
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self::Fsq {
            levels: vec![8, 5, 5, 5],
        }
    }
}

impl QuantizerConfig {
    /// Number of values each index digit can take.
    ///
    /// The flattened index is the mixed-radix number with these digits.
    pub fn levels(&self) -> Vec<usize> {
        match self {
            Self::Fsq { levels } => levels.clone(),
            Self::Vq {
                codebook_size,
                n_groups,
                ..
            } => vec![*codebook_size; *n_groups],
        }
    }

    /// Number of distinct skill tokens.
    pub fn codebook_size(&self) -> usize {
        self.levels().iter().product()
    }

    /// Width of the latent vectors.
    pub fn latent_dim(&self) -> usize {
        match self {
            Self::Fsq { levels } => levels.len(),
            Self::Vq { n_groups, dim, .. } => n_groups * dim,
        }
    }

    /// Returns `true` if the quantizer has a learned codebook and an auxiliary loss.
    pub fn has_aux_loss(&self) -> bool {
        matches!(self, Self::Vq { .. })
    }

    /// Number of elements of the auxiliary loss vector.
    pub fn n_aux_terms(&self) -> usize {
        match self {
            Self::Fsq { .. } => 1,
            Self::Vq { n_groups, .. } => *n_groups,
        }
    }

    pub(super) fn check(&self) -> Result<(), QuestError> {
        let levels = self.levels();
        if levels.is_empty() || levels.iter().any(|l| *l < 2) {
            return Err(QuestError::config(format!(
                "quantization levels must be non-empty and at least 2, got {:?}",
                levels
            )));
        }
        // Indices are flattened in f32 arithmetic
        if levels.iter().map(|l| *l as f64).product::<f64>() > (1u64 << 24) as f64 {
            return Err(QuestError::config(format!(
                "codebook of levels {:?} is too large",
                levels
            )));
        }
        if let Self::Vq { dim, .. } = self {
            if *dim == 0 {
                return Err(QuestError::config("codebook entries must have dim > 0"));
            }
        }
        Ok(())
    }
}

/// Configuration of [`ActionAutoencoder`](super::ActionAutoencoder).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ActionAutoencoderConfig {
    /// Dimension of an action.
    pub action_dim: usize,

    /// Number of timesteps of an action chunk.
    pub skill_block_size: usize,

    /// Ratio between the chunk length and the number of skill tokens.
    ///
    /// It must be a power of two dividing `skill_block_size`.
    pub downsample_factor: usize,

    /// Width of the hidden layers of the encoder and decoder.
    pub hidden_dim: usize,

    /// Quantization strategy.
    pub quantizer: QuantizerConfig,
}

impl Default for ActionAutoencoderConfig {
    fn default() -> Self {
        Self {
            action_dim: 7,
            skill_block_size: 32,
            downsample_factor: 4,
            hidden_dim: 256,
            quantizer: QuantizerConfig::default(),
        }
    }
}

impl ActionAutoencoderConfig {
    /// Sets the action dimension.
    pub fn action_dim(mut self, v: usize) -> Self {
        self.action_dim = v;
        self
    }

    /// Sets the chunk length.
    pub fn skill_block_size(mut self, v: usize) -> Self {
        self.skill_block_size = v;
        self
    }

    /// Sets the downsampling factor.
    pub fn downsample_factor(mut self, v: usize) -> Self {
        self.downsample_factor = v;
        self
    }

    /// Sets the hidden width.
    pub fn hidden_dim(mut self, v: usize) -> Self {
        self.hidden_dim = v;
        self
    }

    /// Sets the quantizer.
    pub fn quantizer(mut self, v: QuantizerConfig) -> Self {
        self.quantizer = v;
        self
    }

    /// Number of skill tokens per action chunk.
    pub fn code_len(&self) -> usize {
        self.skill_block_size / self.downsample_factor
    }

    /// Number of strided convolutions of the encoder.
    pub(super) fn n_down(&self) -> usize {
        self.downsample_factor.trailing_zeros() as usize
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<(), QuestError> {
        let f = self.downsample_factor;
        if f == 0 || !f.is_power_of_two() || self.skill_block_size % f != 0 {
            return Err(QuestError::config(format!(
                "downsample_factor {} must be a power of two dividing skill_block_size {}",
                f, self.skill_block_size
            )));
        }
        if self.action_dim == 0 || self.hidden_dim == 0 {
            return Err(QuestError::config("action_dim and hidden_dim must be positive"));
        }
        self.quantizer.check()
    }

    /// Constructs [`ActionAutoencoderConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`ActionAutoencoderConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of action autoencoder into {:?}", path_);
        Ok(())
    }
}
