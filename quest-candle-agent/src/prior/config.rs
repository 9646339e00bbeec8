//! Configuration of the skill prior.
use crate::transformer::BlockConfig;
use anyhow::Result;
use log::info;
use quest_core::error::QuestError;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`SkillPrior`](super::SkillPrior).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SkillPriorConfig {
    /// Number of valid skill tokens, equal to the codebook size of the autoencoder.
    pub vocab_size: usize,

    /// Number of skill tokens generated per action chunk.
    pub block_size: usize,

    /// Width of the token and context embeddings.
    pub n_embd: usize,

    /// Number of transformer blocks.
    pub n_layer: usize,

    /// Number of attention heads.
    pub n_head: usize,

    /// Dropout probability.
    pub dropout: f32,

    /// Number of most likely tokens kept when sampling.
    pub beam_size: usize,

    /// Temperature applied on logits when sampling.
    pub temperature: f64,

    /// Feeds quantized codes instead of token indices back into the model.
    pub direct_skill_tokens: bool,

    /// Width of the codes when `direct_skill_tokens` is `true`.
    pub code_dim: usize,

    /// Maximum length of the context sequence.
    pub context_len: usize,
}

impl Default for SkillPriorConfig {
    fn default() -> Self {
        Self {
            vocab_size: 1000,
            block_size: 8,
            n_embd: 256,
            n_layer: 6,
            n_head: 8,
            dropout: 0.1,
            beam_size: 5,
            temperature: 1.0,
            direct_skill_tokens: false,
            code_dim: 4,
            context_len: 16,
        }
    }
}

impl SkillPriorConfig {
    /// Sets the vocabulary size.
    pub fn vocab_size(mut self, v: usize) -> Self {
        self.vocab_size = v;
        self
    }

    /// Sets the number of generated tokens.
    pub fn block_size(mut self, v: usize) -> Self {
        self.block_size = v;
        self
    }

    /// Sets the embedding width.
    pub fn n_embd(mut self, v: usize) -> Self {
        self.n_embd = v;
        self
    }

    /// Sets the number of transformer blocks.
    pub fn n_layer(mut self, v: usize) -> Self {
        self.n_layer = v;
        self
    }

    /// Sets the number of attention heads.
    pub fn n_head(mut self, v: usize) -> Self {
        self.n_head = v;
        self
    }

    /// Sets the dropout probability.
    pub fn dropout(mut self, v: f32) -> Self {
        self.dropout = v;
        self
    }

    /// Sets the number of tokens kept when sampling.
    pub fn beam_size(mut self, v: usize) -> Self {
        self.beam_size = v;
        self
    }

    /// Sets the sampling temperature.
    pub fn temperature(mut self, v: f64) -> Self {
        self.temperature = v;
        self
    }

    /// Feeds codes back instead of indices.
    pub fn direct_skill_tokens(mut self, v: bool) -> Self {
        self.direct_skill_tokens = v;
        self
    }

    /// Sets the width of the codes.
    pub fn code_dim(mut self, v: usize) -> Self {
        self.code_dim = v;
        self
    }

    /// Sets the maximum context length.
    pub fn context_len(mut self, v: usize) -> Self {
        self.context_len = v;
        self
    }

    /// The reserved token starting every sequence.
    pub fn start_token(&self) -> u32 {
        self.vocab_size as u32
    }

    /// Number of logits per position, the valid tokens and the start token.
    pub fn output_vocab_size(&self) -> usize {
        self.vocab_size + 1
    }

    pub(super) fn block_config(&self) -> BlockConfig {
        BlockConfig {
            n_embd: self.n_embd,
            n_head: self.n_head,
            d_ff: 4 * self.n_embd,
            dropout: self.dropout,
            ln_eps: 1e-5,
        }
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<(), QuestError> {
        if self.vocab_size == 0 || self.block_size == 0 || self.context_len == 0 {
            return Err(QuestError::config(
                "vocab_size, block_size and context_len must be positive",
            ));
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(QuestError::config(format!(
                "n_embd {} must be divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.beam_size == 0 || self.temperature <= 0.0 {
            return Err(QuestError::config(
                "beam_size and temperature must be positive",
            ));
        }
        if self.direct_skill_tokens && self.code_dim == 0 {
            return Err(QuestError::config("code_dim must be positive"));
        }
        Ok(())
    }

    /// Constructs [`SkillPriorConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`SkillPriorConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of skill prior into {:?}", path_);
        Ok(())
    }
}
