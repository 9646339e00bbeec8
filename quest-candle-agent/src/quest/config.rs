//! Configuration of the QueST policy.
use super::TrainingStage;
use crate::{
    autoencoder::ActionAutoencoderConfig, obs::ObsEncoderConfig, opt::OptimizerConfig,
    prior::SkillPriorConfig, util::ActionLoss, Device,
};
use anyhow::Result;
use log::info;
use quest_core::error::QuestError;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Reduction of the per-codebook auxiliary losses into the stage-0 loss.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum AuxLossReduction {
    /// Sum over codebooks.
    Sum,

    /// Mean over codebooks.
    Mean,
}

/// Configuration of [`Quest`](super::Quest).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct QuestConfig {
    /// Training stage.
    pub stage: TrainingStage,

    /// Weight of the action reconstruction term of the prior loss at stage 2.
    pub l1_loss_scale: f64,

    /// Loss between predicted and ground-truth actions.
    pub loss: ActionLoss,

    /// Reduction of the auxiliary losses of the quantizer.
    pub aux_loss_reduction: AuxLossReduction,

    /// Action autoencoder.
    pub autoencoder: ActionAutoencoderConfig,

    /// Skill prior.
    pub prior: SkillPriorConfig,

    /// Observation encoder.
    pub obs_encoder: ObsEncoderConfig,

    /// Optimizer.
    pub opt_config: OptimizerConfig,

    /// Learning rate of trainable transformer backbones.
    pub backbone_lr: f64,

    /// Number of actions of a sampled chunk executed before sampling again.
    pub action_horizon: usize,

    /// Seed of the random number generator used for sampling tokens.
    pub seed: u64,

    /// Device.
    pub device: Option<Device>,

    /// With 2 or more, [`Agent::opt_with_record`](quest_core::Agent::opt_with_record)
    /// adds statistics of the parameters to the record.
    pub record_verbose_level: usize,
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            stage: TrainingStage::AutoencoderPretraining,
            l1_loss_scale: 1.0,
            loss: ActionLoss::L1,
            aux_loss_reduction: AuxLossReduction::Sum,
            autoencoder: ActionAutoencoderConfig::default(),
            prior: SkillPriorConfig::default(),
            obs_encoder: ObsEncoderConfig::default(),
            opt_config: OptimizerConfig::default(),
            backbone_lr: 5e-6,
            action_horizon: 8,
            seed: 42,
            device: None,
            record_verbose_level: 0,
        }
    }
}

impl QuestConfig {
    /// Sets the training stage.
    pub fn stage(mut self, v: TrainingStage) -> Self {
        self.stage = v;
        self
    }

    /// Sets the weight of the action reconstruction term.
    pub fn l1_loss_scale(mut self, v: f64) -> Self {
        self.l1_loss_scale = v;
        self
    }

    /// Sets the action loss.
    pub fn loss(mut self, v: ActionLoss) -> Self {
        self.loss = v;
        self
    }

    /// Sets the reduction of auxiliary losses.
    pub fn aux_loss_reduction(mut self, v: AuxLossReduction) -> Self {
        self.aux_loss_reduction = v;
        self
    }

    /// Sets the configuration of the autoencoder.
    pub fn autoencoder(mut self, v: ActionAutoencoderConfig) -> Self {
        self.autoencoder = v;
        self
    }

    /// Sets the configuration of the prior.
    pub fn prior(mut self, v: SkillPriorConfig) -> Self {
        self.prior = v;
        self
    }

    /// Sets the configuration of the observation encoder.
    pub fn obs_encoder(mut self, v: ObsEncoderConfig) -> Self {
        self.obs_encoder = v;
        self
    }

    /// Sets the optimizer.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Sets the learning rate of trainable transformer backbones.
    pub fn backbone_lr(mut self, v: f64) -> Self {
        self.backbone_lr = v;
        self
    }

    /// Sets the number of executed actions per chunk.
    pub fn action_horizon(mut self, v: usize) -> Self {
        self.action_horizon = v;
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Sets the device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the verbosity of records.
    pub fn record_verbose_level(mut self, v: usize) -> Self {
        self.record_verbose_level = v;
        self
    }

    /// Checks that the autoencoder and the prior agree on the skill tokens.
    pub fn check(&self) -> Result<(), QuestError> {
        let ae = &self.autoencoder;
        let codebook_size = ae.quantizer.codebook_size();
        if self.prior.vocab_size != codebook_size {
            return Err(QuestError::config(format!(
                "vocab_size {} of the prior differs from the codebook size {}",
                self.prior.vocab_size, codebook_size
            )));
        }
        if self.prior.block_size != ae.code_len() {
            return Err(QuestError::config(format!(
                "block_size {} of the prior differs from the number of tokens per chunk {}",
                self.prior.block_size,
                ae.code_len()
            )));
        }
        if self.prior.direct_skill_tokens && self.prior.code_dim != ae.quantizer.latent_dim() {
            return Err(QuestError::config(format!(
                "code_dim {} of the prior differs from the latent width {}",
                self.prior.code_dim,
                ae.quantizer.latent_dim()
            )));
        }
        if self.prior.n_embd != self.obs_encoder.embed_dim {
            return Err(QuestError::config(format!(
                "n_embd {} of the prior differs from embed_dim {} of the observation encoder",
                self.prior.n_embd, self.obs_encoder.embed_dim
            )));
        }
        if self.action_horizon == 0 || self.action_horizon > ae.skill_block_size {
            return Err(QuestError::config(format!(
                "action_horizon {} must be in 1..={}",
                self.action_horizon, ae.skill_block_size
            )));
        }
        Ok(())
    }

    /// Constructs [`QuestConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of QueST policy from {:?}", path_);
        Ok(b)
    }

    /// Saves [`QuestConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of QueST policy into {:?}", path_);
        Ok(())
    }
}
