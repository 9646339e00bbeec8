//! QueST policy implemented with candle.
use super::{AuxLossReduction, Objective, QuestConfig, TrainingStage};
use crate::{
    autoencoder::ActionAutoencoder,
    model::SubModel1,
    obs::{ObsEncoder, QuestBatch, QuestObs},
    opt::{Optimizer, ParamGroup},
    prior::{sample_rows, SkillPrior},
    util::{param_stats, separate_no_decay, tensor_to_array3, ParamFilter, PartitionedParams},
};
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{loss::cross_entropy, VarBuilder, VarMap};
use log::{debug, info, trace};
use ndarray::{Array2, Array3, Axis};
use quest_core::{
    record::{Record, RecordValue},
    Agent, ChunkPolicy, Configurable,
};
use rand::{rngs::SmallRng, SeedableRng};
use std::{collections::VecDeque, convert::TryFrom, fs, path::Path};

/// QueST policy.
///
/// All variables live in a single [`VarMap`]. The autoencoder is registered under
/// `autoencoder`, the prior under `prior` and the observation encoder at the root.
/// The optimizers of the parameter groups of the configured stage are built once,
/// at construction.
pub struct Quest {
    config: QuestConfig,
    stage: TrainingStage,
    device: Device,
    varmap: VarMap,
    autoencoder: ActionAutoencoder,
    prior: SkillPrior,
    obs_encoder: ObsEncoder,
    param_groups: Vec<ParamGroup>,
    optimizers: Vec<Optimizer>,
    rng: SmallRng,
    action_queue: VecDeque<Array2<f32>>,
    train: bool,
}

impl Quest {
    /// Prefix of the autoencoder variables.
    pub const AUTOENCODER: &'static str = "autoencoder";

    /// Prefix of the prior variables.
    pub const PRIOR: &'static str = "prior";

    const PARAMS_FILE: &'static str = "quest.safetensors";

    /// Returns the configuration.
    pub fn config(&self) -> &QuestConfig {
        &self.config
    }

    /// Returns the training stage.
    pub fn stage(&self) -> TrainingStage {
        self.stage
    }

    /// Returns the variables of the policy.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Returns the action autoencoder.
    pub fn autoencoder(&self) -> &ActionAutoencoder {
        &self.autoencoder
    }

    /// Returns the skill prior.
    pub fn prior(&self) -> &SkillPrior {
        &self.prior
    }

    /// Returns the observation encoder.
    pub fn obs_encoder(&self) -> &ObsEncoder {
        &self.obs_encoder
    }

    /// Parameter groups optimized by [`Agent::opt_with_record`].
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    /// Returns the parameter groups of the training stage.
    ///
    /// Unfrozen transformer backbones are put into their own groups with
    /// `backbone_lr` and excluded from the others, except at stage 0, where only the
    /// autoencoder is trained. Frozen backbone trunks belong to no group. Each set
    /// of variables is split into a decay group and a no-decay group.
    pub fn get_optimizers(&self) -> Result<Vec<ParamGroup>> {
        let mut groups = vec![];
        let mut excluded = vec![];
        let mut backbone = PartitionedParams::default();

        for (name, encoder) in self.obs_encoder.image_encoders() {
            let prefix = format!("{}.{}", ObsEncoder::IMAGE_ENCODERS, name);
            if encoder.is_unfrozen_transformer() {
                if self.stage != TrainingStage::AutoencoderPretraining {
                    backbone.extend(separate_no_decay(&self.varmap, &ParamFilter::under(&prefix))?);
                }
                excluded.push(prefix);
            } else {
                excluded.extend(
                    encoder
                        .frozen_segments()
                        .into_iter()
                        .map(|s| format!("{}.{}", prefix, s)),
                );
            }
        }
        if !backbone.is_empty() {
            groups.extend(backbone.into_groups("backbone", Some(self.config.backbone_lr)));
        }

        let mut params = PartitionedParams::default();
        for filter in self.stage.trainable_segments() {
            let filter = filter.exclude_all(excluded.iter().cloned());
            params.extend(separate_no_decay(&self.varmap, &filter)?);
        }
        let name = match self.stage {
            TrainingStage::AutoencoderPretraining => Self::AUTOENCODER,
            _ => "policy",
        };
        groups.extend(params.into_groups(name, None));

        for g in groups.iter() {
            debug!("{:?}, {} parameters", g, g.n_params());
        }
        Ok(groups)
    }

    fn to_device_f32(&self, t: &Tensor) -> Result<Tensor> {
        Ok(t.to_device(&self.device)?.to_dtype(DType::F32)?)
    }

    /// Returns the context sequence `(batch, 1 + t_obs, embed_dim)`, the task
    /// embedding followed by one embedding per observation step.
    pub fn get_context(&self, obs: &QuestObs, train: bool) -> Result<Tensor> {
        let task_emb = self.obs_encoder.get_task_emb(obs)?;
        let obs_emb = self.obs_encoder.obs_encode(obs, &task_emb, train)?;
        Ok(Tensor::cat(&[&task_emb.unsqueeze(1)?, &obs_emb], 1)?)
    }

    fn compute_autoencoder_loss(&mut self, batch: &QuestBatch) -> Result<(Tensor, Record)> {
        let actions = self.to_device_f32(&batch.actions)?;
        let out = self.autoencoder.forward_t(&actions, self.train)?;
        let recon_loss = self.config.loss.compute(&out.recon, &actions)?;
        let aux_loss = match self.config.aux_loss_reduction {
            AuxLossReduction::Sum => out.aux_loss.sum_all()?,
            AuxLossReduction::Mean => out.aux_loss.mean_all()?,
        };
        let loss = match self.autoencoder.has_aux_loss() {
            true => (&recon_loss + &aux_loss)?,
            false => recon_loss.clone(),
        };

        let record = Record::from_slice(&[
            ("loss", RecordValue::Scalar(loss.to_scalar()?)),
            ("recon_loss", RecordValue::Scalar(recon_loss.to_scalar()?)),
            ("aux_loss", RecordValue::Scalar(aux_loss.to_scalar()?)),
            ("pp", RecordValue::Scalar(out.pp)),
            ("pp_sample", RecordValue::Scalar(out.pp_sample)),
        ]);
        Ok((loss, record))
    }

    fn compute_prior_loss(&mut self, batch: &QuestBatch) -> Result<(Tensor, Record)> {
        let obs = self.obs_encoder.preprocess_input(&batch.obs)?;
        let actions = self.to_device_f32(&batch.actions)?;
        let (codes, indices) = self.autoencoder.get_indices(&actions)?;
        let context = self.get_context(&obs, self.train)?;

        let input = self.prior.shift_right(&codes, &indices)?;
        let logits = self.prior.forward_t(&input, &context, self.train)?;
        let (b, l, v) = logits.dims3()?;
        let nll_loss = cross_entropy(&logits.reshape((b * l, v))?, &indices.flatten_all()?)?;

        // Tokens sampled from the prediction are decoded for the reconstruction term
        let codebook_size = self.autoencoder.codebook_size();
        let probs = logits
            .detach()
            .narrow(2, 0, codebook_size)?
            .reshape((b * l, codebook_size))?;
        let sampled = sample_rows(&probs, None, 1.0, &mut self.rng)?;
        let sampled = Tensor::from_vec(sampled, (b, l), &self.device)?;
        let pred_actions = self.autoencoder.decode_actions(&sampled)?;
        let l1_loss = self.config.loss.compute(&pred_actions, &actions)?;

        let scale = self.stage.l1_loss_scale(self.config.l1_loss_scale);
        let loss = match scale == 0.0 {
            true => nll_loss.clone(),
            false => (&nll_loss + (&l1_loss * scale)?)?,
        };

        let record = Record::from_slice(&[
            ("loss", RecordValue::Scalar(loss.to_scalar()?)),
            ("nll_loss", RecordValue::Scalar(nll_loss.to_scalar()?)),
            ("l1_loss", RecordValue::Scalar(l1_loss.to_scalar()?)),
        ]);
        Ok((loss, record))
    }
}

impl Configurable for Quest {
    type Config = QuestConfig;

    /// Constructs QueST policy.
    fn build(config: Self::Config) -> Result<Self> {
        config.check()?;
        let device = Device::try_from(config.device.unwrap_or_default())?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let autoencoder = ActionAutoencoder::build(vb.pp(Self::AUTOENCODER), config.autoencoder.clone())?;
        let prior = SkillPrior::build(vb.pp(Self::PRIOR), config.prior.clone())?;
        let obs_encoder = ObsEncoder::build(vb, config.obs_encoder.clone())?;
        obs_encoder.load_pretrained(&varmap)?;

        let mut quest = Self {
            stage: config.stage,
            device,
            varmap,
            autoencoder,
            prior,
            obs_encoder,
            param_groups: vec![],
            optimizers: vec![],
            rng: SmallRng::seed_from_u64(config.seed),
            action_queue: VecDeque::new(),
            train: false,
            config,
        };

        let groups = quest
            .get_optimizers()?
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect::<Vec<_>>();
        quest.optimizers = groups
            .iter()
            .map(|g| quest.config.opt_config.build_group(g))
            .collect::<Result<Vec<_>>>()?;
        quest.param_groups = groups;

        info!(
            "Build QueST policy at stage {}: {} variables, {} trainable parameters in {} groups",
            u8::from(quest.stage),
            quest.varmap.all_vars().len(),
            quest.param_groups.iter().map(|g| g.n_params()).sum::<usize>(),
            quest.param_groups.len()
        );
        Ok(quest)
    }
}

impl ChunkPolicy for Quest {
    type Obs = QuestObs;
    type Chunk = Array3<f32>;
    type Act = Array2<f32>;

    /// Samples a chunk of actions, returned as `(skill_block_size, batch, action_dim)`.
    fn sample_actions(&mut self, obs: &QuestObs) -> Result<Array3<f32>> {
        let obs = self.obs_encoder.preprocess_input(obs)?;
        let context = self.get_context(&obs, false)?;
        let codebook_size = self.autoencoder.codebook_size();
        let indices =
            self.prior
                .get_indices_top_k(&context, codebook_size, &self.autoencoder, &mut self.rng)?;
        let actions = self
            .autoencoder
            .decode_actions(&indices)?
            .detach()
            .permute((1, 0, 2))?
            .contiguous()?
            .to_device(&Device::Cpu)?;
        tensor_to_array3(&actions)
    }

    /// Returns the actions `(batch, action_dim)` of the next step.
    ///
    /// A new chunk is sampled when the first `action_horizon` actions of the
    /// previous chunk have been consumed.
    fn get_action(&mut self, obs: &QuestObs) -> Result<Array2<f32>> {
        if self.action_queue.is_empty() {
            let chunk = self.sample_actions(obs)?;
            for t in 0..self.config.action_horizon.min(chunk.len_of(Axis(0))) {
                self.action_queue
                    .push_back(chunk.index_axis(Axis(0), t).to_owned());
            }
        }
        self.action_queue
            .pop_front()
            .ok_or_else(|| anyhow!("no action was sampled"))
    }

    fn reset(&mut self) {
        self.action_queue.clear();
    }
}

impl Agent for Quest {
    type Batch = QuestBatch;
    type Loss = Tensor;

    fn train(&mut self) {
        self.train = true;
    }

    fn eval(&mut self) {
        self.train = false;
    }

    fn is_train(&self) -> bool {
        self.train
    }

    /// Computes the loss of the training stage.
    ///
    /// At stage 0 the record has `loss`, `recon_loss`, `aux_loss`, `pp` and
    /// `pp_sample`. At stages 1 and 2 it has `loss`, `nll_loss` and `l1_loss`.
    fn compute_loss(&mut self, batch: &QuestBatch) -> Result<(Tensor, Record)> {
        let (loss, record) = match self.stage.objective() {
            Objective::Reconstruction => self.compute_autoencoder_loss(batch)?,
            Objective::NextToken => self.compute_prior_loss(batch)?,
        };
        trace!("{:?}", record);
        Ok((loss, record))
    }

    fn opt_with_record(&mut self, batch: &QuestBatch) -> Result<Record> {
        let (loss, record) = self.compute_loss(batch)?;
        let grads = loss.backward()?;
        for opt in self.optimizers.iter_mut() {
            opt.step(&grads)?;
        }

        match self.config.record_verbose_level >= 2 {
            true => Ok(record.merge(param_stats(&self.varmap)?)),
            false => Ok(record),
        }
    }

    /// Save model parameters in the given directory.
    ///
    /// The parameters are saved as `quest.safetensors`.
    fn save_params(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        let path = path.join(Self::PARAMS_FILE);
        self.varmap.save(&path)?;
        info!("Save QueST parameters to {:?}", path);
        Ok(())
    }

    /// Load model parameters from `quest.safetensors` in the given directory.
    fn load_params(&mut self, path: &Path) -> Result<()> {
        let path = path.join(Self::PARAMS_FILE);
        self.varmap.load(&path)?;
        info!("Load QueST parameters from {:?}", path);
        Ok(())
    }
}
