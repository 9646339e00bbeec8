//! Observations, training batches and their encoding into context embeddings.
use crate::{
    mlp::{Mlp, MlpConfig},
    model::{SubModel1, SubModel2},
    util::check_dims,
    vision::{LanguageFusion, VisionBackbone, VisionBackboneConfig},
};
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder, VarMap};
use log::info;
use quest_core::error::QuestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observations of a batch.
#[derive(Clone, Debug, Default)]
pub struct QuestObs {
    /// Camera images keyed by camera name, `(batch, t_obs, C, H, W)` of `u8` or `f32`.
    pub images: BTreeMap<String, Tensor>,

    /// Low-dimensional observations keyed by name, `(batch, t_obs, dim)`.
    pub lowdim: BTreeMap<String, Tensor>,

    /// Task identifiers, `(batch,)` of `u32`.
    pub task_id: Option<Tensor>,

    /// Language embeddings, `(batch, lang_dim)`.
    pub lang_emb: Option<Tensor>,
}

impl QuestObs {
    /// Returns the batch size.
    pub fn batch_size(&self) -> Result<usize> {
        let t = self
            .images
            .values()
            .chain(self.lowdim.values())
            .chain(self.task_id.iter())
            .chain(self.lang_emb.iter())
            .next()
            .ok_or_else(|| QuestError::MissingInput("empty observation".into()))?;
        match t.dims().first() {
            Some(b) => Ok(*b),
            None => Err(QuestError::shape("observation", &[0], t.dims()).into()),
        }
    }
}

/// A training batch.
#[derive(Clone, Debug)]
pub struct QuestBatch {
    /// Observations.
    pub obs: QuestObs,

    /// Action chunks, `(batch, skill_block_size, action_dim)`.
    pub actions: Tensor,
}

/// A camera and the backbone encoding its images.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct CameraConfig {
    /// Name of the camera, the key of its images in [`QuestObs::images`].
    pub name: String,

    /// Backbone.
    pub backbone: VisionBackboneConfig,
}

/// A low-dimensional observation and the MLP encoding it.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct LowdimConfig {
    /// Name of the observation, the key in [`QuestObs::lowdim`].
    pub name: String,

    /// MLP.
    pub mlp: MlpConfig,
}

/// Configuration of [`ObsEncoder`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ObsEncoderConfig {
    /// Cameras in the order their embeddings are concatenated.
    pub cameras: Vec<CameraConfig>,

    /// Low-dimensional observations, concatenated after the cameras.
    pub lowdim: Vec<LowdimConfig>,

    /// Width of the context embeddings.
    pub embed_dim: usize,

    /// Number of tasks for the task-id embedding.
    pub n_tasks: usize,

    /// Width of language embeddings. If given, the task embedding is a projection of
    /// the language embedding instead of a lookup by task id.
    pub lang_dim: Option<usize>,

    /// Conditions the vision backbones on the task embedding.
    pub use_lang_film: bool,
}

impl Default for ObsEncoderConfig {
    fn default() -> Self {
        Self {
            cameras: vec![],
            lowdim: vec![],
            embed_dim: 256,
            n_tasks: 1,
            lang_dim: None,
            use_lang_film: true,
        }
    }
}

impl ObsEncoderConfig {
    /// Adds a camera.
    pub fn camera(mut self, name: impl Into<String>, backbone: VisionBackboneConfig) -> Self {
        self.cameras.push(CameraConfig {
            name: name.into(),
            backbone,
        });
        self
    }

    /// Adds a low-dimensional observation.
    pub fn lowdim(mut self, name: impl Into<String>, mlp: MlpConfig) -> Self {
        self.lowdim.push(LowdimConfig {
            name: name.into(),
            mlp,
        });
        self
    }

    /// Sets the embedding width.
    pub fn embed_dim(mut self, v: usize) -> Self {
        self.embed_dim = v;
        self
    }

    /// Sets the number of tasks.
    pub fn n_tasks(mut self, v: usize) -> Self {
        self.n_tasks = v;
        self
    }

    /// Sets the width of language embeddings.
    pub fn lang_dim(mut self, v: Option<usize>) -> Self {
        self.lang_dim = v;
        self
    }

    /// Enables FiLM conditioning of the vision backbones.
    pub fn use_lang_film(mut self, v: bool) -> Self {
        self.use_lang_film = v;
        self
    }

    fn check(&self) -> Result<(), QuestError> {
        if self.cameras.is_empty() && self.lowdim.is_empty() {
            return Err(QuestError::config("no observation modality is configured"));
        }
        let names = self
            .cameras
            .iter()
            .map(|c| &c.name)
            .chain(self.lowdim.iter().map(|l| &l.name));
        for name in names {
            if name.is_empty() || name.contains('.') {
                return Err(QuestError::config(format!(
                    "observation name {:?} must be non-empty without dots",
                    name
                )));
            }
        }
        if self.use_lang_film {
            for camera in self.cameras.iter() {
                if let VisionBackboneConfig::ResNet(c) = &camera.backbone {
                    if c.language_fusion == LanguageFusion::Film && c.language_dim != self.embed_dim {
                        return Err(QuestError::config(format!(
                            "language_dim {} of camera {} differs from embed_dim {}",
                            c.language_dim, camera.name, self.embed_dim
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Encodes observations and tasks into context embeddings.
///
/// Variables are registered under `image_encoders.<camera>`, `lowdim_encoders.<name>`,
/// `task_encoder` and `obs_proj`.
pub struct ObsEncoder {
    config: ObsEncoderConfig,
    device: Device,
    cameras: Vec<(String, VisionBackbone)>,
    lowdim: Vec<(String, Mlp)>,
    task_encoder: TaskEncoder,
    obs_proj: Linear,
}

enum TaskEncoder {
    TaskId(Embedding),
    Lang(Linear),
}

impl ObsEncoder {
    /// Prefix of the camera backbones.
    pub const IMAGE_ENCODERS: &'static str = "image_encoders";

    /// Builds the encoder with variables under `vb`.
    pub fn build(vb: VarBuilder, config: ObsEncoderConfig) -> Result<Self> {
        config.check()?;
        let device = vb.device().clone();
        let mut width = 0;

        let mut cameras = vec![];
        for camera in config.cameras.iter() {
            let vb_ = vb.pp(Self::IMAGE_ENCODERS).pp(&camera.name);
            let backbone = VisionBackbone::build(vb_, camera.backbone.clone())?;
            if backbone.n_tokens().is_some() {
                return Err(QuestError::config(format!(
                    "backbone of camera {} outputs tokens, a vector is required",
                    camera.name
                ))
                .into());
            }
            width += backbone.out_dim();
            cameras.push((camera.name.clone(), backbone));
        }

        let mut lowdim = vec![];
        for l in config.lowdim.iter() {
            let mlp = Mlp::build(vb.pp("lowdim_encoders").pp(&l.name), l.mlp.clone())?;
            width += l.mlp.out_dim;
            lowdim.push((l.name.clone(), mlp));
        }

        let task_encoder = match config.lang_dim {
            Some(lang_dim) => {
                TaskEncoder::Lang(linear(lang_dim, config.embed_dim, vb.pp("task_encoder"))?)
            }
            None => TaskEncoder::TaskId(embedding(
                config.n_tasks,
                config.embed_dim,
                vb.pp("task_encoder"),
            )?),
        };
        let obs_proj = linear(width, config.embed_dim, vb.pp("obs_proj"))?;
        info!(
            "Build observation encoder: cameras {:?}, lowdim {:?}, embedding {}",
            cameras.iter().map(|c| &c.0).collect::<Vec<_>>(),
            lowdim.iter().map(|l| &l.0).collect::<Vec<_>>(),
            config.embed_dim
        );

        Ok(Self {
            config,
            device,
            cameras,
            lowdim,
            task_encoder,
            obs_proj,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ObsEncoderConfig {
        &self.config
    }

    /// Camera names and their backbones, in the configured order.
    pub fn image_encoders(&self) -> impl Iterator<Item = (&str, &VisionBackbone)> {
        self.cameras.iter().map(|(name, b)| (name.as_str(), b))
    }

    /// Copies pretrained backbone weights into `varmap`, which must be the variable
    /// map the encoder was built with.
    pub fn load_pretrained(&self, varmap: &VarMap) -> Result<()> {
        for (name, backbone) in self.image_encoders() {
            backbone.load_pretrained(varmap, &format!("{}.{}", Self::IMAGE_ENCODERS, name))?;
        }
        Ok(())
    }

    /// Moves observations to the device of the model and casts them to `f32`.
    ///
    /// `u8` images are scaled to `[0, 1]`.
    pub fn preprocess_input(&self, obs: &QuestObs) -> Result<QuestObs> {
        let image = |t: &Tensor| -> Result<Tensor> {
            let t = t.to_device(&self.device)?;
            match t.dtype() {
                DType::U8 => Ok((t.to_dtype(DType::F32)? / 255.0)?),
                _ => Ok(t.to_dtype(DType::F32)?),
            }
        };
        let float = |t: &Tensor| -> Result<Tensor> {
            Ok(t.to_device(&self.device)?.to_dtype(DType::F32)?)
        };

        Ok(QuestObs {
            images: obs
                .images
                .iter()
                .map(|(k, v)| Ok((k.clone(), image(v)?)))
                .collect::<Result<_>>()?,
            lowdim: obs
                .lowdim
                .iter()
                .map(|(k, v)| Ok((k.clone(), float(v)?)))
                .collect::<Result<_>>()?,
            task_id: match &obs.task_id {
                Some(t) => Some(t.to_device(&self.device)?.to_dtype(DType::U32)?),
                None => None,
            },
            lang_emb: obs.lang_emb.as_ref().map(float).transpose()?,
        })
    }

    /// Returns the task embedding `(batch, embed_dim)`.
    pub fn get_task_emb(&self, obs: &QuestObs) -> Result<Tensor> {
        match (&self.task_encoder, &obs.task_id, &obs.lang_emb) {
            (TaskEncoder::Lang(proj), _, Some(lang)) => {
                let b = lang.dims().first().copied().unwrap_or_default();
                let lang_dim = self.config.lang_dim.unwrap_or_default();
                check_dims("lang_emb", lang, &[b, lang_dim])?;
                Ok(proj.forward(lang)?)
            }
            (TaskEncoder::TaskId(emb), Some(task_id), _) => {
                let b = task_id.dims().first().copied().unwrap_or_default();
                check_dims("task_id", task_id, &[b])?;
                Ok(emb.forward(task_id)?)
            }
            (TaskEncoder::Lang(_), _, None) => {
                Err(QuestError::MissingInput("lang_emb".into()).into())
            }
            (TaskEncoder::TaskId(_), None, _) => {
                Err(QuestError::MissingInput("task_id".into()).into())
            }
        }
    }

    /// Encodes observations into `(batch, t_obs, embed_dim)`.
    ///
    /// `task_emb` conditions the vision backbones when FiLM is enabled.
    pub fn obs_encode(&self, obs: &QuestObs, task_emb: &Tensor, train: bool) -> Result<Tensor> {
        let mut feats = vec![];

        for (name, backbone) in self.cameras.iter() {
            let image = obs
                .images
                .get(name)
                .ok_or_else(|| QuestError::MissingInput(format!("image of camera {}", name)))?;
            let (b, t, c, h, w) = image.dims5()?;
            let lang = match self.config.use_lang_film {
                true => {
                    let e = self.config.embed_dim;
                    check_dims("task_emb", task_emb, &[b, e])?;
                    Some(task_emb.unsqueeze(1)?.broadcast_as((b, t, e))?.reshape((b * t, e))?)
                }
                false => None,
            };
            let y = backbone.forward_t(&image.reshape((b * t, c, h, w))?, &lang, train)?;
            feats.push(y.reshape((b, t, backbone.out_dim()))?);
        }

        for (name, mlp) in self.lowdim.iter() {
            let x = obs
                .lowdim
                .get(name)
                .ok_or_else(|| QuestError::MissingInput(format!("lowdim {}", name)))?;
            feats.push(mlp.forward_t(x, train)?);
        }

        Ok(self.obs_proj.forward(&Tensor::cat(&feats, D::Minus1)?)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vision::ResNetConfig;

    fn config() -> ObsEncoderConfig {
        ObsEncoderConfig::default()
            .embed_dim(16)
            .n_tasks(3)
            .camera(
                "agentview",
                VisionBackboneConfig::ResNet(
                    ResNetConfig::default()
                        .input_shape(vec![3, 32, 32])
                        .output_size(8)
                        .language_dim(16),
                ),
            )
            .lowdim("joint_states", MlpConfig::new(7, vec![16], 8, false))
    }

    fn obs(b: usize, t: usize) -> Result<QuestObs> {
        let mut obs = QuestObs::default();
        let image = Tensor::zeros((b, t, 3, 32, 32), DType::U8, &Device::Cpu)?;
        obs.images.insert("agentview".into(), image);
        obs.lowdim.insert(
            "joint_states".into(),
            Tensor::randn(0f64, 1., (b, t, 7), &Device::Cpu)?,
        );
        obs.task_id = Some(Tensor::new(&[0u32, 2][..b], &Device::Cpu)?);
        Ok(obs)
    }

    #[test]
    fn test_obs_encode() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ObsEncoder::build(vb, config())?;

        let obs = enc.preprocess_input(&obs(2, 3)?)?;
        assert_eq!(obs.images["agentview"].dtype(), DType::F32);
        assert_eq!(obs.lowdim["joint_states"].dtype(), DType::F32);

        let task_emb = enc.get_task_emb(&obs)?;
        assert_eq!(task_emb.dims(), &[2, 16]);
        let y = enc.obs_encode(&obs, &task_emb, true)?;
        assert_eq!(y.dims(), &[2, 3, 16]);
        Ok(())
    }

    #[test]
    fn test_language_task_embedding() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ObsEncoder::build(vb, config().lang_dim(Some(12)))?;

        let mut obs = obs(2, 1)?;
        let e = enc.get_task_emb(&obs).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<QuestError>(),
            Some(QuestError::MissingInput(_))
        ));

        obs.lang_emb = Some(Tensor::randn(0f32, 1., (2, 12), &Device::Cpu)?);
        assert_eq!(enc.get_task_emb(&obs)?.dims(), &[2, 16]);
        Ok(())
    }

    #[test]
    fn test_task_shape_mismatch() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ObsEncoder::build(vb, config())?;
        let is_shape_mismatch = |e: anyhow::Error| {
            matches!(
                e.downcast_ref::<QuestError>(),
                Some(QuestError::ShapeMismatch { .. })
            )
        };

        // A single task id without batch dimension
        let mut obs = obs(2, 3)?;
        obs.task_id = Some(Tensor::new(1u32, &Device::Cpu)?);
        assert!(is_shape_mismatch(enc.get_task_emb(&obs).unwrap_err()));

        let obs = enc.preprocess_input(&obs)?;
        let task_emb = Tensor::zeros(16, DType::F32, &Device::Cpu)?;
        assert!(is_shape_mismatch(enc.obs_encode(&obs, &task_emb, false).unwrap_err()));

        let obs = QuestObs {
            task_id: Some(Tensor::new(1u32, &Device::Cpu)?),
            ..Default::default()
        };
        assert!(is_shape_mismatch(obs.batch_size().unwrap_err()));
        Ok(())
    }

    #[test]
    fn test_token_backbone_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ObsEncoderConfig::default().embed_dim(16).camera(
            "wrist",
            VisionBackboneConfig::ResNet(
                ResNetConfig::default()
                    .input_shape(vec![3, 32, 32])
                    .keep_tokens(true)
                    .remove_layer_num(2)
                    .language_dim(16),
            ),
        );
        let e = ObsEncoder::build(vb, config).err().unwrap();
        assert!(matches!(
            e.downcast_ref::<QuestError>(),
            Some(QuestError::Configuration(_))
        ));
    }
}
