use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use quest_candle_agent::{
    autoencoder::{ActionAutoencoderConfig, QuantizerConfig},
    mlp::MlpConfig,
    obs::{ObsEncoderConfig, QuestBatch, QuestObs},
    prior::SkillPriorConfig,
    quest::{Quest, QuestConfig, TrainingStage},
    util::{param_role, ParamRole},
    vision::{DinoConfig, ResNetConfig, VisionBackboneConfig},
};
use quest_core::{error::QuestError, Agent, ChunkPolicy, Configurable};
use std::collections::{BTreeSet, HashMap};
use tempdir::TempDir;

const BATCH: usize = 4;
const T_OBS: usize = 4;
const EMBED: usize = 256;

fn fsq() -> QuantizerConfig {
    QuantizerConfig::Fsq {
        levels: vec![8, 8, 8],
    }
}

fn vq() -> QuantizerConfig {
    QuantizerConfig::Vq {
        codebook_size: 8,
        n_groups: 3,
        dim: 2,
        beta: 0.25,
    }
}

fn config(stage: TrainingStage, quantizer: QuantizerConfig) -> QuestConfig {
    let latent_dim = quantizer.latent_dim();
    QuestConfig::default()
        .stage(stage)
        .autoencoder(
            ActionAutoencoderConfig::default()
                .action_dim(7)
                .skill_block_size(10)
                .downsample_factor(2)
                .hidden_dim(32)
                .quantizer(quantizer),
        )
        .prior(
            SkillPriorConfig::default()
                .vocab_size(512)
                .block_size(5)
                .n_embd(EMBED)
                .n_layer(1)
                .n_head(4)
                .dropout(0.0)
                .code_dim(latent_dim)
                .context_len(1 + T_OBS),
        )
        .obs_encoder(
            ObsEncoderConfig::default()
                .embed_dim(EMBED)
                .n_tasks(3)
                .lowdim("joint_states", MlpConfig::new(9, vec![32], 32, false)),
        )
        .action_horizon(3)
}

fn obs() -> Result<QuestObs> {
    let mut obs = QuestObs::default();
    obs.lowdim.insert(
        "joint_states".into(),
        Tensor::randn(0f32, 1., (BATCH, T_OBS, 9), &Device::Cpu)?,
    );
    obs.task_id = Some(Tensor::new(&[0u32, 1, 2, 1], &Device::Cpu)?);
    Ok(obs)
}

fn batch() -> Result<QuestBatch> {
    Ok(QuestBatch {
        obs: obs()?,
        actions: (Tensor::randn(0f32, 1., (BATCH, 10, 7), &Device::Cpu)? * 0.5)?,
    })
}

fn keys(record: &quest_core::record::Record) -> Vec<&str> {
    record.keys().map(|k| k.as_str()).collect()
}

/// Names of the variables in the parameter groups.
fn group_names(quest: &Quest) -> Result<BTreeSet<String>> {
    Ok(quest
        .get_optimizers()?
        .into_iter()
        .flat_map(|g| g.var_names)
        .collect())
}

/// Names of all optimizable variables.
fn all_names(quest: &Quest) -> BTreeSet<String> {
    let data = quest.varmap().data().lock().unwrap();
    data.keys()
        .filter(|k| param_role(k) != ParamRole::Buffer)
        .cloned()
        .collect()
}

fn snapshot(quest: &Quest, name: &str) -> Result<Vec<f32>> {
    let data = quest.varmap().data().lock().unwrap();
    let var = data.get(name).unwrap();
    Ok(var.as_tensor().flatten_all()?.to_vec1()?)
}

#[test]
fn test_stage0_fsq() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut quest = Quest::build(config(TrainingStage::AutoencoderPretraining, fsq()))?;
    assert_eq!(quest.autoencoder().codebook_size(), 512);
    assert_eq!(quest.prior().output_vocab_size(), 513);

    let (loss, record) = quest.compute_loss(&batch()?)?;
    assert_eq!(
        keys(&record),
        vec!["aux_loss", "loss", "pp", "pp_sample", "recon_loss"]
    );
    let loss: f32 = loss.to_scalar()?;
    assert!(loss > 0.0);
    assert_eq!(record.get_scalar("aux_loss")?, 0.0);
    assert_eq!(record.get_scalar("loss")?, record.get_scalar("recon_loss")?);
    assert!(record.get_scalar("pp")? >= 1.0);
    Ok(())
}

#[test]
fn test_stage0_vq() -> Result<()> {
    let mut quest = Quest::build(config(TrainingStage::AutoencoderPretraining, vq()))?;
    assert_eq!(quest.autoencoder().codebook_size(), 512);

    let (_, record) = quest.compute_loss(&batch()?)?;
    let aux_loss = record.get_scalar("aux_loss")?;
    assert!(aux_loss > 0.0);
    let expected = record.get_scalar("recon_loss")? + aux_loss;
    assert!((record.get_scalar("loss")? - expected).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_stage1() -> Result<()> {
    let mut quest = Quest::build(config(TrainingStage::PriorTraining, fsq()).l1_loss_scale(10.0))?;
    let batch = batch()?;

    let obs = quest.obs_encoder().preprocess_input(&batch.obs)?;
    assert_eq!(quest.get_context(&obs, false)?.dims(), &[BATCH, 1 + T_OBS, EMBED]);

    let (_, record) = quest.compute_loss(&batch)?;
    assert_eq!(keys(&record), vec!["l1_loss", "loss", "nll_loss"]);
    assert!(record.get_scalar("nll_loss")? > 0.0);
    assert!(record.get_scalar("l1_loss")? > 0.0);
    // The reconstruction term is ignored whatever the configured scale
    assert_eq!(record.get_scalar("loss")?, record.get_scalar("nll_loss")?);
    Ok(())
}

#[test]
fn test_stage2() -> Result<()> {
    let scale = 0.5;
    let mut quest =
        Quest::build(config(TrainingStage::JointFineTuning, fsq()).l1_loss_scale(scale))?;
    let (_, record) = quest.compute_loss(&batch()?)?;
    let expected = record.get_scalar("nll_loss")? + scale as f32 * record.get_scalar("l1_loss")?;
    assert!((record.get_scalar("loss")? - expected).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_direct_skill_tokens() -> Result<()> {
    let mut config = config(TrainingStage::PriorTraining, vq());
    config.prior.direct_skill_tokens = true;
    let mut quest = Quest::build(config)?;
    let (_, record) = quest.compute_loss(&batch()?)?;
    assert!(record.get_scalar("nll_loss")? > 0.0);

    let chunk = quest.sample_actions(&obs()?)?;
    assert_eq!(chunk.dim(), (10, BATCH, 7));
    Ok(())
}

#[test]
fn test_get_optimizers() -> Result<()> {
    let quest = Quest::build(config(TrainingStage::AutoencoderPretraining, vq()))?;
    let all = all_names(&quest);
    let autoencoder = all
        .iter()
        .filter(|k| k.starts_with("autoencoder."))
        .cloned()
        .collect::<BTreeSet<_>>();
    let decoder = all
        .iter()
        .filter(|k| k.starts_with("autoencoder.decoder."))
        .cloned()
        .collect::<BTreeSet<_>>();
    let rest = all.difference(&autoencoder).cloned().collect::<BTreeSet<_>>();

    // Stage 0 trains the autoencoder only
    let groups = quest.get_optimizers()?;
    assert_eq!(groups.len(), 2);
    assert_eq!(group_names(&quest)?, autoencoder);
    assert!(groups[1].var_names.iter().all(|k| k.ends_with("bias")));
    assert_eq!(groups[1].weight_decay, Some(0.0));

    // Stage 1 trains everything except the autoencoder
    let quest = Quest::build(config(TrainingStage::PriorTraining, vq()))?;
    let stage1 = group_names(&quest)?;
    assert_eq!(stage1, rest);

    // Stage 2 adds the decoder, not the encoder and the codebook
    let quest = Quest::build(config(TrainingStage::JointFineTuning, vq()))?;
    let stage2 = group_names(&quest)?;
    assert_eq!(stage2, stage1.union(&decoder).cloned().collect());
    assert!(!stage2.contains("autoencoder.quantizer.codebook0"));
    assert!(!stage2.iter().any(|k| k.starts_with("autoencoder.encoder.")));
    Ok(())
}

#[test]
fn test_backbone_groups() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = config(TrainingStage::PriorTraining, fsq()).backbone_lr(1e-5);
    config.obs_encoder = config
        .obs_encoder
        .camera(
            "agentview",
            VisionBackboneConfig::ResNet(
                ResNetConfig::default()
                    .input_shape(vec![3, 32, 32])
                    .output_size(16)
                    .language_dim(EMBED)
                    .freeze(true),
            ),
        )
        .camera(
            "wrist",
            VisionBackboneConfig::Dino(
                DinoConfig::default()
                    .input_shape(vec![3, 16, 16])
                    .output_size(16)
                    .image_size(16, 8)
                    .transformer(16, 1, 2)
                    .freeze(false),
            ),
        );
    let quest = Quest::build(config)?;
    let groups = quest.get_optimizers()?;

    assert_eq!(groups[0].name, "backbone_decay");
    assert_eq!(groups[1].name, "backbone_no_decay");
    for g in groups[..2].iter() {
        assert_eq!(g.lr, Some(1e-5));
        assert!(g
            .var_names
            .iter()
            .all(|k| k.starts_with("image_encoders.wrist.")));
    }
    assert!(groups[0]
        .var_names
        .contains(&"image_encoders.wrist.vit.pos_embed".to_string()));

    for g in groups[2..].iter() {
        assert_eq!(g.lr, None);
        assert!(!g.var_names.iter().any(|k| k.starts_with("image_encoders.wrist.")));
        assert!(!g
            .var_names
            .iter()
            .any(|k| k.starts_with("image_encoders.agentview.stem")
                || k.starts_with("image_encoders.agentview.layer")));
    }
    let names = group_names(&quest)?;
    assert!(names.contains("image_encoders.agentview.lang_proj1.weight"));
    assert!(names.contains("image_encoders.agentview.projection.projection.weight"));
    Ok(())
}

fn wrist(weights_path: Option<std::path::PathBuf>) -> VisionBackboneConfig {
    VisionBackboneConfig::Dino(
        DinoConfig::default()
            .input_shape(vec![3, 16, 16])
            .output_size(16)
            .image_size(16, 8)
            .transformer(16, 1, 2)
            .freeze(false)
            .weights_path(weights_path),
    )
}

#[test]
fn test_pretrained_vit_is_trained() -> Result<()> {
    let tmp_dir = TempDir::new("vit_weights")?;
    let path = tmp_dir.path().join("vit.safetensors");
    let prefix = "image_encoders.wrist.vit.";

    let mut config1 = config(TrainingStage::PriorTraining, fsq());
    config1.obs_encoder = config1.obs_encoder.camera("wrist", wrist(None));
    let quest1 = Quest::build(config1)?;
    let weights = quest1
        .varmap()
        .data()
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(k, v)| Some((k.strip_prefix(prefix)?.to_string(), v.as_tensor().clone())))
        .collect::<HashMap<_, _>>();
    assert!(weights.contains_key("pos_embed"));
    candle_core::safetensors::save(&weights, &path)?;

    let mut config2 = config(TrainingStage::PriorTraining, fsq()).seed(7);
    config2.obs_encoder = config2.obs_encoder.camera("wrist", wrist(Some(path)));
    let quest2 = Quest::build(config2)?;

    // Loaded weights are variables of the unfrozen backbone
    let groups = quest2.get_optimizers()?;
    assert_eq!(groups[0].name, "backbone_decay");
    assert_eq!(groups[1].name, "backbone_no_decay");
    for name in ["vit.pos_embed", "vit.patch_embed.weight", "vit.blocks.0.attn.qkv.weight"] {
        assert!(groups[0].var_names.contains(&format!("image_encoders.wrist.{}", name)));
    }
    for name in ["vit.norm.weight", "vit.patch_embed.bias"] {
        assert!(groups[1].var_names.contains(&format!("image_encoders.wrist.{}", name)));
    }

    for (k, t) in weights.iter() {
        let expected = t.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(snapshot(&quest2, &format!("{}{}", prefix, k))?, expected, "{}", k);
    }
    Ok(())
}

#[test]
fn test_opt_stage1_keeps_autoencoder() -> Result<()> {
    let mut quest = Quest::build(
        config(TrainingStage::PriorTraining, fsq())
            .l1_loss_scale(1.0)
            .record_verbose_level(2),
    )?;
    quest.train();
    let batch = batch()?;
    let encoder0 = snapshot(&quest, "autoencoder.encoder.proj_in.weight")?;
    let decoder0 = snapshot(&quest, "autoencoder.decoder.proj_out.weight")?;
    let head0 = snapshot(&quest, "prior.head.weight")?;

    let record = quest.opt_with_record(&batch)?;
    assert!(record.contains_key("nll_loss"));
    assert!(record.contains_key("prior.head.weight_mean"));

    assert_eq!(snapshot(&quest, "autoencoder.encoder.proj_in.weight")?, encoder0);
    assert_eq!(snapshot(&quest, "autoencoder.decoder.proj_out.weight")?, decoder0);
    assert_ne!(snapshot(&quest, "prior.head.weight")?, head0);
    Ok(())
}

#[test]
fn test_opt_stage2_trains_decoder() -> Result<()> {
    let mut quest =
        Quest::build(config(TrainingStage::JointFineTuning, fsq()).l1_loss_scale(1.0))?;
    quest.train();
    let encoder0 = snapshot(&quest, "autoencoder.encoder.proj_in.weight")?;
    let decoder0 = snapshot(&quest, "autoencoder.decoder.proj_out.weight")?;

    quest.opt(&batch()?)?;
    assert_eq!(snapshot(&quest, "autoencoder.encoder.proj_in.weight")?, encoder0);
    assert_ne!(snapshot(&quest, "autoencoder.decoder.proj_out.weight")?, decoder0);
    Ok(())
}

#[test]
fn test_opt_stage0_reduces_loss() -> Result<()> {
    let mut config = config(TrainingStage::AutoencoderPretraining, fsq());
    config.opt_config = config.opt_config.learning_rate(1e-3);
    let mut quest = Quest::build(config)?;
    quest.train();
    let batch = batch()?;

    let loss0 = quest.compute_loss(&batch)?.1.get_scalar("recon_loss")?;
    for _ in 0..30 {
        quest.opt(&batch)?;
    }
    let loss1 = quest.compute_loss(&batch)?.1.get_scalar("recon_loss")?;
    assert!(loss1 < loss0);
    Ok(())
}

#[test]
fn test_sample_and_action_queue() -> Result<()> {
    let mut quest = Quest::build(config(TrainingStage::PriorTraining, fsq()))?;
    let obs = obs()?;

    let chunk = quest.sample_actions(&obs)?;
    assert_eq!(chunk.dim(), (10, BATCH, 7));

    for _ in 0..3 {
        assert_eq!(quest.get_action(&obs)?.dim(), (BATCH, 7));
    }
    quest.reset();
    assert_eq!(quest.get_action(&obs)?.dim(), (BATCH, 7));
    Ok(())
}

#[test]
fn test_greedy_sampling_is_deterministic() -> Result<()> {
    let mut config = config(TrainingStage::PriorTraining, fsq());
    config.prior.beam_size = 1;
    let obs = obs()?;
    let mut quest = Quest::build(config)?;
    let a1 = quest.sample_actions(&obs)?;
    let a2 = quest.sample_actions(&obs)?;
    assert_eq!(a1, a2);
    Ok(())
}

#[test]
fn test_save_load_params() -> Result<()> {
    let tmp_dir = TempDir::new("quest")?;
    let mut quest1 = Quest::build(config(TrainingStage::AutoencoderPretraining, fsq()))?;
    quest1.train();
    quest1.opt(&batch()?)?;
    quest1.save_params(tmp_dir.path())?;
    assert!(tmp_dir.path().join("quest.safetensors").exists());

    let mut quest2 = Quest::build(config(TrainingStage::JointFineTuning, fsq()))?;
    let name = "autoencoder.decoder.proj_out.weight";
    assert_ne!(snapshot(&quest1, name)?, snapshot(&quest2, name)?);
    quest2.load_params(tmp_dir.path())?;
    assert_eq!(snapshot(&quest1, name)?, snapshot(&quest2, name)?);
    Ok(())
}

#[test]
fn test_inconsistent_config() {
    let mut config = config(TrainingStage::PriorTraining, fsq());
    config.prior.vocab_size = 1000;
    let e = Quest::build(config).err().unwrap();
    assert!(matches!(
        e.downcast_ref::<QuestError>(),
        Some(QuestError::Configuration(_))
    ));
}

#[test]
fn test_shape_mismatch() -> Result<()> {
    let mut quest = Quest::build(config(TrainingStage::AutoencoderPretraining, fsq()))?;
    let batch = QuestBatch {
        obs: obs()?,
        actions: Tensor::zeros((BATCH, 8, 7), DType::F32, &Device::Cpu)?,
    };
    let e = quest.compute_loss(&batch).err().unwrap();
    assert!(matches!(
        e.downcast_ref::<QuestError>(),
        Some(QuestError::ShapeMismatch { .. })
    ));
    Ok(())
}
