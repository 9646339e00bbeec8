//! Training stages.
use super::Quest;
use crate::{autoencoder::ActionAutoencoder, util::ParamFilter};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Loss optimized in a training stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Reconstruction of action chunks by the autoencoder.
    Reconstruction,

    /// Next-token prediction by the prior, with an action reconstruction term.
    NextToken,
}

/// Stage of training, fixed for a training run.
///
/// It is serialized as `0`, `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrainingStage {
    /// Stage 0: the autoencoder learns the skill vocabulary.
    AutoencoderPretraining,

    /// Stage 1: the prior learns to predict the tokens of the frozen autoencoder.
    PriorTraining,

    /// Stage 2: the prior and the decoder of the autoencoder are fine-tuned jointly.
    JointFineTuning,
}

impl TryFrom<u8> for TrainingStage {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AutoencoderPretraining),
            1 => Ok(Self::PriorTraining),
            2 => Ok(Self::JointFineTuning),
            _ => Err(format!("training stage must be 0, 1 or 2, got {}", v)),
        }
    }
}

impl From<TrainingStage> for u8 {
    fn from(stage: TrainingStage) -> Self {
        match stage {
            TrainingStage::AutoencoderPretraining => 0,
            TrainingStage::PriorTraining => 1,
            TrainingStage::JointFineTuning => 2,
        }
    }
}

impl TrainingStage {
    /// Loss of the stage.
    pub fn objective(&self) -> Objective {
        match self {
            Self::AutoencoderPretraining => Objective::Reconstruction,
            Self::PriorTraining | Self::JointFineTuning => Objective::NextToken,
        }
    }

    /// Filters selecting the trainable variables of the stage, by name under the
    /// policy root. Vision backbones are handled separately.
    pub fn trainable_segments(&self) -> Vec<ParamFilter> {
        match self {
            Self::AutoencoderPretraining => vec![ParamFilter::under(Quest::AUTOENCODER)],
            Self::PriorTraining => vec![ParamFilter::all().exclude(Quest::AUTOENCODER)],
            Self::JointFineTuning => vec![
                ParamFilter::all().exclude(Quest::AUTOENCODER),
                ParamFilter::under(format!(
                    "{}.{}",
                    Quest::AUTOENCODER,
                    ActionAutoencoder::DECODER
                )),
            ],
        }
    }

    /// Weight of the action reconstruction term of the prior loss.
    ///
    /// It is the configured value at stage 2 and zero otherwise.
    pub fn l1_loss_scale(&self, configured: f64) -> f64 {
        match self {
            Self::JointFineTuning => configured,
            _ => 0.0,
        }
    }
}
