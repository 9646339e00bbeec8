//! QueST skill-token policy implemented with [candle](https://crates.io/crates/candle-core).
//!
//! The policy learns a discrete vocabulary of skills from chunks of continuous actions
//! and predicts skill tokens autoregressively from observations:
//!
//! * [`autoencoder::ActionAutoencoder`] compresses an action chunk into a short sequence
//!   of codebook indices with either a finite scalar quantizer or a learned codebook,
//! * [`prior::SkillPrior`] is a causal transformer predicting the next skill token given
//!   the previous tokens and a context of task and observation embeddings,
//! * [`vision::VisionBackbone`] turns camera images (optionally FiLM-conditioned on
//!   language) into embeddings,
//! * [`quest::Quest`] orchestrates the three training stages, the optimizer parameter
//!   groups and inference.
pub mod autoencoder;
pub mod mlp;
pub mod model;
pub mod obs;
pub mod opt;
pub mod prior;
pub mod quest;
pub mod transformer;
pub mod util;
pub mod vision;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The GPU device with the given ordinal.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl TryFrom<Device> for candle_core::Device {
    type Error = candle_core::Error;

    fn try_from(device: Device) -> Result<Self, Self::Error> {
        match device {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(n) => candle_core::Device::new_cuda(n),
        }
    }
}
