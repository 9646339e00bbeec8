//! QueST policy: skill tokenization, token prior and staged training.
mod base;
mod config;
mod stage;
pub use base::Quest;
pub use config::{AuxLossReduction, QuestConfig};
pub use stage::{Objective, TrainingStage};
