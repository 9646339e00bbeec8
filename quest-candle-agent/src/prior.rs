//! Autoregressive prior over skill tokens.
mod base;
mod config;
mod sampler;
pub use base::{CodeLookup, SkillInput, SkillPrior};
pub use config::SkillPriorConfig;
pub use sampler::{sample_rows, sample_top_k};
