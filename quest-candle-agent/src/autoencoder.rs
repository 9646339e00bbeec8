//! Action autoencoder compressing action chunks into skill tokens.
//!
//! An action chunk of shape `(batch, skill_block_size, action_dim)` is encoded into a
//! sequence of `skill_block_size / downsample_factor` latent vectors, which are
//! discretized by a [`Quantizer`]. Each latent vector corresponds to one integer index
//! in `0..codebook_size`, the skill token predicted by the
//! [`SkillPrior`](crate::prior::SkillPrior).
mod base;
mod config;
mod quantizer;
pub use base::{ActionAutoencoder, AutoencoderOutput};
pub use config::{ActionAutoencoderConfig, QuantizerConfig};
pub use quantizer::{perplexity, Quantizer, QuantizerOutput};
