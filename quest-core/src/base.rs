//! Core traits.
mod agent;
mod policy;
pub use agent::Agent;
pub use policy::{ChunkPolicy, Configurable};
