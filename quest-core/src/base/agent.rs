//! Agent.
use super::ChunkPolicy;
use crate::record::Record;
use anyhow::Result;
use std::path::Path;

/// Represents a trainable chunk policy.
///
/// Batches are produced by an external data loader, and the training loop that
/// calls [`Agent::opt_with_record`] is owned by the caller.
pub trait Agent: ChunkPolicy {
    /// A training batch.
    type Batch;

    /// The scalar loss, typically a tensor tracked for backpropagation.
    type Loss;

    /// Set the policy to training mode.
    fn train(&mut self);

    /// Set the policy to evaluation mode.
    fn eval(&mut self);

    /// Return if it is in training mode.
    fn is_train(&self) -> bool;

    /// Computes the loss of the current training objective and a record of
    /// its components.
    fn compute_loss(&mut self, batch: &Self::Batch) -> Result<(Self::Loss, Record)>;

    /// Performs an optimization step.
    fn opt(&mut self, batch: &Self::Batch) -> Result<()> {
        self.opt_with_record(batch).map(|_| ())
    }

    /// Performs an optimization step and returns some information.
    fn opt_with_record(&mut self, batch: &Self::Batch) -> Result<Record>;

    /// Save the parameters of the agent in the given directory.
    fn save_params(&self, path: &Path) -> Result<()>;

    /// Load the parameters of the agent from the given directory.
    fn load_params(&mut self, path: &Path) -> Result<()>;
}
