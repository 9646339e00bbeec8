use serde::{Deserialize, Serialize};

/// Configuration of [`Mlp`](super::Mlp).
///
/// The layers map `in_dim -> units[0] -> ... -> out_dim`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MlpConfig {
    /// Input width.
    pub in_dim: usize,

    /// Widths of the hidden layers. It can be empty for a single linear layer.
    pub units: Vec<usize>,

    /// Output width.
    pub out_dim: usize,

    /// Applies ReLU after the last layer.
    #[serde(default)]
    pub activation_out: bool,
}

impl MlpConfig {
    /// Creates configuration of MLP.
    pub fn new(in_dim: usize, units: Vec<usize>, out_dim: usize, activation_out: bool) -> Self {
        Self {
            in_dim,
            units,
            out_dim,
            activation_out,
        }
    }

    /// Returns `(input, output)` widths of the layers.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let dims = std::iter::once(self.in_dim)
            .chain(self.units.iter().copied())
            .chain(std::iter::once(self.out_dim))
            .collect::<Vec<_>>();
        dims.windows(2).map(|w| (w[0], w[1])).collect()
    }
}
