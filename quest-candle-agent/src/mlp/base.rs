use super::MlpConfig;
use crate::model::SubModel1;
use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Returns vector of linear modules from [`MlpConfig`].
fn create_linear_layers(vs: VarBuilder, config: &MlpConfig) -> Result<Vec<Linear>> {
    config
        .layer_dims()
        .into_iter()
        .enumerate()
        .map(|(i, (d_in, d_out))| Ok(linear(d_in, d_out, vs.pp(format!("fc{}", i)))?))
        .collect()
}

/// Multilayer perceptron with ReLU activation function.
pub struct Mlp {
    config: MlpConfig,
    device: Device,
    layers: Vec<Linear>,
}

impl SubModel1 for Mlp {
    type Config = MlpConfig;
    type Input = Tensor;
    type Output = Tensor;

    fn forward_t(&self, xs: &Self::Input, _train: bool) -> Result<Tensor> {
        let n_layers = self.layers.len();
        let mut xs = xs.to_device(&self.device)?;

        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i + 1 < n_layers || self.config.activation_out {
                xs = xs.relu()?;
            }
        }

        Ok(xs)
    }

    fn build(vs: VarBuilder, config: Self::Config) -> Result<Self> {
        let device = vs.device().clone();
        let layers = create_linear_layers(vs, &config)?;

        Ok(Self {
            config,
            device,
            layers,
        })
    }
}
