//! Optimizers and parameter groups.
use anyhow::Result;
use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW};
use candle_optimisers::adam::{Adam, ParamsAdam};
use serde::{Deserialize, Serialize};

/// Configuration of optimizer for training the neural networks of a policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OptimizerConfig {
    /// AdamW optimizer.
    AdamW {
        lr: f64,
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
        #[serde(default = "default_weight_decay")]
        weight_decay: f64,
    },

    /// Adam optimizer.
    ///
    /// It has no weight decay, so the weight decay of a [`ParamGroup`] is ignored.
    Adam {
        /// Learning rate.
        lr: f64,
    },
}

fn default_beta1() -> f64 {
    ParamsAdamW::default().beta1
}

fn default_beta2() -> f64 {
    ParamsAdamW::default().beta2
}

fn default_eps() -> f64 {
    ParamsAdamW::default().eps
}

fn default_weight_decay() -> f64 {
    ParamsAdamW::default().weight_decay
}

impl OptimizerConfig {
    /// Constructs an optimizer for the given variables.
    pub fn build(&self, vars: Vec<Var>) -> Result<Optimizer> {
        match &self {
            OptimizerConfig::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            } => {
                let params = ParamsAdamW {
                    lr: *lr,
                    beta1: *beta1,
                    beta2: *beta2,
                    eps: *eps,
                    weight_decay: *weight_decay,
                };
                let opt = AdamW::new(vars, params)?;
                Ok(Optimizer::AdamW(opt))
            }
            OptimizerConfig::Adam { lr } => {
                let params = ParamsAdam {
                    lr: *lr,
                    ..ParamsAdam::default()
                };
                let opt = Adam::new(vars, params)?;
                Ok(Optimizer::Adam(opt))
            }
        }
    }

    /// Constructs an optimizer for a parameter group, applying its overrides.
    pub fn build_group(&self, group: &ParamGroup) -> Result<Optimizer> {
        let mut config = self.clone();
        if let Some(lr) = group.lr {
            config = config.learning_rate(lr);
        }
        if let Some(wd) = group.weight_decay {
            config = config.weight_decay(wd);
        }
        config.build(group.vars.clone())
    }

    /// Override learning rate.
    pub fn learning_rate(self, lr: f64) -> Self {
        match self {
            Self::AdamW {
                lr: _,
                beta1,
                beta2,
                eps,
                weight_decay,
            } => Self::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            },
            Self::Adam { lr: _ } => Self::Adam { lr },
        }
    }

    /// Override weight decay.
    pub fn weight_decay(self, weight_decay: f64) -> Self {
        match self {
            Self::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay: _,
            } => Self::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            },
            adam @ Self::Adam { .. } => adam,
        }
    }

    /// Returns the base learning rate.
    pub fn get_learning_rate(&self) -> f64 {
        match self {
            Self::AdamW { lr, .. } => *lr,
            Self::Adam { lr } => *lr,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let params = ParamsAdamW::default();
        Self::AdamW {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

/// A set of variables optimized with the same hyperparameters.
///
/// `lr` and `weight_decay` override the values of the [`OptimizerConfig`]
/// the group is built with; `None` keeps the configured value.
#[derive(Clone)]
pub struct ParamGroup {
    /// Name of the group, used for logging.
    pub name: String,

    /// Names of the variables in the group, in the order of `vars`.
    pub var_names: Vec<String>,

    /// Variables of the group.
    pub vars: Vec<Var>,

    /// Learning rate override.
    pub lr: Option<f64>,

    /// Weight decay override.
    pub weight_decay: Option<f64>,
}

impl ParamGroup {
    /// Returns the number of variables in the group.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if the group has no variables.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns the total number of scalar parameters.
    pub fn n_params(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("name", &self.name)
            .field("var_names", &self.var_names)
            .field("lr", &self.lr)
            .field("weight_decay", &self.weight_decay)
            .finish()
    }
}

/// Optimizers.
///
/// This is a thin wrapper of optimizers in [`candle_nn`] and [`candle_optimisers`].
pub enum Optimizer {
    /// AdamW optimizer.
    AdamW(AdamW),

    /// Adam optimizer.
    Adam(Adam),
}

impl Optimizer {
    /// Applies a backward step pass.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::AdamW(opt) => Ok(opt.backward_step(loss)?),
            Self::Adam(opt) => Ok(opt.backward_step(loss)?),
        }
    }

    /// Updates variables with precomputed gradients.
    ///
    /// Several optimizers can share the gradients of a single backward pass.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => Ok(opt.step(grads)?),
            Self::Adam(opt) => Ok(opt.step(grads)?),
        }
    }

    /// Returns the current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Adam(opt) => opt.learning_rate(),
        }
    }
}
