//! Partitioning of parameters into weight-decay and no-decay sets.
//!
//! The variables of a policy live in one [`VarMap`] and are named by the path of the
//! module that created them, e.g., `autoencoder.decoder.conv0.bias`. Partitioning walks
//! these names, so no inspection of module types is needed.
use crate::opt::ParamGroup;
use anyhow::{anyhow, Result};
use candle_core::Var;
use candle_nn::VarMap;
use std::collections::BTreeMap;

/// Structural role of a parameter with respect to weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Weight matrices, convolution kernels, embeddings and codebooks.
    Decay,

    /// Biases and parameters of normalization layers.
    NoDecay,

    /// Running statistics of batch normalization. They are not optimized.
    Buffer,
}

const NORM_PREFIXES: [&str; 3] = ["norm", "bn", "ln"];

/// Classifies a variable by its name.
///
/// Only the last segment and the module owning the variable, the segment before it,
/// are looked at. Observation names chosen by users appear higher in the path.
pub fn param_role(name: &str) -> ParamRole {
    let mut segments = name.rsplit('.');
    let last = segments.next().unwrap_or_default();
    let owner = segments.next().unwrap_or_default();

    if last.starts_with("running_") {
        ParamRole::Buffer
    } else if last == "bias" || NORM_PREFIXES.iter().any(|p| owner.starts_with(p)) {
        ParamRole::NoDecay
    } else {
        ParamRole::Decay
    }
}

/// Selects variables by name prefix.
///
/// A variable is selected if its name is under one of `include` (or `include` is
/// empty) and not under any of `exclude`. Prefixes match whole path segments, so
/// `vision` matches `vision.conv` but not `vision_proj.weight`.
#[derive(Debug, Clone, Default)]
pub struct ParamFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl ParamFilter {
    /// Selects all variables.
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects variables under `prefix`.
    pub fn under(prefix: impl Into<String>) -> Self {
        Self {
            include: vec![prefix.into()],
            exclude: vec![],
        }
    }

    /// Adds an included prefix.
    pub fn include(mut self, prefix: impl Into<String>) -> Self {
        self.include.push(prefix.into());
        self
    }

    /// Adds an excluded prefix.
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    /// Adds excluded prefixes.
    pub fn exclude_all<S: Into<String>>(mut self, prefixes: impl IntoIterator<Item = S>) -> Self {
        self.exclude.extend(prefixes.into_iter().map(Into::into));
        self
    }

    fn is_under(name: &str, prefix: &str) -> bool {
        name == prefix
            || (name.starts_with(prefix) && name[prefix.len()..].starts_with('.'))
    }

    /// Returns `true` if the variable of the given name is selected.
    pub fn accepts(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|p| Self::is_under(name, p)))
            && !self.exclude.iter().any(|p| Self::is_under(name, p))
    }
}

/// Variables split into weight-decay and no-decay sets, each sorted by name.
#[derive(Clone, Default)]
pub struct PartitionedParams {
    /// Variables with weight decay.
    pub decay: Vec<(String, Var)>,

    /// Variables without weight decay.
    pub no_decay: Vec<(String, Var)>,
}

impl PartitionedParams {
    /// Appends the variables of another partition.
    pub fn extend(&mut self, other: PartitionedParams) {
        self.decay.extend(other.decay);
        self.no_decay.extend(other.no_decay);
    }

    /// Returns `true` if both sets are empty.
    pub fn is_empty(&self) -> bool {
        self.decay.is_empty() && self.no_decay.is_empty()
    }

    /// Returns the names of all variables.
    pub fn names(&self) -> Vec<&str> {
        self.decay
            .iter()
            .chain(self.no_decay.iter())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Turns the partition into a decay group and a no-decay group.
    ///
    /// The no-decay group always has its weight decay overridden with zero.
    pub fn into_groups(self, name: &str, lr: Option<f64>) -> [ParamGroup; 2] {
        let group = |suffix: &str, vars: Vec<(String, Var)>, weight_decay| {
            let (var_names, vars) = vars.into_iter().unzip();
            ParamGroup {
                name: format!("{}_{}", name, suffix),
                var_names,
                vars,
                lr,
                weight_decay,
            }
        };
        [
            group("decay", self.decay, None),
            group("no_decay", self.no_decay, Some(0.0)),
        ]
    }
}

/// Splits the variables selected by `filter` into decay and no-decay sets.
///
/// Batch normalization statistics are skipped.
pub fn separate_no_decay(varmap: &VarMap, filter: &ParamFilter) -> Result<PartitionedParams> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock is poisoned"))?;
    let sorted = data
        .iter()
        .filter(|(k, _)| filter.accepts(k))
        .collect::<BTreeMap<_, _>>();
    let mut params = PartitionedParams::default();

    for (k, v) in sorted {
        match param_role(k) {
            ParamRole::Decay => params.decay.push((k.clone(), v.clone())),
            ParamRole::NoDecay => params.no_decay.push((k.clone(), v.clone())),
            ParamRole::Buffer => {}
        }
    }

    Ok(params)
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_param_role() {
        assert_eq!(param_role("prior.head.weight"), ParamRole::Decay);
        assert_eq!(param_role("prior.head.bias"), ParamRole::NoDecay);
        assert_eq!(param_role("prior.blocks.0.ln1.weight"), ParamRole::NoDecay);
        assert_eq!(param_role("vision.stem.bn1.weight"), ParamRole::NoDecay);
        assert_eq!(param_role("vision.stem.bn1.running_mean"), ParamRole::Buffer);
        assert_eq!(param_role("autoencoder.quantizer.codebook0"), ParamRole::Decay);
        assert_eq!(param_role("image_encoders.wrist.vit.norm.weight"), ParamRole::NoDecay);
        assert_eq!(param_role("weight"), ParamRole::Decay);
    }

    #[test]
    fn test_param_role_ignores_observation_names() {
        assert_eq!(param_role("lowdim_encoders.normals.fc0.weight"), ParamRole::Decay);
        assert_eq!(param_role("lowdim_encoders.normals.fc0.bias"), ParamRole::NoDecay);
        assert_eq!(
            param_role("image_encoders.bnw_camera.stem.conv1.weight"),
            ParamRole::Decay
        );
        assert_eq!(
            param_role("image_encoders.bnw_camera.stem.bn1.weight"),
            ParamRole::NoDecay
        );
        assert_eq!(
            param_role("image_encoders.lnd.layer1.0.downsample.bn.running_var"),
            ParamRole::Buffer
        );
    }

    #[test]
    fn test_separate_no_decay() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = candle_nn::linear(3, 4, vb.pp("autoencoder").pp("encoder").pp("proj"))?;
        let _ = candle_nn::linear(4, 3, vb.pp("autoencoder").pp("decoder").pp("proj"))?;
        let _ = vb
            .pp("prior")
            .pp("ln_f")
            .get_with_hints(4, "weight", Init::Const(1.))?;
        let _ = vb.pp("prior_head").get_with_hints((4, 4), "weight", Init::Const(0.))?;

        let ae = separate_no_decay(&varmap, &ParamFilter::under("autoencoder"))?;
        assert_eq!(
            ae.decay.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["autoencoder.decoder.proj.weight", "autoencoder.encoder.proj.weight"]
        );
        assert_eq!(ae.no_decay.len(), 2);

        let filter = ParamFilter::all().exclude("autoencoder").exclude("prior");
        let rest = separate_no_decay(&varmap, &filter)?;
        assert_eq!(rest.names(), vec!["prior_head.weight"]);

        let [decay, no_decay] = ae.into_groups("autoencoder", None);
        assert_eq!(decay.weight_decay, None);
        assert_eq!(no_decay.weight_decay, Some(0.0));
        assert_eq!(no_decay.name, "autoencoder_no_decay");
        Ok(())
    }
}
