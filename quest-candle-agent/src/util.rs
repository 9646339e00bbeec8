//! Utilities.
use anyhow::{anyhow, Result};
use candle_core::{Tensor, WithDType, D};
use candle_nn::VarMap;
use log::debug;
use ndarray::Array3;
use quest_core::{
    error::QuestError,
    record::{Record, RecordValue},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
mod partition;
pub use partition::{param_role, separate_no_decay, ParamFilter, ParamRole, PartitionedParams};

/// Loss comparing predicted and ground-truth actions.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum ActionLoss {
    /// Mean absolute error.
    L1,

    /// Mean squared error.
    Mse,
}

impl ActionLoss {
    /// Computes the loss averaged over all elements.
    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Self::L1 => Ok((pred - target)?.abs()?.mean_all()?),
            Self::Mse => Ok(candle_nn::loss::mse(pred, target)?),
        }
    }
}

/// Softmax over the last dimension, written with primitive ops so that it is
/// differentiable.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    Ok(exp.broadcast_div(&sum)?)
}

/// Checks the dimensions of a tensor.
pub fn check_dims(what: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    match t.dims() == expected {
        true => Ok(()),
        false => Err(QuestError::shape(what, expected, t.dims()).into()),
    }
}

/// Returns the standard deviation of a tensor.
pub fn std(t: &Tensor) -> Result<f32> {
    Ok(t.broadcast_sub(&t.mean_all()?)?
        .powf(2f64)?
        .mean_all()?
        .sqrt()?
        .to_vec0::<f32>()?)
}

/// Returns the mean and standard deviation of the parameters.
pub fn param_stats(varmap: &VarMap) -> Result<Record> {
    let mut record = Record::empty();
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock is poisoned"))?;

    for (k, v) in data.iter() {
        let m: f32 = v.mean_all()?.to_vec0()?;
        record.insert(format!("{}_mean", &k), RecordValue::Scalar(m));
        record.insert(format!("{}_std", &k), RecordValue::Scalar(std(v.as_tensor())?));
    }

    Ok(record)
}

/// Copies pretrained tensors into the variables under `prefix`.
///
/// Tensor `k` goes to the variable `{prefix}.{k}`. Tensors without a matching variable
/// are skipped. Every variable under one of the `required` segments, relative to
/// `prefix`, must be present in `tensors`. Returns the number of copied tensors.
pub fn copy_pretrained(
    varmap: &VarMap,
    prefix: &str,
    tensors: &HashMap<String, Tensor>,
    required: &[&str],
) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock is poisoned"))?;
    let mut n = 0;

    for (k, t) in tensors.iter() {
        let name = format!("{}.{}", prefix, k);
        match data.get(&name) {
            Some(var) => {
                if var.dims() != t.dims() {
                    return Err(QuestError::shape(name, var.dims(), t.dims()).into());
                }
                var.set(&t.to_device(var.device())?.to_dtype(var.dtype())?)?;
                n += 1;
            }
            None => debug!("Skip pretrained tensor {}", k),
        }
    }

    let filters = required
        .iter()
        .map(|s| ParamFilter::under(format!("{}.{}", prefix, s)))
        .collect::<Vec<_>>();
    for name in data.keys().filter(|k| filters.iter().any(|f| f.accepts(k))) {
        let k = name
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix('.'))
            .unwrap_or(name);
        if !tensors.contains_key(k) {
            return Err(QuestError::config(format!("pretrained weights lack {}", k)).into());
        }
    }

    Ok(n)
}

/// Converts a rank-3 tensor into [`Array3`].
pub fn tensor_to_array3<T: WithDType>(t: &Tensor) -> Result<Array3<T>> {
    let (d0, d1, d2) = t.dims3()?;
    let v: Vec<T> = t.flatten_all()?.to_vec1()?;
    Ok(Array3::from_shape_vec((d0, d1, d2), v)?)
}
