//! Quantizers of the autoencoder bottleneck.
use super::QuantizerConfig;
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss::mse, Init, VarBuilder};

/// Output of [`Quantizer::quantize`].
pub struct QuantizerOutput {
    /// Quantized latent vectors, `(batch, len, latent_dim)`.
    ///
    /// Gradients pass to the unquantized input with the straight-through estimator.
    pub codes: Tensor,

    /// Flattened indices, `(batch, len)` of `u32`.
    pub indices: Tensor,

    /// Auxiliary loss, one element per codebook.
    pub aux_loss: Tensor,
}

/// Returns `x` in the forward pass and the gradient of `z` in the backward pass.
fn straight_through(z: &Tensor, x: &Tensor) -> Result<Tensor> {
    Ok((z + (x - z)?.detach())?)
}

/// Mixed-radix conversion between per-digit and flattened indices.
struct Radix {
    levels: Tensor,
    basis: Tensor,
}

impl Radix {
    fn new(levels: &[usize], device: &Device) -> Result<Self> {
        let basis = levels
            .iter()
            .scan(1usize, |acc, l| {
                let b = *acc;
                *acc *= l;
                Some(b as f32)
            })
            .collect::<Vec<_>>();
        let levels = levels.iter().map(|l| *l as f32).collect::<Vec<_>>();
        Ok(Self {
            levels: Tensor::new(levels, device)?,
            basis: Tensor::new(basis, device)?,
        })
    }

    /// `(.., n)` digits as f32 -> `(..)` u32 indices.
    fn flatten(&self, digits: &Tensor) -> Result<Tensor> {
        Ok(digits
            .broadcast_mul(&self.basis)?
            .sum(D::Minus1)?
            .round()?
            .to_dtype(DType::U32)?)
    }

    /// `(..)` u32 indices -> `(.., n)` digits as f32.
    fn unflatten(&self, indices: &Tensor) -> Result<Tensor> {
        let x = indices
            .to_dtype(DType::F32)?
            .unsqueeze(indices.rank())?
            .broadcast_div(&self.basis)?
            .floor()?;
        let q = x.broadcast_div(&self.levels)?.floor()?;
        Ok((x - q.broadcast_mul(&self.levels)?)?)
    }
}

/// Finite scalar quantization.
pub struct Fsq {
    levels: Vec<usize>,
    half_l: Tensor,
    offset: Tensor,
    shift: Tensor,
    half_width: Tensor,
    radix: Radix,
}

impl Fsq {
    const EPS: f64 = 1e-3;

    fn new(levels: &[usize], device: &Device) -> Result<Self> {
        let half_l = levels
            .iter()
            .map(|l| (*l as f64 - 1.0) * (1.0 - Self::EPS) / 2.0)
            .collect::<Vec<_>>();
        let offset = levels
            .iter()
            .map(|l| if l % 2 == 0 { 0.5 } else { 0.0 })
            .collect::<Vec<f64>>();
        let shift = offset
            .iter()
            .zip(half_l.iter())
            .map(|(o, h)| (o / h).atanh())
            .collect::<Vec<_>>();
        let half_width = levels.iter().map(|l| (l / 2) as f32).collect::<Vec<_>>();
        let to_tensor = |v: Vec<f64>| -> Result<Tensor> {
            Ok(Tensor::new(v.into_iter().map(|x| x as f32).collect::<Vec<_>>(), device)?)
        };

        Ok(Self {
            levels: levels.to_vec(),
            half_l: to_tensor(half_l)?,
            offset: to_tensor(offset)?,
            shift: to_tensor(shift)?,
            half_width: Tensor::new(half_width, device)?,
            radix: Radix::new(levels, device)?,
        })
    }

    fn bound(&self, z: &Tensor) -> Result<Tensor> {
        Ok(z
            .broadcast_add(&self.shift)?
            .tanh()?
            .broadcast_mul(&self.half_l)?
            .broadcast_sub(&self.offset)?)
    }

    fn quantize(&self, z: &Tensor) -> Result<QuantizerOutput> {
        let bounded = self.bound(z)?;
        let rounded = straight_through(&bounded, &bounded.round()?)?;
        let codes = rounded.broadcast_div(&self.half_width)?;
        let digits = rounded.detach().broadcast_add(&self.half_width)?;

        Ok(QuantizerOutput {
            codes,
            indices: self.radix.flatten(&digits)?,
            aux_loss: Tensor::zeros(1, DType::F32, z.device())?,
        })
    }

    fn indices_to_codes(&self, indices: &Tensor) -> Result<Tensor> {
        let digits = self.radix.unflatten(indices)?;
        Ok(digits
            .broadcast_sub(&self.half_width)?
            .broadcast_div(&self.half_width)?)
    }
}

/// Vector quantization with one learned codebook per group.
pub struct Vq {
    codebooks: Vec<Tensor>,
    dim: usize,
    beta: f64,
    radix: Radix,
}

impl Vq {
    fn new(codebook_size: usize, n_groups: usize, dim: usize, beta: f64, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / codebook_size as f64;
        let codebooks = (0..n_groups)
            .map(|g| {
                Ok(vb.get_with_hints(
                    (codebook_size, dim),
                    &format!("codebook{}", g),
                    Init::Uniform {
                        lo: -bound,
                        up: bound,
                    },
                )?)
            })
            .collect::<Result<Vec<_>>>()?;
        let radix = Radix::new(&vec![codebook_size; n_groups], vb.device())?;

        Ok(Self {
            codebooks,
            dim,
            beta,
            radix,
        })
    }

    /// Returns `(quantized, indices, aux_loss)` of one group, `z` of shape `(n, dim)`.
    fn quantize_group(&self, z: &Tensor, codebook: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let dist = z
            .sqr()?
            .sum_keepdim(1)?
            .broadcast_sub(&(z.matmul(&codebook.t()?)? * 2.0)?)?
            .broadcast_add(&codebook.sqr()?.sum(1)?.unsqueeze(0)?)?;
        let indices = dist.argmin(1)?;
        let q = codebook.index_select(&indices, 0)?;

        let codebook_loss = mse(&q, &z.detach())?;
        let commitment_loss = mse(&q.detach(), z)?;
        let aux_loss = (codebook_loss + (commitment_loss * self.beta)?)?;

        Ok((straight_through(z, &q)?, indices, aux_loss))
    }

    fn quantize(&self, z: &Tensor) -> Result<QuantizerOutput> {
        let (b, l, _) = z.dims3()?;
        let mut codes = vec![];
        let mut digits = vec![];
        let mut aux_loss = vec![];

        for (g, codebook) in self.codebooks.iter().enumerate() {
            let zg = z
                .narrow(D::Minus1, g * self.dim, self.dim)?
                .reshape((b * l, self.dim))?;
            let (q, ix, loss) = self.quantize_group(&zg, codebook)?;
            codes.push(q.reshape((b, l, self.dim))?);
            digits.push(ix.to_dtype(DType::F32)?.reshape((b, l))?);
            aux_loss.push(loss);
        }

        Ok(QuantizerOutput {
            codes: Tensor::cat(&codes, D::Minus1)?,
            indices: self.radix.flatten(&Tensor::stack(&digits, D::Minus1)?)?,
            aux_loss: Tensor::stack(&aux_loss, 0)?,
        })
    }

    fn indices_to_codes(&self, indices: &Tensor) -> Result<Tensor> {
        let (b, l) = indices.dims2()?;
        let digits = self.radix.unflatten(indices)?.to_dtype(DType::U32)?;
        let codes = self
            .codebooks
            .iter()
            .enumerate()
            .map(|(g, codebook)| {
                let ix = digits.narrow(D::Minus1, g, 1)?.flatten_all()?;
                Ok(codebook.index_select(&ix, 0)?.reshape((b, l, self.dim))?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&codes, D::Minus1)?)
    }
}

/// Quantizer of the autoencoder bottleneck.
pub enum Quantizer {
    /// Finite scalar quantization.
    Fsq(Fsq),

    /// Vector quantization.
    Vq(Vq),
}

impl Quantizer {
    /// Builds the quantizer. A learned codebook registers its variables under `vb`.
    pub fn build(vb: VarBuilder, config: &QuantizerConfig) -> Result<Self> {
        config.check()?;
        match config {
            QuantizerConfig::Fsq { levels } => Ok(Self::Fsq(Fsq::new(levels, vb.device())?)),
            QuantizerConfig::Vq {
                codebook_size,
                n_groups,
                dim,
                beta,
            } => Ok(Self::Vq(Vq::new(*codebook_size, *n_groups, *dim, *beta, vb)?)),
        }
    }

    /// Quantizes latent vectors of shape `(batch, len, latent_dim)`.
    pub fn quantize(&self, z: &Tensor) -> Result<QuantizerOutput> {
        match self {
            Self::Fsq(q) => q.quantize(z),
            Self::Vq(q) => q.quantize(z),
        }
    }

    /// Maps flattened indices `(batch, len)` to quantized latent vectors.
    pub fn indices_to_codes(&self, indices: &Tensor) -> Result<Tensor> {
        match self {
            Self::Fsq(q) => q.indices_to_codes(indices),
            Self::Vq(q) => q.indices_to_codes(indices),
        }
    }

    /// Levels of the finite scalar quantizer, `None` for a learned codebook.
    pub fn fsq_levels(&self) -> Option<&[usize]> {
        match self {
            Self::Fsq(q) => Some(&q.levels),
            Self::Vq(_) => None,
        }
    }
}

/// Returns `exp` of the entropy of the empirical distribution of indices.
///
/// It is the effective number of codes in use, between 1 and `codebook_size`.
pub fn perplexity(indices: &[u32], codebook_size: usize) -> f32 {
    if indices.is_empty() {
        return 0.0;
    }
    let mut counts = vec![0usize; codebook_size];
    for i in indices {
        if let Some(c) = counts.get_mut(*i as usize) {
            *c += 1;
        }
    }
    let n = indices.len() as f32;
    let entropy = counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f32 / n;
            -p * p.ln()
        })
        .sum::<f32>();
    entropy.exp()
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_nn::VarMap;

    fn build(config: &QuantizerConfig) -> Result<(VarMap, Quantizer)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let q = Quantizer::build(vb.pp("quantizer"), config)?;
        Ok((varmap, q))
    }

    #[test]
    fn test_fsq_codes_and_indices_agree() -> Result<()> {
        let config = QuantizerConfig::Fsq {
            levels: vec![8, 5, 5, 5],
        };
        let (varmap, q) = build(&config)?;
        assert!(varmap.all_vars().is_empty());

        let z = (Tensor::randn(0f32, 1., (4, 5, 4), &Device::Cpu)? * 3.0)?;
        let out = q.quantize(&z)?;
        assert_eq!(out.codes.dims(), &[4, 5, 4]);
        assert_eq!(out.indices.dims(), &[4, 5]);
        assert_eq!(out.aux_loss.to_vec1::<f32>()?, vec![0.0]);

        let indices: Vec<Vec<u32>> = out.indices.to_vec2()?;
        assert!(indices.iter().flatten().all(|i| *i < 1000));

        // Indices decode to exactly the quantized codes
        let codes = q.indices_to_codes(&out.indices)?;
        let diff: f32 = (codes - &out.codes)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_fsq_levels() -> Result<()> {
        let (_, q) = build(&QuantizerConfig::Fsq { levels: vec![8, 5] })?;
        let z = Tensor::new(&[[[-100f32, -100.], [100., 100.], [0., 0.]]], &Device::Cpu)?;
        let out = q.quantize(&z)?;
        let codes: Vec<Vec<Vec<f32>>> = out.codes.to_vec3()?;
        let close = |a: &[f32], b: &[f32]| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5);

        assert!(close(&codes[0][0], &[-1.0, -1.0]));
        assert!(close(&codes[0][1], &[0.75, 1.0]));
        assert!(close(&codes[0][2], &[0.0, 0.0]));
        assert_eq!(out.indices.to_vec2::<u32>()?[0], vec![0, 39, 20]);
        Ok(())
    }

    #[test]
    fn test_vq() -> Result<()> {
        let config = QuantizerConfig::Vq {
            codebook_size: 16,
            n_groups: 2,
            dim: 3,
            beta: 0.25,
        };
        let (varmap, q) = build(&config)?;
        assert_eq!(varmap.all_vars().len(), 2);

        let z = Tensor::randn(0f32, 1., (2, 4, 6), &Device::Cpu)?;
        let out = q.quantize(&z)?;
        assert_eq!(out.codes.dims(), &[2, 4, 6]);
        assert_eq!(out.aux_loss.dims(), &[2]);
        assert!(out.aux_loss.sum_all()?.to_scalar::<f32>()? > 0.0);

        let codes = q.indices_to_codes(&out.indices)?;
        let diff: f32 = (codes - &out.codes)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
        assert!(diff < 1e-5);

        // The codebook receives gradients through the auxiliary loss
        let grads = out.aux_loss.sum_all()?.backward()?;
        assert!(grads.get(varmap.all_vars()[0].as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity(&[0, 0, 0, 0], 8) - 1.0).abs() < 1e-6);
        assert!((perplexity(&[0, 1, 2, 3], 8) - 4.0).abs() < 1e-4);
        assert_eq!(perplexity(&[], 8), 0.0);
    }
}
