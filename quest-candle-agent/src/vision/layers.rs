//! Building blocks of the convolutional backbone.
use crate::util::softmax_last_dim;
use anyhow::Result;
use candle_core::{Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Linear, VarBuilder,
};

/// Output length of a convolution with kernel 3, padding 1 and the given stride,
/// which is also that of the 7x7 stem convolution with padding 3.
pub(super) fn conv_out(len: usize, stride: usize) -> usize {
    (len.max(1) - 1) / stride + 1
}

fn conv3x3(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    Ok(conv2d_no_bias(c_in, c_out, 3, config, vb)?)
}

/// Max pooling with kernel 3 and padding 1.
///
/// Written with differentiable ops since the backward pass of candle's pooling
/// requires the kernel to equal the stride. Inputs are non-negative, so zero
/// padding is equivalent to padding with `-inf`.
pub(super) fn max_pool3x3(x: &Tensor, stride: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let padded = x.pad_with_zeros(2, 1, 1)?.pad_with_zeros(3, 1, 1)?;
    let mut y = padded.narrow(2, 0, h)?.narrow(3, 0, w)?;
    for (i, j) in (0..3).flat_map(|i| (0..3).map(move |j| (i, j))).skip(1) {
        y = y.maximum(&padded.narrow(2, i, h)?.narrow(3, j, w)?)?;
    }
    if stride == 1 {
        return Ok(y);
    }

    let (h2, w2) = (conv_out(h, 2), conv_out(w, 2));
    let y = y
        .pad_with_zeros(2, 0, 2 * h2 - h)?
        .pad_with_zeros(3, 0, 2 * w2 - w)?
        .reshape((b, c, h2, 2, w2, 2))?
        .narrow(3, 0, 1)?
        .narrow(5, 0, 1)?;
    Ok(y.reshape((b, c, h2, w2))?)
}

/// Stem of ResNet-18: conv1, bn1, relu and maxpool.
pub(super) struct Stem {
    conv1: Conv2d,
    bn1: BatchNorm,
    stride: usize,
}

impl Stem {
    pub fn new(c_in: usize, no_stride: bool, vb: VarBuilder) -> Result<Self> {
        let stride = if no_stride { 1 } else { 2 };
        let config = Conv2dConfig {
            padding: 3,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d_no_bias(c_in, 64, 7, config, vb.pp("conv1"))?,
            bn1: batch_norm(64, BatchNormConfig::default(), vb.pp("bn1"))?,
            stride,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.bn1.forward_t(&self.conv1.forward(x)?, train)?.relu()?;
        max_pool3x3(&h, self.stride)
    }
}

/// Basic residual block of ResNet-18.
pub(super) struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    pub fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let downsample = match stride != 1 || c_in != c_out {
            true => {
                let config = Conv2dConfig {
                    stride,
                    ..Default::default()
                };
                let vb = vb.pp("downsample");
                Some((
                    conv2d_no_bias(c_in, c_out, 1, config, vb.pp("conv"))?,
                    batch_norm(c_out, BatchNormConfig::default(), vb.pp("bn"))?,
                ))
            }
            false => None,
        };

        Ok(Self {
            conv1: conv3x3(c_in, c_out, stride, vb.pp("conv1"))?,
            bn1: batch_norm(c_out, BatchNormConfig::default(), vb.pp("bn1"))?,
            conv2: conv3x3(c_out, c_out, 1, vb.pp("conv2"))?,
            bn2: batch_norm(c_out, BatchNormConfig::default(), vb.pp("bn2"))?,
            downsample,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.bn1.forward_t(&self.conv1.forward(x)?, train)?.relu()?;
        let h = self.bn2.forward_t(&self.conv2.forward(&h)?, train)?;
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(x)?, train)?,
            None => x.clone(),
        };
        Ok((h + identity)?.relu()?)
    }
}

/// Feature-wise linear modulation conditioned on a language vector.
pub(super) struct Film {
    proj: Linear,
    channels: usize,
}

impl Film {
    pub fn new(language_dim: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: linear(language_dim, 2 * channels, vb)?,
            channels,
        })
    }

    /// `h` of shape `(b, c, h, w)`, `lang` of shape `(b, language_dim)`.
    pub fn forward(&self, h: &Tensor, lang: &Tensor) -> Result<Tensor> {
        let b = h.dims()[0];
        let c = self.channels;
        let p = self.proj.forward(lang)?.reshape((b, 2 * c, 1, 1))?;
        let beta = p.narrow(1, 0, c)?;
        let gamma = p.narrow(1, c, c)?;
        Ok(h.broadcast_mul(&(gamma + 1.0)?)?.broadcast_add(&beta)?)
    }
}

/// Spatial softmax followed by a linear layer.
///
/// Every keypoint is the expected `(x, y)` position in `[-1, 1]^2` under a softmax
/// over the spatial positions of one heatmap.
pub(super) struct SpatialProjection {
    spatial_conv: Option<Conv2d>,
    pos_x: Tensor,
    pos_y: Tensor,
    projection: Linear,
}

fn linspace(n: usize) -> Vec<f32> {
    match n {
        1 => vec![-1.0],
        _ => (0..n)
            .map(|i| -1.0 + 2.0 * i as f32 / (n - 1) as f32)
            .collect(),
    }
}

impl SpatialProjection {
    pub fn new(
        (c, h, w): (usize, usize, usize),
        out_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_kp = (out_dim / 2).max(1);
        let spatial_conv = match num_kp != c {
            true => Some(conv2d(
                c,
                num_kp,
                1,
                Default::default(),
                vb.pp("spatial_conv"),
            )?),
            false => None,
        };
        let (xs, ys) = (linspace(w), linspace(h));
        let pos_x = (0..h).flat_map(|_| xs.iter().copied()).collect::<Vec<_>>();
        let pos_y = ys
            .iter()
            .flat_map(|y| std::iter::repeat(*y).take(w))
            .collect::<Vec<_>>();

        Ok(Self {
            spatial_conv,
            pos_x: Tensor::from_vec(pos_x, (1, h * w), vb.device())?,
            pos_y: Tensor::from_vec(pos_y, (1, h * w), vb.device())?,
            projection: linear(2 * num_kp, out_dim, vb.pp("projection"))?,
        })
    }

    /// Returns the keypoints `(b, 2 * num_kp)`, x coordinates first.
    pub fn keypoints(&self, x: &Tensor) -> Result<Tensor> {
        let h = match &self.spatial_conv {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        let (b, k, hh, ww) = h.dims4()?;
        let att = softmax_last_dim(&h.reshape((b * k, hh * ww))?)?;
        let kp_x = att.broadcast_mul(&self.pos_x)?.sum(1)?.reshape((b, k))?;
        let kp_y = att.broadcast_mul(&self.pos_y)?.sum(1)?.reshape((b, k))?;
        Ok(Tensor::cat(&[kp_x, kp_y], 1)?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.projection.forward(&self.keypoints(x)?)?)
    }
}

/// Fixed 2D sinusoidal encoding of shape `(1, channels, h, w)`.
///
/// The first half of the channels encodes the row, the second half the column,
/// each with interleaved sine and cosine.
pub(super) fn sinusoidal_2d(channels: usize, h: usize, w: usize, device: &Device) -> Result<Tensor> {
    let ch = 2 * ((channels + 3) / 4);
    let inv_freq = (0..ch)
        .step_by(2)
        .map(|i| 1.0 / 10000f32.powf(i as f32 / ch as f32))
        .collect::<Vec<_>>();
    let emb = |pos: usize| -> Vec<f32> {
        inv_freq
            .iter()
            .flat_map(|f| {
                let a = pos as f32 * f;
                [a.sin(), a.cos()]
            })
            .collect()
    };

    let mut data = vec![0f32; channels * h * w];
    for x in 0..h {
        let ex = emb(x);
        for y in 0..w {
            let ey = emb(y);
            for (c, v) in ex.iter().chain(ey.iter()).take(channels).enumerate() {
                data[c * h * w + x * w + y] = *v;
            }
        }
    }
    Ok(Tensor::from_vec(data, (1, channels, h, w), device)?)
}
