use candle_core::{DType, Module, Tensor};
use candle_nn::{ops::softmax_last_dim, VarBuilder};

use crate::{
  error::BackboneError,
  model::layers::{ConvNd, LayerSettings, Normalization, WeightInit},
  utils::TensorExt,
};

/// Channel layout of the fused qkv projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOrder {
  /// `[head][q|k|v][c]`: heads are split off before q, k and v.
  HeadsFirst,
  /// `[q|k|v][head][c]`: q, k and v are separated before the heads.
  QkvFirst,
}

impl HeadOrder {
  pub fn from_flag(use_new_attention_order: bool) -> Self {
    if use_new_attention_order {
      Self::QkvFirst
    } else {
      Self::HeadsFirst
    }
  }
}

/// Number of heads for `channels`, either fixed or derived from a per-head
/// width.
pub fn resolve_heads(
  channels: usize,
  num_heads: usize,
  num_head_channels: Option<usize>,
) -> crate::Result<usize> {
  match num_head_channels {
    Some(width) => {
      if width == 0 || channels % width != 0 {
        return Err(BackboneError::config(format!(
          "q,k,v channels {channels} is not divisible by num_head_channels {width}"
        )));
      }
      Ok(channels / width)
    }
    None => {
      if num_heads == 0 || channels % num_heads != 0 {
        return Err(BackboneError::config(format!(
          "q,k,v channels {channels} cannot be split into {num_heads} heads"
        )));
      }
      Ok(num_heads)
    }
  }
}

/// Multi-head attention over a fused `(b, 3 * heads * ch, t)` projection,
/// returning `(b, heads * ch, t)`.
///
/// q and k are each scaled by `ch^-1/4` before the product, which equals
/// dividing the scores by `sqrt(ch)` but stays in range for f16. The
/// softmax always runs in f32.
pub fn qkv_attention(
  qkv: &Tensor,
  num_heads: usize,
  order: HeadOrder,
) -> Result<Tensor, candle_core::Error> {
  let (b, width, t) = qkv.dims3()?;
  if num_heads == 0 || width % (3 * num_heads) != 0 {
    return Err(
      candle_core::Error::Msg(format!(
        "qkv width {width} is not divisible by 3 * {num_heads} heads"
      ))
      .bt(),
    );
  }
  let ch = width / (3 * num_heads);

  let (q, k, v) = match order {
    HeadOrder::HeadsFirst => {
      let qkv = qkv.reshape((b * num_heads, 3 * ch, t))?;
      (qkv.narrow(1, 0, ch)?, qkv.narrow(1, ch, ch)?, qkv.narrow(1, 2 * ch, ch)?)
    }
    HeadOrder::QkvFirst => {
      let part = |i: usize| {
        qkv
          .narrow(1, i * num_heads * ch, num_heads * ch)?
          .reshape((b * num_heads, ch, t))
      };
      (part(0)?, part(1)?, part(2)?)
    }
  };

  let scale = 1. / (ch as f64).sqrt().sqrt();
  let q = q.affine(scale, 0.)?;
  let k = k.affine(scale, 0.)?;

  // (bh, t, s)
  let weight = q.transpose(1, 2)?.contiguous()?.matmul(&k.contiguous()?)?;
  let dtype = weight.dtype();
  let weight = softmax_last_dim(&weight.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

  // (bh, ch, t)
  let a = v.contiguous()?.matmul(&weight.transpose(1, 2)?.contiguous()?)?;
  a.reshape((b, num_heads * ch, t))
}

/// Self-attention across all spatial positions of a feature map, added
/// back onto its input.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
  channels: usize,
  num_heads: usize,
  order: HeadOrder,
  norm: Normalization,
  qkv: ConvNd,
  proj_out: ConvNd,
  span: tracing::Span,
}

impl AttentionBlock {
  pub fn new(
    channels: usize,
    num_heads: usize,
    num_head_channels: Option<usize>,
    order: HeadOrder,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let num_heads = resolve_heads(channels, num_heads, num_head_channels)?;

    let norm = settings.norm(channels, vb.pp("norm"))?;
    let qkv = settings.conv1x1_flat(channels, channels * 3, WeightInit::Default, vb.pp("qkv"))?;
    let proj_out = settings.conv1x1_flat(channels, channels, WeightInit::Zero, vb.pp("proj_out"))?;

    Ok(Self {
      channels,
      num_heads,
      order,
      norm,
      qkv,
      proj_out,
      span: tracing::span!(tracing::Level::TRACE, "attention"),
    })
  }

  /// Multiply-accumulates of the two attention matmuls for an input of
  /// `shape` (`b, c, *spatial`).
  pub fn count_flops(shape: &[usize]) -> u64 {
    let [b, c, spatial @ ..] = shape else {
      return 0;
    };
    let t = spatial.iter().product::<usize>() as u64;
    2 * (*b as u64) * t * t * (*c as u64)
  }
}

impl Module for AttentionBlock {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let _enter = self.span.enter();

    let got = x.dim(1)?;
    if got != self.channels {
      return Err(
        candle_core::Error::Msg(format!(
          "attention: expected {} channels, got {got}",
          self.channels
        ))
        .bt(),
      );
    }

    let spatial = x.spatial_dims().to_vec();
    let x = x.flatten_spatial()?;

    let qkv = self.qkv.forward(&self.norm.forward(&x)?)?;
    let h = qkv_attention(&qkv, self.num_heads, self.order)?;
    let h = self.proj_out.forward(&h)?;

    (x + h)?.unflatten_spatial(&spatial)
  }
}
