use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

pub const MAX_PERIOD: f64 = 10000.;

/// Sinusoidal timestep features, cosine half first then sine half. An odd
/// `dim` gets a trailing zero column.
pub fn timestep_embedding(
  timesteps: &Tensor,
  dim: usize,
  max_period: f64,
) -> Result<Tensor, candle_core::Error> {
  let n = timesteps.dims1()?;
  let device = timesteps.device();
  let half = dim / 2;

  if half == 0 {
    return Tensor::zeros((n, dim), DType::F32, device);
  }

  let freqs = Tensor::arange(0u32, half as u32, device)?
    .to_dtype(DType::F32)?
    .affine(-max_period.ln() / half as f64, 0.)?
    .exp()?;

  let args = timesteps
    .to_dtype(DType::F32)?
    .unsqueeze(1)?
    .broadcast_mul(&freqs.unsqueeze(0)?)?;

  let emb = Tensor::cat(&[args.cos()?, args.sin()?], 1)?;

  if dim % 2 == 1 {
    let pad = Tensor::zeros((n, 1), DType::F32, device)?;
    Tensor::cat(&[emb, pad], 1)
  } else {
    Ok(emb)
  }
}

/// Maps `(n,)` timesteps to `(n, 4 * model_channels)` embeddings shared by
/// every residual unit of both pathways.
#[derive(Debug, Clone)]
pub struct TimeEmbedder {
  linear_1: Linear,
  linear_2: Linear,
  model_channels: usize,
  dtype: DType,
}

impl TimeEmbedder {
  pub fn new(model_channels: usize, vb: VarBuilder) -> Result<Self, candle_core::Error> {
    let time_embed_dim = model_channels * 4;
    let linear_1 = linear(model_channels, time_embed_dim, vb.pp("0"))?;
    let linear_2 = linear(time_embed_dim, time_embed_dim, vb.pp("2"))?;

    Ok(Self {
      linear_1,
      linear_2,
      model_channels,
      dtype: vb.dtype(),
    })
  }
}

impl Module for TimeEmbedder {
  fn forward(&self, timesteps: &Tensor) -> Result<Tensor, candle_core::Error> {
    let emb = timestep_embedding(timesteps, self.model_channels, MAX_PERIOD)?.to_dtype(self.dtype)?;
    let emb = self.linear_1.forward(&emb)?;
    let emb = emb.silu()?;
    self.linear_2.forward(&emb)
  }
}
