use candle_core::{Module, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use super::{Direction, Resample};
use crate::{
  model::layers::{ConvNd, ConvNdConfig, LayerSettings, Normalization},
  utils::TensorExt,
};

/// How the timestep embedding enters the residual branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditioning {
  /// `h + proj(emb)` before the output normalization.
  Additive,
  /// `norm(h) * (1 + scale) + shift`, FiLM style.
  ScaleShift,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResBlockConfig {
  pub out_channels: Option<usize>,
  pub dropout: f32,
  pub conditioning: Conditioning,
  pub resample: Option<Direction>,
  /// 3x3 instead of 1x1 convolution on a channel-changing skip path.
  pub use_conv_skip: bool,
}

impl Default for ResBlockConfig {
  fn default() -> Self {
    Self {
      out_channels: None,
      dropout: 0.,
      conditioning: Conditioning::Additive,
      resample: None,
      use_conv_skip: false,
    }
  }
}

/// Residual unit conditioned on the timestep embedding, optionally
/// resampling both of its paths.
#[derive(Debug, Clone)]
pub struct ResBlock {
  in_norm: Normalization,
  in_conv: ConvNd,
  updown: Option<Resample>,
  emb_proj: Linear,
  out_norm: Normalization,
  dropout: Dropout,
  out_conv: ConvNd,
  skip_connection: Option<ConvNd>,
  conditioning: Conditioning,
  span: tracing::Span,
}

impl ResBlock {
  pub fn new(
    channels: usize,
    emb_channels: usize,
    config: ResBlockConfig,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let out_channels = config.out_channels.unwrap_or(channels);

    let in_norm = settings.norm(channels, vb.pp("in_layers.0"))?;
    let in_conv = settings.conv(
      channels,
      out_channels,
      ConvNdConfig::new(3),
      vb.pp("in_layers.2"),
    )?;

    // parameter free, shared by the residual and skip paths
    let updown = match config.resample {
      Some(direction) => Some(Resample::new(
        direction,
        channels,
        false,
        None,
        settings,
        vb.clone(),
      )?),
      None => None,
    };

    let emb_width = match config.conditioning {
      Conditioning::Additive => out_channels,
      Conditioning::ScaleShift => 2 * out_channels,
    };
    let emb_proj = linear(emb_channels, emb_width, vb.pp("emb_layers.1"))?;

    let out_norm = settings.norm(out_channels, vb.pp("out_layers.0"))?;
    let out_conv = settings.conv(
      out_channels,
      out_channels,
      ConvNdConfig::new(3).zeroed(),
      vb.pp("out_layers.3"),
    )?;

    let skip_connection = if out_channels == channels {
      None
    } else {
      let kernel_size = if config.use_conv_skip { 3 } else { 1 };
      Some(settings.conv(
        channels,
        out_channels,
        ConvNdConfig::new(kernel_size),
        vb.pp("skip_connection"),
      )?)
    };

    Ok(Self {
      in_norm,
      in_conv,
      updown,
      emb_proj,
      out_norm,
      dropout: Dropout::new(config.dropout),
      out_conv,
      skip_connection,
      conditioning: config.conditioning,
      span: tracing::span!(tracing::Level::TRACE, "resblock"),
    })
  }

  /// The identity side of the block: resampling then, when channels change,
  /// the learned skip convolution.
  pub fn skip_path(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let x = match &self.updown {
      Some(updown) => updown.forward(x)?,
      None => x.clone(),
    };

    match &self.skip_connection {
      Some(conv) => conv.forward(&x),
      None => Ok(x),
    }
  }

  pub fn forward_t(
    &self,
    x: &Tensor,
    emb: &Tensor,
    train: bool,
  ) -> Result<Tensor, candle_core::Error> {
    let _enter = self.span.enter();

    let h = self.in_norm.forward(x)?.silu()?;
    let h = match &self.updown {
      Some(updown) => updown.forward(&h)?,
      None => h,
    };
    let h = self.in_conv.forward(&h)?;

    let emb_out = self
      .emb_proj
      .forward(&emb.silu()?)?
      .to_dtype(h.dtype())?
      .append_singleton_dims(h.rank())?;

    let h = match self.conditioning {
      Conditioning::Additive => self.out_norm.forward(&h.broadcast_add(&emb_out)?)?,
      Conditioning::ScaleShift => {
        let (scale, shift) = match emb_out.chunk(2, 1)?.as_slice() {
          [scale, shift] => (scale.clone(), shift.clone()),
          _ => {
            return Err(
              candle_core::Error::Msg("scale-shift embedding must split in two".to_owned()).bt(),
            )
          }
        };

        self
          .out_norm
          .forward(&h)?
          .broadcast_mul(&scale.affine(1., 1.)?)?
          .broadcast_add(&shift)?
      }
    };

    let h = self.dropout.forward(&h.silu()?, train)?;
    let h = self.out_conv.forward(&h)?;

    self.skip_path(x)? + h
  }

  pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor, candle_core::Error> {
    self.forward_t(x, emb, false)
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  use super::*;
  use crate::config::{Precision, SpatialDims};

  fn settings(dims: SpatialDims) -> LayerSettings {
    LayerSettings {
      dims,
      precision: Precision::Full,
      norm_groups: 4,
      norm_eps: 1e-5,
    }
  }

  fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
  }

  /// The block's arithmetic spelled out layer by layer for 2D inputs with a
  /// channel-changing skip.
  fn expected_forward(block: &ResBlock, x: &Tensor, emb: &Tensor) -> candle_core::Result<Tensor> {
    let resample = |t: &Tensor| match &block.updown {
      Some(updown) => updown.forward(t),
      None => Ok(t.clone()),
    };

    let h = block.in_norm.forward(x)?.silu()?;
    let h = block.in_conv.forward(&resample(&h)?)?;
    let (b, c) = (h.dim(0)?, h.dim(1)?);

    let e = block.emb_proj.forward(&emb.silu()?)?;
    let h = match block.conditioning {
      Conditioning::Additive => {
        let e = e.reshape((b, c, 1, 1))?;
        block.out_norm.forward(&h.broadcast_add(&e)?)?
      }
      Conditioning::ScaleShift => {
        let scale = e.narrow(1, 0, c)?.reshape((b, c, 1, 1))?;
        let shift = e.narrow(1, c, c)?.reshape((b, c, 1, 1))?;
        block
          .out_norm
          .forward(&h)?
          .broadcast_mul(&(scale + 1.0)?)?
          .broadcast_add(&shift)?
      }
    };
    let h = block.out_conv.forward(&h.silu()?)?;

    let skip = match &block.skip_connection {
      Some(conv) => conv.forward(&resample(x)?)?,
      None => resample(x)?,
    };
    skip + h
  }

  #[test]
  fn fresh_block_reduces_to_skip_path() -> crate::Result<()> {
    let dev = Device::Cpu;
    let emb = Tensor::randn(0f32, 1., (2, 32), &dev)?;

    let cases = [
      (8, None, Conditioning::Additive, None),
      (8, Some(16), Conditioning::Additive, None),
      (8, Some(16), Conditioning::ScaleShift, None),
      (8, None, Conditioning::ScaleShift, Some(Direction::Down)),
      (8, Some(4), Conditioning::Additive, Some(Direction::Up)),
    ];

    for (i, (channels, out_channels, conditioning, resample)) in cases.into_iter().enumerate() {
      let varmap = VarMap::new();
      let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
      let config = ResBlockConfig {
        out_channels,
        conditioning,
        resample,
        ..Default::default()
      };
      let block = ResBlock::new(channels, 32, config, &settings(SpatialDims::Two), vb.pp(i))?;

      let x = Tensor::randn(0f32, 1., (2, channels, 8, 8), &dev)?;
      let y = block.forward(&x, &emb)?;
      let skip = block.skip_path(&x)?;

      assert_eq!(y.dims(), skip.dims());
      assert_eq!(y.dim(1)?, out_channels.unwrap_or(channels));
      assert!(max_abs_diff(&y, &skip)? < 1e-6, "case {i}");
    }

    Ok(())
  }

  #[test]
  fn resampling_changes_spatial_size() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let emb = Tensor::randn(0f32, 1., (1, 16), &dev)?;

    let down = ResBlock::new(
      4,
      16,
      ResBlockConfig {
        resample: Some(Direction::Down),
        ..Default::default()
      },
      &settings(SpatialDims::One),
      vb.pp("down"),
    )?;
    let x = Tensor::randn(0f32, 1., (1, 4, 12), &dev)?;
    assert_eq!(down.forward(&x, &emb)?.dims(), [1, 4, 6]);

    let up = ResBlock::new(
      4,
      16,
      ResBlockConfig {
        resample: Some(Direction::Up),
        use_conv_skip: true,
        out_channels: Some(8),
        ..Default::default()
      },
      &settings(SpatialDims::Three),
      vb.pp("up"),
    )?;
    let x = Tensor::randn(0f32, 1., (1, 4, 2, 3, 3), &dev)?;
    assert_eq!(up.forward(&x, &emb)?.dims(), [1, 8, 2, 6, 6]);
    Ok(())
  }

  #[test]
  fn trained_output_conv_moves_away_from_skip() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let block = ResBlock::new(
      4,
      16,
      ResBlockConfig {
        conditioning: Conditioning::ScaleShift,
        ..Default::default()
      },
      &settings(SpatialDims::Two),
      vb,
    )?;

    {
      let data = varmap.data().lock().unwrap();
      let weight = &data["out_layers.3.weight"];
      weight.set(&Tensor::ones(weight.dims(), DType::F32, &dev)?)?;
    }

    let x = Tensor::randn(0f32, 1., (1, 4, 4, 4), &dev)?;
    let emb = Tensor::randn(0f32, 1., (1, 16), &dev)?;
    let y = block.forward(&x, &emb)?;
    assert!(max_abs_diff(&y, &block.skip_path(&x)?)? > 1e-3);
    Ok(())
  }

  #[test]
  fn downsampling_block_matches_layerwise_arithmetic() -> crate::Result<()> {
    let dev = Device::Cpu;
    let emb = Tensor::randn(0f32, 1., (2, 16), &dev)?;
    let x = Tensor::randn(0f32, 1., (2, 8, 8, 8), &dev)?;

    for conditioning in [Conditioning::Additive, Conditioning::ScaleShift] {
      let varmap = VarMap::new();
      let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
      let config = ResBlockConfig {
        out_channels: Some(4),
        conditioning,
        resample: Some(Direction::Down),
        ..Default::default()
      };
      let block = ResBlock::new(8, 16, config, &settings(SpatialDims::Two), vb)?;

      {
        let data = varmap.data().lock().unwrap();
        for name in ["out_layers.3.weight", "out_layers.3.bias"] {
          let var = &data[name];
          var.set(&Tensor::randn(0f32, 0.5, var.dims(), &dev)?)?;
        }
      }

      let y = block.forward(&x, &emb)?;
      let expected = expected_forward(&block, &x, &emb)?;

      assert_eq!(y.dims(), [2, 4, 4, 4]);
      assert!(max_abs_diff(&y, &expected)? < 1e-5, "{conditioning:?}");
      assert!(max_abs_diff(&y, &block.skip_path(&x)?)? > 1e-3, "{conditioning:?}");
    }

    Ok(())
  }
}
