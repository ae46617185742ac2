use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::{
  config::SpatialDims,
  error::BackboneError,
  model::layers::{ConvNd, ConvNdConfig, LayerSettings},
  utils::TensorExt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Up,
  Down,
}

fn check_channels(x: &Tensor, channels: usize, op: &str) -> Result<(), candle_core::Error> {
  let got = x.dim(1)?;
  if got != channels {
    return Err(
      candle_core::Error::Msg(format!("{op}: expected {channels} input channels, got {got}")).bt(),
    );
  }

  Ok(())
}

fn resolve_out_channels(
  channels: usize,
  use_conv: bool,
  out_channels: Option<usize>,
) -> crate::Result<usize> {
  let out_channels = out_channels.unwrap_or(channels);
  if !use_conv && out_channels != channels {
    return Err(BackboneError::config(format!(
      "resampling without a convolution cannot change {channels} channels into {out_channels}"
    )));
  }

  Ok(out_channels)
}

/// Nearest-neighbour x2 upsampling with an optional 3x3 convolution.
#[derive(Debug, Clone)]
pub struct Upsample {
  channels: usize,
  out_channels: usize,
  dims: SpatialDims,
  conv: Option<ConvNd>,
}

impl Upsample {
  pub fn new(
    channels: usize,
    use_conv: bool,
    out_channels: Option<usize>,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let out_channels = resolve_out_channels(channels, use_conv, out_channels)?;

    let conv = if use_conv {
      Some(settings.conv(channels, out_channels, ConvNdConfig::new(3), vb.pp("conv"))?)
    } else {
      None
    };

    Ok(Self {
      channels,
      out_channels,
      dims: settings.dims,
      conv,
    })
  }

  pub fn out_channels(&self) -> usize {
    self.out_channels
  }
}

impl Module for Upsample {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    check_channels(x, self.channels, "upsample")?;

    let x = x.upsample_nearest_spatial(self.dims)?;
    match &self.conv {
      Some(conv) => conv.forward(&x),
      None => Ok(x),
    }
  }
}

#[derive(Debug, Clone)]
enum DownsampleOp {
  Conv(ConvNd),
  Pool,
}

/// 2x downsampling by strided 3x3 convolution or average pooling. For 3D
/// maps the depth axis is never strided.
#[derive(Debug, Clone)]
pub struct Downsample {
  channels: usize,
  out_channels: usize,
  dims: SpatialDims,
  op: DownsampleOp,
}

impl Downsample {
  pub fn new(
    channels: usize,
    use_conv: bool,
    out_channels: Option<usize>,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let out_channels = resolve_out_channels(channels, use_conv, out_channels)?;

    let op = if use_conv {
      DownsampleOp::Conv(settings.conv(
        channels,
        out_channels,
        ConvNdConfig::new(3).with_stride(2),
        vb.pp("op"),
      )?)
    } else {
      DownsampleOp::Pool
    };

    Ok(Self {
      channels,
      out_channels,
      dims: settings.dims,
      op,
    })
  }

  pub fn out_channels(&self) -> usize {
    self.out_channels
  }
}

impl Module for Downsample {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    check_channels(x, self.channels, "downsample")?;

    match &self.op {
      DownsampleOp::Conv(conv) => conv.forward(x),
      DownsampleOp::Pool => x.avg_pool_spatial(self.dims),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Resample {
  Up(Upsample),
  Down(Downsample),
}

impl Resample {
  pub fn new(
    direction: Direction,
    channels: usize,
    use_conv: bool,
    out_channels: Option<usize>,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    Ok(match direction {
      Direction::Up => Self::Up(Upsample::new(channels, use_conv, out_channels, settings, vb)?),
      Direction::Down => {
        Self::Down(Downsample::new(channels, use_conv, out_channels, settings, vb)?)
      }
    })
  }
}

impl Module for Resample {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    match self {
      Resample::Up(m) => m.forward(x),
      Resample::Down(m) => m.forward(x),
    }
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  use super::*;
  use crate::config::Precision;

  fn settings(dims: SpatialDims) -> LayerSettings {
    LayerSettings {
      dims,
      precision: Precision::Full,
      norm_groups: 4,
      norm_eps: 1e-5,
    }
  }

  #[test]
  fn conv_downsample_halves_spatial_dims() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let down = Downsample::new(4, true, Some(8), &settings(SpatialDims::Two), vb.pp("d2"))?;
    let x = Tensor::randn(0f32, 1., (2, 4, 16, 16), &dev)?;
    assert_eq!(down.forward(&x)?.dims(), [2, 8, 8, 8]);

    let down = Downsample::new(4, true, None, &settings(SpatialDims::Three), vb.pp("d3"))?;
    let x = Tensor::randn(0f32, 1., (1, 4, 3, 8, 8), &dev)?;
    assert_eq!(down.forward(&x)?.dims(), [1, 4, 3, 4, 4]);
    Ok(())
  }

  #[test]
  fn pooled_downsample_keeps_channels() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let down = Downsample::new(4, false, None, &settings(SpatialDims::One), vb.clone())?;
    let x = Tensor::randn(0f32, 1., (2, 4, 10), &dev)?;
    assert_eq!(down.forward(&x)?.dims(), [2, 4, 5]);
    assert_eq!(down.out_channels(), 4);

    assert!(matches!(
      Downsample::new(4, false, Some(8), &settings(SpatialDims::Two), vb),
      Err(BackboneError::Config(_))
    ));
    Ok(())
  }

  #[test]
  fn upsample_doubles_trailing_axes() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let up = Upsample::new(4, true, Some(2), &settings(SpatialDims::Two), vb.pp("u2"))?;
    let x = Tensor::randn(0f32, 1., (1, 4, 5, 7), &dev)?;
    assert_eq!(up.forward(&x)?.dims(), [1, 2, 10, 14]);

    let up = Upsample::new(4, false, None, &settings(SpatialDims::Three), vb.pp("u3"))?;
    let x = Tensor::randn(0f32, 1., (1, 4, 3, 2, 2), &dev)?;
    assert_eq!(up.forward(&x)?.dims(), [1, 4, 3, 4, 4]);
    Ok(())
  }

  #[test]
  fn channel_mismatch_is_rejected() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let up = Resample::new(Direction::Up, 4, false, None, &settings(SpatialDims::Two), vb)?;
    let x = Tensor::randn(0f32, 1., (1, 3, 4, 4), &dev)?;
    assert!(up.forward(&x).is_err());
    Ok(())
  }
}
