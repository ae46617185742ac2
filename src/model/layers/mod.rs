mod conv3d;

use candle_core::{DType, Module, Tensor};
use candle_nn::{
  init::DEFAULT_KAIMING_NORMAL, Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, GroupNorm, Init,
  VarBuilder,
};

pub use conv3d::*;

use crate::{
  config::{BackboneConfig, Precision, SpatialDims},
  error::BackboneError,
};

/// Settings shared by every layer of a ladder. Convolutions are stored and
/// run at `precision`; normalization always computes in f32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSettings {
  pub dims: SpatialDims,
  pub precision: Precision,
  pub norm_groups: usize,
  pub norm_eps: f64,
}

impl LayerSettings {
  pub fn from_config(config: &BackboneConfig) -> Self {
    Self {
      dims: config.dims,
      precision: config.precision(),
      norm_groups: config.norm_groups,
      norm_eps: config.norm_eps,
    }
  }

  pub fn conv(
    &self,
    in_channels: usize,
    out_channels: usize,
    cfg: ConvNdConfig,
    vb: VarBuilder,
  ) -> crate::Result<ConvNd> {
    let vb = vb.set_dtype(self.precision.dtype());
    Ok(conv_nd(self.dims, in_channels, out_channels, cfg, vb)?)
  }

  /// 1x1 convolution over flattened `(b, c, t)` maps, whatever the ladder
  /// dimensionality.
  pub fn conv1x1_flat(
    &self,
    in_channels: usize,
    out_channels: usize,
    init: WeightInit,
    vb: VarBuilder,
  ) -> crate::Result<ConvNd> {
    let vb = vb.set_dtype(self.precision.dtype());
    let cfg = ConvNdConfig::new(1).with_init(init);
    Ok(conv_nd(SpatialDims::One, in_channels, out_channels, cfg, vb)?)
  }

  pub fn norm(&self, channels: usize, vb: VarBuilder) -> crate::Result<Normalization> {
    Normalization::new(channels, self.norm_groups, self.norm_eps, vb)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
  Default,
  Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvNdConfig {
  pub kernel_size: usize,
  pub padding: usize,
  pub stride: usize,
  pub init: WeightInit,
}

impl ConvNdConfig {
  /// "Same" padding for odd kernels, stride 1.
  pub fn new(kernel_size: usize) -> Self {
    Self {
      kernel_size,
      padding: kernel_size / 2,
      stride: 1,
      init: WeightInit::Default,
    }
  }

  pub fn with_stride(mut self, stride: usize) -> Self {
    self.stride = stride;
    self
  }

  pub fn with_init(mut self, init: WeightInit) -> Self {
    self.init = init;
    self
  }

  pub fn zeroed(self) -> Self {
    self.with_init(WeightInit::Zero)
  }
}

#[derive(Debug, Clone)]
pub enum ConvNd {
  Conv1d(Conv1d),
  Conv2d(Conv2d),
  Conv3d(SlicedConv3d),
}

impl Module for ConvNd {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    match self {
      ConvNd::Conv1d(m) => m.forward(x),
      ConvNd::Conv2d(m) => m.forward(x),
      ConvNd::Conv3d(m) => m.forward(x),
    }
  }
}

pub fn conv_nd(
  dims: SpatialDims,
  in_channels: usize,
  out_channels: usize,
  cfg: ConvNdConfig,
  vb: VarBuilder,
) -> Result<ConvNd, candle_core::Error> {
  let k = cfg.kernel_size;

  let (init_ws, init_bs) = match cfg.init {
    WeightInit::Default => {
      let bound = 1. / (in_channels as f64).sqrt();
      (DEFAULT_KAIMING_NORMAL, Init::Uniform { lo: -bound, up: bound })
    }
    WeightInit::Zero => (Init::Const(0.), Init::Const(0.)),
  };

  let bs = vb.get_with_hints(out_channels, "bias", init_bs)?;

  let conv = match dims {
    SpatialDims::One => {
      let ws = vb.get_with_hints((out_channels, in_channels, k), "weight", init_ws)?;
      let conv_cfg = Conv1dConfig {
        padding: cfg.padding,
        stride: cfg.stride,
        ..Default::default()
      };
      ConvNd::Conv1d(Conv1d::new(ws, Some(bs), conv_cfg))
    }
    SpatialDims::Two => {
      let ws = vb.get_with_hints((out_channels, in_channels, k, k), "weight", init_ws)?;
      let conv_cfg = Conv2dConfig {
        padding: cfg.padding,
        stride: cfg.stride,
        ..Default::default()
      };
      ConvNd::Conv2d(Conv2d::new(ws, Some(bs), conv_cfg))
    }
    SpatialDims::Three => {
      let ws = vb.get_with_hints((out_channels, in_channels, k, k, k), "weight", init_ws)?;
      ConvNd::Conv3d(SlicedConv3d::new(&ws, Some(bs), cfg.padding, cfg.stride)?)
    }
  };

  Ok(conv)
}

/// Group normalization evaluated in f32 whatever the input dtype.
#[derive(Debug, Clone)]
pub struct Normalization {
  norm: GroupNorm,
}

impl Normalization {
  pub fn new(channels: usize, groups: usize, eps: f64, vb: VarBuilder) -> crate::Result<Self> {
    if groups == 0 || channels % groups != 0 {
      return Err(BackboneError::config(format!(
        "{channels} channels cannot be split into {groups} normalization groups"
      )));
    }

    let weight = vb
      .get_with_hints(channels, "weight", Init::Const(1.))?
      .to_dtype(DType::F32)?;
    let bias = vb
      .get_with_hints(channels, "bias", Init::Const(0.))?
      .to_dtype(DType::F32)?;

    Ok(Self {
      norm: GroupNorm::new(weight, bias, channels, groups, eps)?,
    })
  }
}

impl Module for Normalization {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let dtype = x.dtype();
    self.norm.forward(&x.to_dtype(DType::F32)?)?.to_dtype(dtype)
  }
}
