use candle_core::{Module, Tensor};
use candle_nn::{ops::sigmoid, VarBuilder};

use crate::{
  config::{BackboneConfig, Precision, SpatialDims},
  error::BackboneError,
  model::layers::{ConvNd, ConvNdConfig, LayerSettings},
};

/// Anchor features added to the first encoder stage of both pathways.
#[derive(Debug, Clone)]
pub struct Anchor {
  pub low: Tensor,
  pub high: Tensor,
}

impl Anchor {
  /// `[low, low, high]` along channels, cut from the graph.
  pub fn bias(&self) -> Result<Tensor, candle_core::Error> {
    Ok(Tensor::cat(&[&self.low, &self.low, &self.high], 1)?.detach())
  }
}

#[derive(Debug, Clone)]
pub struct ConditioningOutput {
  pub anchor: Anchor,
  /// Returned to the caller untouched.
  pub calibration: Tensor,
}

/// Turns the single-channel image into anchor features at full input
/// resolution plus a calibration map.
///
/// `2 * low + high` of [`Conditioner::anchor_widths`] must equal the
/// backbone's `model_channels`.
pub trait Conditioner: std::fmt::Debug + Send + Sync {
  fn condition(&self, image: &Tensor) -> Result<ConditioningOutput, candle_core::Error>;

  /// Channel counts of `(anchor.low, anchor.high)`.
  fn anchor_widths(&self) -> (usize, usize);
}

/// Two-resolution fusion network over 2D images: a full-resolution branch
/// and a pooled branch are fused, then projected onto the anchor widths and
/// a sigmoid calibration map. Always runs in f32.
#[derive(Debug, Clone)]
pub struct MultiScaleFusion {
  stem: ConvNd,
  high: ConvNd,
  low: ConvNd,
  fuse: ConvNd,
  anchor_low: ConvNd,
  anchor_high: ConvNd,
  calibration: ConvNd,
  widths: (usize, usize),
  span: tracing::Span,
}

impl MultiScaleFusion {
  pub fn new(config: &BackboneConfig, vb: VarBuilder) -> crate::Result<Self> {
    if config.dims != SpatialDims::Two {
      return Err(BackboneError::config(format!(
        "the built-in conditioning module only handles 2D images, got {} spatial dims",
        config.dims.count()
      )));
    }

    let mc = config.model_channels;
    let low_width = mc / 4;
    let high_width = mc - 2 * low_width;
    if low_width == 0 {
      return Err(BackboneError::config(format!(
        "model_channels {mc} is too small to split into anchor features"
      )));
    }

    let features = config.fusion_channels;
    if features == 0 {
      return Err(BackboneError::config("fusion_channels must be positive"));
    }

    let settings = LayerSettings {
      dims: SpatialDims::Two,
      precision: Precision::Full,
      norm_groups: config.norm_groups,
      norm_eps: config.norm_eps,
    };
    let conv3 = ConvNdConfig::new(3);
    let conv1 = ConvNdConfig::new(1);

    Ok(Self {
      stem: settings.conv(1, features, conv3, vb.pp("stem"))?,
      high: settings.conv(features, features, conv3, vb.pp("high"))?,
      low: settings.conv(features, features, conv3, vb.pp("low"))?,
      fuse: settings.conv(2 * features, features, conv1, vb.pp("fuse"))?,
      anchor_low: settings.conv(features, low_width, conv1, vb.pp("anchor_low"))?,
      anchor_high: settings.conv(features, high_width, conv1, vb.pp("anchor_high"))?,
      calibration: settings.conv(features, 1, conv1, vb.pp("calibration"))?,
      widths: (low_width, high_width),
      span: tracing::span!(tracing::Level::TRACE, "fusion"),
    })
  }
}

impl Conditioner for MultiScaleFusion {
  fn condition(&self, image: &Tensor) -> Result<ConditioningOutput, candle_core::Error> {
    let _enter = self.span.enter();

    let (_, c, h, w) = image.dims4()?;
    if c != 1 {
      return Err(
        candle_core::Error::Msg(format!(
          "conditioning expects a single-channel image, got {c}"
        ))
        .bt(),
      );
    }

    let stem = self.stem.forward(image)?.silu()?;
    let high = self.high.forward(&stem)?.silu()?;
    let low = self
      .low
      .forward(&stem.avg_pool2d(2)?)?
      .silu()?
      .upsample_nearest2d(h, w)?;

    let fused = self.fuse.forward(&Tensor::cat(&[&high, &low], 1)?)?.silu()?;

    Ok(ConditioningOutput {
      anchor: Anchor {
        low: self.anchor_low.forward(&fused)?,
        high: self.anchor_high.forward(&fused)?,
      },
      calibration: sigmoid(&self.calibration.forward(&fused)?)?,
    })
  }

  fn anchor_widths(&self) -> (usize, usize) {
    self.widths
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, Var};
  use candle_nn::VarMap;

  use super::*;

  #[test]
  fn anchor_bias_repeats_low_features() -> candle_core::Result<()> {
    let dev = Device::Cpu;
    let anchor = Anchor {
      low: Tensor::ones((1, 2, 3, 3), DType::F32, &dev)?,
      high: Tensor::zeros((1, 4, 3, 3), DType::F32, &dev)?,
    };

    let bias = anchor.bias()?;
    assert_eq!(bias.dims(), [1, 8, 3, 3]);
    let per_channel = bias.sum((0, 2, 3))?.to_vec1::<f32>()?;
    assert_eq!(per_channel, [9., 9., 9., 9., 0., 0., 0., 0.]);
    Ok(())
  }

  #[test]
  fn anchor_bias_carries_no_gradient() -> candle_core::Result<()> {
    let dev = Device::Cpu;
    let low = Var::ones((1, 2, 3, 3), DType::F32, &dev)?;
    let high = Var::ones((1, 4, 3, 3), DType::F32, &dev)?;
    let anchor = Anchor {
      low: low.as_tensor().clone(),
      high: high.as_tensor().clone(),
    };

    let attached = Tensor::cat(&[&anchor.low, &anchor.low, &anchor.high], 1)?;
    let grads = attached.sum_all()?.backward()?;
    assert!(grads.get(low.as_tensor()).is_some());

    let grads = anchor.bias()?.sum_all()?.backward()?;
    assert!(grads.get(low.as_tensor()).is_none());
    assert!(grads.get(high.as_tensor()).is_none());
    Ok(())
  }

  #[test]
  fn fusion_matches_anchor_contract() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let config = BackboneConfig::new(16, 32, 1, 1, 1, []).with_fusion_channels(8);
    let fusion = MultiScaleFusion::new(&config, vb)?;

    let (low, high) = fusion.anchor_widths();
    assert_eq!(2 * low + high, 32);

    // odd sizes still come back at full resolution
    let image = Tensor::randn(0f32, 1., (2, 1, 15, 9), &dev)?;
    let out = fusion.condition(&image)?;
    assert_eq!(out.anchor.bias()?.dims(), [2, 32, 15, 9]);
    assert_eq!(out.calibration.dims(), [2, 1, 15, 9]);

    let min = out.calibration.flatten_all()?.min(0)?.to_scalar::<f32>()?;
    let max = out.calibration.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    assert!(min > 0. && max < 1.);
    Ok(())
  }

  #[test]
  fn fusion_is_2d_only() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = BackboneConfig::new(16, 32, 1, 1, 1, []).with_dims(SpatialDims::Three);
    assert!(matches!(
      MultiScaleFusion::new(&config, vb),
      Err(BackboneError::Config(_))
    ));
  }
}
