use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig};

/// 3D convolution over `(n, c, d, h, w)` maps, computed as a sum of 2D
/// convolutions, one per depth tap of a `(out, in, kd, kh, kw)` weight.
/// Depth stride is always 1; `stride` applies to the two trailing axes.
#[derive(Debug, Clone)]
pub struct SlicedConv3d {
  weight: Tensor,
  bias: Option<Tensor>,
  cfg: Conv2dConfig,
  depth_padding: usize,
  out_channels: usize,
}

impl SlicedConv3d {
  pub fn new(
    weight: &Tensor,
    bias: Option<Tensor>,
    padding: usize,
    stride: usize,
  ) -> Result<Self, candle_core::Error> {
    let (out_channels, _, _, _, _) = weight.dims5()?;

    Ok(Self {
      weight: weight.clone(),
      bias,
      cfg: Conv2dConfig {
        padding,
        stride,
        ..Default::default()
      },
      depth_padding: padding,
      out_channels,
    })
  }

  // sliced per call so updates to the underlying variable stay visible
  fn tap(&self, z: usize) -> Result<Conv2d, candle_core::Error> {
    Ok(Conv2d::new(
      self.weight.i((.., .., z, .., ..))?.contiguous()?,
      None,
      self.cfg,
    ))
  }
}

impl Module for SlicedConv3d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let (n, c, d, h, w) = x.dims5()?;
    let kd = self.weight.dim(2)?;

    let x = x.pad_with_zeros(2, self.depth_padding, self.depth_padding)?;
    let padded = d + 2 * self.depth_padding;
    if padded < kd {
      return Err(
        candle_core::Error::Msg(format!(
          "conv3d: depth {d} too small for a kernel of depth {kd}"
        ))
        .bt(),
      );
    }
    let d_out = padded - kd + 1;

    let mut acc: Option<Tensor> = None;
    for z in 0..kd {
      let xs = x
        .narrow(2, z, d_out)?
        .permute((0, 2, 1, 3, 4))?
        .reshape((n * d_out, c, h, w))?;
      let ys = self.tap(z)?.forward(&xs)?;
      acc = Some(match acc {
        None => ys,
        Some(prev) => (prev + ys)?,
      });
    }

    let Some(y) = acc else {
      return Err(candle_core::Error::Msg("conv3d: empty kernel".to_owned()).bt());
    };

    let (_, _, ho, wo) = y.dims4()?;
    let y = y
      .reshape((n, d_out, self.out_channels, ho, wo))?
      .permute((0, 2, 1, 3, 4))?;

    match &self.bias {
      Some(bias) => y.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1, 1))?),
      None => Ok(y),
    }
  }
}
