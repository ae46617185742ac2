use candle_core::{Tensor, D};

use crate::config::SpatialDims;

pub trait TensorExt {
  fn spatial_dims(&self) -> &[usize];

  /// `(b, c, *spatial)` -> `(b, c, prod(spatial))`.
  fn flatten_spatial(&self) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  fn unflatten_spatial(&self, spatial: &[usize]) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Appends trailing singleton axes until the tensor has `rank` dims.
  fn append_singleton_dims(&self, rank: usize) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Nearest-neighbour x2 on the spatial axes; the depth axis of a 3D map
  /// is kept as is.
  fn upsample_nearest_spatial(&self, dims: SpatialDims) -> Result<Self, candle_core::Error>
  where
    Self: Sized;

  /// Stride-matched 2x average pooling, depth axis untouched for 3D.
  fn avg_pool_spatial(&self, dims: SpatialDims) -> Result<Self, candle_core::Error>
  where
    Self: Sized;
}

fn check_rank(x: &Tensor, dims: SpatialDims, op: &str) -> Result<(), candle_core::Error> {
  if x.rank() != dims.rank() {
    return Err(
      candle_core::Error::Msg(format!(
        "{op}: expected a rank-{} feature map, got shape {:?}",
        dims.rank(),
        x.dims()
      ))
      .bt(),
    );
  }

  Ok(())
}

impl TensorExt for Tensor {
  fn spatial_dims(&self) -> &[usize] {
    let dims = self.dims();
    if dims.len() > 2 {
      &dims[2..]
    } else {
      &[]
    }
  }

  fn flatten_spatial(&self) -> Result<Self, candle_core::Error> {
    if self.rank() < 3 {
      return Err(
        candle_core::Error::Msg(format!(
          "flatten_spatial: no spatial axes in shape {:?}",
          self.dims()
        ))
        .bt(),
      );
    }

    self.flatten_from(2)
  }

  fn unflatten_spatial(&self, spatial: &[usize]) -> Result<Self, candle_core::Error> {
    let (b, c, _) = self.dims3()?;
    let mut shape = Vec::with_capacity(spatial.len() + 2);
    shape.push(b);
    shape.push(c);
    shape.extend_from_slice(spatial);
    self.reshape(shape)
  }

  fn append_singleton_dims(&self, rank: usize) -> Result<Self, candle_core::Error> {
    let mut x = self.clone();
    while x.rank() < rank {
      x = x.unsqueeze(D::Minus1)?;
    }
    Ok(x)
  }

  fn upsample_nearest_spatial(&self, dims: SpatialDims) -> Result<Self, candle_core::Error> {
    check_rank(self, dims, "upsample_nearest_spatial")?;

    match dims {
      SpatialDims::One => {
        let (_, _, l) = self.dims3()?;
        self.upsample_nearest1d(l * 2)
      }
      SpatialDims::Two => {
        let (_, _, h, w) = self.dims4()?;
        self.upsample_nearest2d(h * 2, w * 2)
      }
      SpatialDims::Three => {
        let (n, c, d, h, w) = self.dims5()?;
        self
          .reshape((n, c * d, h, w))?
          .upsample_nearest2d(h * 2, w * 2)?
          .reshape((n, c, d, h * 2, w * 2))
      }
    }
  }

  fn avg_pool_spatial(&self, dims: SpatialDims) -> Result<Self, candle_core::Error> {
    check_rank(self, dims, "avg_pool_spatial")?;

    match dims {
      SpatialDims::One => {
        let (n, c, l) = self.dims3()?;
        self
          .reshape((n, c, 1, l))?
          .avg_pool2d_with_stride((1, 2), (1, 2))?
          .reshape((n, c, l / 2))
      }
      SpatialDims::Two => self.avg_pool2d(2),
      SpatialDims::Three => {
        let (n, c, d, h, w) = self.dims5()?;
        self
          .reshape((n, c * d, h, w))?
          .avg_pool2d(2)?
          .reshape((n, c, d, h / 2, w / 2))
      }
    }
  }
}
