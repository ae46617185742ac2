use std::{collections::BTreeSet, fs, path::Path};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{BackboneError, Result};

/// Number of spatial axes of the feature maps (rank - 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum SpatialDims {
  One,
  Two,
  Three,
}

impl SpatialDims {
  pub fn count(self) -> usize {
    match self {
      Self::One => 1,
      Self::Two => 2,
      Self::Three => 3,
    }
  }

  /// Rank of a batched, channel-first feature map.
  pub fn rank(self) -> usize {
    self.count() + 2
  }
}

impl TryFrom<usize> for SpatialDims {
  type Error = String;

  fn try_from(value: usize) -> std::result::Result<Self, Self::Error> {
    match value {
      1 => Ok(Self::One),
      2 => Ok(Self::Two),
      3 => Ok(Self::Three),
      v => Err(format!("unsupported dimensions: {v}")),
    }
  }
}

impl From<SpatialDims> for usize {
  fn from(dims: SpatialDims) -> Self {
    dims.count()
  }
}

/// Storage and compute width of the convolutional ladders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
  Full,
  Half,
}

impl Precision {
  pub fn dtype(self) -> DType {
    match self {
      Self::Full => DType::F32,
      Self::Half => DType::F16,
    }
  }
}

fn default_in_channels() -> usize {
  2
}

fn default_channel_mult() -> Vec<usize> {
  vec![1, 2, 4, 8]
}

fn default_true() -> bool {
  true
}

fn default_dims() -> SpatialDims {
  SpatialDims::Two
}

fn default_num_heads() -> usize {
  1
}

fn default_norm_groups() -> usize {
  32
}

fn default_norm_eps() -> f64 {
  1e-5
}

fn default_fusion_channels() -> usize {
  32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
  pub image_size: usize,

  /// Channels entering each pathway: the shared image plus one noise map.
  #[serde(default = "default_in_channels")]
  pub in_channels: usize,

  pub model_channels: usize,
  pub out_channels_gaussian: usize,
  pub out_channels_bernoulli: usize,
  pub num_res_blocks: usize,

  /// Downsample factors at which attention is inserted.
  pub attention_resolutions: BTreeSet<usize>,

  #[serde(default)]
  pub dropout: f32,

  #[serde(default = "default_channel_mult")]
  pub channel_mult: Vec<usize>,

  #[serde(default = "default_true")]
  pub conv_resample: bool,

  #[serde(default = "default_dims")]
  pub dims: SpatialDims,

  #[serde(default)]
  pub num_classes: Option<usize>,

  #[serde(default)]
  pub use_checkpoint: bool,

  #[serde(default)]
  pub use_fp16: bool,

  #[serde(default = "default_num_heads")]
  pub num_heads: usize,

  #[serde(default)]
  pub num_head_channels: Option<usize>,

  #[serde(default)]
  pub num_heads_upsample: Option<usize>,

  #[serde(default)]
  pub use_scale_shift_norm: bool,

  #[serde(default)]
  pub resblock_updown: bool,

  #[serde(default)]
  pub use_new_attention_order: bool,

  #[serde(default = "default_true")]
  pub high_way: bool,

  #[serde(default = "default_norm_groups")]
  pub norm_groups: usize,

  #[serde(default = "default_norm_eps")]
  pub norm_eps: f64,

  #[serde(default = "default_fusion_channels")]
  pub fusion_channels: usize,
}

macro_rules! setters {
  ($($name:ident: $field:ident: $ty:ty),* $(,)?) => {
    $(
      pub fn $name(mut self, $field: $ty) -> Self {
        self.$field = $field;
        self
      }
    )*
  };
}

impl BackboneConfig {
  pub fn new(
    image_size: usize,
    model_channels: usize,
    out_channels_gaussian: usize,
    out_channels_bernoulli: usize,
    num_res_blocks: usize,
    attention_resolutions: impl IntoIterator<Item = usize>,
  ) -> Self {
    Self {
      image_size,
      in_channels: default_in_channels(),
      model_channels,
      out_channels_gaussian,
      out_channels_bernoulli,
      num_res_blocks,
      attention_resolutions: attention_resolutions.into_iter().collect(),
      dropout: 0.,
      channel_mult: default_channel_mult(),
      conv_resample: true,
      dims: default_dims(),
      num_classes: None,
      use_checkpoint: false,
      use_fp16: false,
      num_heads: default_num_heads(),
      num_head_channels: None,
      num_heads_upsample: None,
      use_scale_shift_norm: false,
      resblock_updown: false,
      use_new_attention_order: false,
      high_way: true,
      norm_groups: default_norm_groups(),
      norm_eps: default_norm_eps(),
      fusion_channels: default_fusion_channels(),
    }
  }

  setters! {
    with_in_channels: in_channels: usize,
    with_dropout: dropout: f32,
    with_channel_mult: channel_mult: Vec<usize>,
    with_conv_resample: conv_resample: bool,
    with_dims: dims: SpatialDims,
    with_num_classes: num_classes: Option<usize>,
    with_use_checkpoint: use_checkpoint: bool,
    with_use_fp16: use_fp16: bool,
    with_num_heads: num_heads: usize,
    with_num_head_channels: num_head_channels: Option<usize>,
    with_num_heads_upsample: num_heads_upsample: Option<usize>,
    with_use_scale_shift_norm: use_scale_shift_norm: bool,
    with_resblock_updown: resblock_updown: bool,
    with_use_new_attention_order: use_new_attention_order: bool,
    with_high_way: high_way: bool,
    with_norm_groups: norm_groups: usize,
    with_norm_eps: norm_eps: f64,
    with_fusion_channels: fusion_channels: usize,
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let raw = fs::read_to_string(path)?;
    let config: Self = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
  }

  pub fn time_embed_dim(&self) -> usize {
    self.model_channels * 4
  }

  pub fn precision(&self) -> Precision {
    if self.use_fp16 {
      Precision::Half
    } else {
      Precision::Full
    }
  }

  pub fn heads_upsample(&self) -> usize {
    self.num_heads_upsample.unwrap_or(self.num_heads)
  }

  /// Checks the settings that do not depend on per-stage channel counts.
  /// Channel divisibility for attention and normalization is checked while
  /// planning the ladder.
  pub fn validate(&self) -> Result<()> {
    if self.image_size == 0 {
      return Err(BackboneError::config("image_size must be positive"));
    }

    if self.model_channels == 0 {
      return Err(BackboneError::config("model_channels must be positive"));
    }

    // forward() splits [image, gaussian noise, bernoulli noise]
    if self.in_channels != 2 {
      return Err(BackboneError::config(format!(
        "in_channels must be 2 (image + one noise map per pathway), got {}",
        self.in_channels
      )));
    }

    if self.out_channels_gaussian == 0 || self.out_channels_bernoulli == 0 {
      return Err(BackboneError::config("output channel counts must be positive"));
    }

    if self.channel_mult.is_empty() || self.channel_mult.contains(&0) {
      return Err(BackboneError::config(format!(
        "channel_mult must be non-empty and positive, got {:?}",
        self.channel_mult
      )));
    }

    if !(0.0..1.0).contains(&self.dropout) {
      return Err(BackboneError::config(format!(
        "dropout must be in [0, 1), got {}",
        self.dropout
      )));
    }

    if self.num_heads == 0 || self.heads_upsample() == 0 {
      return Err(BackboneError::config("attention head counts must be positive"));
    }

    if self.num_head_channels == Some(0) {
      return Err(BackboneError::config("num_head_channels must be positive"));
    }

    if self.norm_groups == 0 {
      return Err(BackboneError::config("norm_groups must be positive"));
    }

    if self.num_classes == Some(0) {
      return Err(BackboneError::config("num_classes must be positive when set"));
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn json_defaults_follow_constructor_defaults() -> Result<()> {
    let raw = r#"{
      "image_size": 64,
      "model_channels": 32,
      "out_channels_gaussian": 2,
      "out_channels_bernoulli": 1,
      "num_res_blocks": 1,
      "attention_resolutions": [2]
    }"#;
    let config: BackboneConfig = serde_json::from_str(raw)?;

    assert_eq!(config, BackboneConfig::new(64, 32, 2, 1, 1, [2]));
    assert_eq!(config.channel_mult, vec![1, 2, 4, 8]);
    assert_eq!(config.dims, SpatialDims::Two);
    assert_eq!(config.time_embed_dim(), 128);
    assert_eq!(config.precision(), Precision::Full);
    assert!(config.high_way);
    config.validate()
  }

  #[test]
  fn dims_round_trip_as_integers() -> Result<()> {
    let config = BackboneConfig::new(16, 8, 1, 1, 1, []).with_dims(SpatialDims::Three);
    let raw = serde_json::to_string(&config)?;
    assert!(raw.contains("\"dims\":3"));

    let bad = raw.replace("\"dims\":3", "\"dims\":4");
    assert!(serde_json::from_str::<BackboneConfig>(&bad).is_err());
    Ok(())
  }

  #[test]
  fn rejects_bad_settings() {
    let base = BackboneConfig::new(64, 32, 2, 1, 1, [2]);

    assert!(base.clone().with_in_channels(3).validate().is_err());
    assert!(base.clone().with_channel_mult(vec![]).validate().is_err());
    assert!(base.clone().with_dropout(1.0).validate().is_err());
    assert!(base.clone().with_num_head_channels(Some(0)).validate().is_err());
    assert!(base.clone().with_num_heads_upsample(Some(0)).validate().is_err());
    assert!(base.with_num_classes(Some(0)).validate().is_err());
  }
}
