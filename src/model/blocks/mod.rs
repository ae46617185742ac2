mod attention;
mod res_block;
mod resample;
mod time_embed;

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use smallvec::SmallVec;

pub use attention::*;
pub use res_block::*;
pub use resample::*;
pub use time_embed::*;

use crate::{
  config::BackboneConfig,
  model::{
    layers::{ConvNd, ConvNdConfig, LayerSettings},
    plan::{LayerPlan, StagePlan},
  },
};

/// Everything a stage needs besides its own plan entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageContext {
  pub settings: LayerSettings,
  pub emb_channels: usize,
  pub dropout: f32,
  pub conditioning: Conditioning,
  pub conv_resample: bool,
  pub head_order: HeadOrder,
}

impl StageContext {
  pub fn from_config(config: &BackboneConfig) -> Self {
    Self {
      settings: LayerSettings::from_config(config),
      emb_channels: config.time_embed_dim(),
      dropout: config.dropout,
      conditioning: if config.use_scale_shift_norm {
        Conditioning::ScaleShift
      } else {
        Conditioning::Additive
      },
      conv_resample: config.conv_resample,
      head_order: HeadOrder::from_flag(config.use_new_attention_order),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Stage {
  Input(ConvNd),
  Residual(ResBlock),
  Attention(AttentionBlock),
  Resample(Resample),
}

impl Stage {
  pub fn new(layer: &LayerPlan, ctx: &StageContext, vb: VarBuilder) -> crate::Result<Self> {
    let stage = match *layer {
      LayerPlan::InputConv {
        in_channels,
        out_channels,
      } => Stage::Input(ctx.settings.conv(in_channels, out_channels, ConvNdConfig::new(3), vb)?),
      LayerPlan::Residual {
        in_channels,
        out_channels,
        resample,
      } => {
        let config = ResBlockConfig {
          out_channels: Some(out_channels),
          dropout: ctx.dropout,
          conditioning: ctx.conditioning,
          resample,
          use_conv_skip: false,
        };
        Stage::Residual(ResBlock::new(in_channels, ctx.emb_channels, config, &ctx.settings, vb)?)
      }
      LayerPlan::Attention {
        channels,
        num_heads,
      } => Stage::Attention(AttentionBlock::new(
        channels,
        num_heads,
        None,
        ctx.head_order,
        &ctx.settings,
        vb,
      )?),
      LayerPlan::Resample {
        direction,
        channels,
        out_channels,
      } => Stage::Resample(Resample::new(
        direction,
        channels,
        ctx.conv_resample,
        Some(out_channels),
        &ctx.settings,
        vb,
      )?),
    };

    Ok(stage)
  }

  /// Only residual units read the embedding.
  pub fn forward_t(
    &self,
    x: &Tensor,
    emb: &Tensor,
    train: bool,
  ) -> Result<Tensor, candle_core::Error> {
    match self {
      Stage::Input(m) => m.forward(x),
      Stage::Residual(m) => m.forward_t(x, emb, train),
      Stage::Attention(m) => m.forward(x),
      Stage::Resample(m) => m.forward(x),
    }
  }
}

/// The layers of one ladder stage, applied in order. Layer `j` lives
/// under `<prefix>.j`.
#[derive(Debug, Clone)]
pub struct StageBlock {
  layers: SmallVec<[Stage; 3]>,
}

impl StageBlock {
  pub fn new(plan: &StagePlan, ctx: &StageContext, vb: VarBuilder) -> crate::Result<Self> {
    let layers = plan
      .layers
      .iter()
      .enumerate()
      .map(|(j, layer)| Stage::new(layer, ctx, vb.pp(j)))
      .collect::<crate::Result<SmallVec<[Stage; 3]>>>()?;

    Ok(Self { layers })
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  pub fn forward_t(
    &self,
    x: &Tensor,
    emb: &Tensor,
    train: bool,
  ) -> Result<Tensor, candle_core::Error> {
    let mut h = x.clone();
    for layer in &self.layers {
      h = layer.forward_t(&h, emb, train)?;
    }

    Ok(h)
  }
}
