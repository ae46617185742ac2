use candle_core::{DType, Module, Tensor};
use candle_nn::VarBuilder;

use crate::{
  config::Precision,
  error::BackboneError,
  model::{
    blocks::{StageBlock, StageContext},
    layers::{ConvNd, ConvNdConfig, LayerSettings, Normalization},
    plan::{LadderPlan, StagePlan},
  },
  utils::TensorExt,
};

/// Noise modality handled by a pathway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
  Gaussian,
  Bernoulli,
}

impl Modality {
  pub fn as_str(self) -> &'static str {
    match self {
      Modality::Gaussian => "gaussian",
      Modality::Bernoulli => "bernoulli",
    }
  }
}

/// Encoder outputs waiting for their decoder stage, last in first out.
#[derive(Debug, Default)]
pub struct SkipStack {
  skips: Vec<Tensor>,
}

impl SkipStack {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      skips: Vec::with_capacity(capacity),
    }
  }

  pub fn push(&mut self, skip: Tensor) {
    self.skips.push(skip);
  }

  pub fn len(&self) -> usize {
    self.skips.len()
  }

  pub fn is_empty(&self) -> bool {
    self.skips.is_empty()
  }

  /// Pops the next skip, which must share batch and spatial size with `h`.
  pub fn pop_matching(&mut self, h: &Tensor) -> crate::Result<Tensor> {
    let Some(skip) = self.skips.pop() else {
      return Err(BackboneError::shape(
        format!("a skip tensor for {:?}", h.dims()),
        "an empty skip stack",
      ));
    };

    let same_batch = skip.dims().first() == h.dims().first();
    if !same_batch || skip.spatial_dims() != h.spatial_dims() {
      return Err(BackboneError::shape(
        format!("skip matching {:?}", h.dims()),
        format!("{:?}", skip.dims()),
      ));
    }

    Ok(skip)
  }

  /// Fails if skips are left over after decoding.
  pub fn finish(self) -> crate::Result<()> {
    if !self.skips.is_empty() {
      return Err(BackboneError::shape(
        "an empty skip stack after decoding",
        format!("{} unconsumed skips", self.skips.len()),
      ));
    }

    Ok(())
  }
}

/// Normalization, SiLU and a zero-initialized convolution down to the
/// modality's output channels. Runs at full precision.
#[derive(Debug, Clone)]
pub struct OutputHead {
  norm: Normalization,
  conv: ConvNd,
}

impl OutputHead {
  pub fn new(
    channels: usize,
    out_channels: usize,
    settings: &LayerSettings,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let settings = LayerSettings {
      precision: Precision::Full,
      ..*settings
    };

    Ok(Self {
      norm: settings.norm(channels, vb.pp("0"))?,
      conv: settings.conv(channels, out_channels, ConvNdConfig::new(3).zeroed(), vb.pp("2"))?,
    })
  }
}

impl Module for OutputHead {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let h = self.norm.forward(x)?.silu()?;
    self.conv.forward(&h)
  }
}

/// One encoder / middle / decoder ladder with its output head.
#[derive(Debug, Clone)]
pub struct Pathway {
  input_blocks: Vec<StageBlock>,
  middle_block: StageBlock,
  output_blocks: Vec<StageBlock>,
  out: OutputHead,
}

impl Pathway {
  /// Parameters live under `input_blocks_<modality>`, `middle_block_<modality>`,
  /// `output_blocks_<modality>` and `out_<modality>`.
  pub fn new(
    modality: Modality,
    plan: &LadderPlan,
    ctx: &StageContext,
    out_channels: usize,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let name = modality.as_str();

    let build = |stages: &[StagePlan], prefix: String| -> crate::Result<Vec<StageBlock>> {
      let vb = vb.pp(prefix);
      stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
          let block = StageBlock::new(stage, ctx, vb.pp(i))?;
          tracing::debug!("{name} stage {i}: {} layers", block.len());
          Ok(block)
        })
        .collect()
    };

    let input_blocks = build(&plan.encoder, format!("input_blocks_{name}"))?;
    let middle_block = StageBlock::new(&plan.middle, ctx, vb.pp(format!("middle_block_{name}")))?;
    let output_blocks = build(&plan.decoder, format!("output_blocks_{name}"))?;
    let out = OutputHead::new(
      plan.final_channels(),
      out_channels,
      &ctx.settings,
      vb.pp(format!("out_{name}")),
    )?;

    Ok(Self {
      input_blocks,
      middle_block,
      output_blocks,
      out,
    })
  }

  /// Runs the encoder ladder, adding `anchor_bias` to the first stage
  /// output. Every stage output is pushed as a skip.
  pub fn encode(
    &self,
    x: &Tensor,
    emb: &Tensor,
    anchor_bias: Option<&Tensor>,
    train: bool,
  ) -> crate::Result<(Tensor, SkipStack)> {
    let mut skips = SkipStack::with_capacity(self.input_blocks.len());
    let mut h = x.clone();

    for (i, block) in self.input_blocks.iter().enumerate() {
      h = block.forward_t(&h, emb, train)?;

      if i == 0 {
        if let Some(bias) = anchor_bias {
          if bias.dims() != h.dims() {
            return Err(BackboneError::shape(
              format!("anchor bias of shape {:?}", h.dims()),
              format!("{:?}", bias.dims()),
            ));
          }
          let bias = bias.to_dtype(h.dtype())?;
          h = (h + bias)?;
        }
      }

      skips.push(h.clone());
    }

    Ok((h, skips))
  }

  pub fn middle(&self, h: &Tensor, emb: &Tensor, train: bool) -> crate::Result<Tensor> {
    Ok(self.middle_block.forward_t(h, emb, train)?)
  }

  /// Consumes the skip stack through the decoder ladder.
  pub fn decode(
    &self,
    h: &Tensor,
    mut skips: SkipStack,
    emb: &Tensor,
    train: bool,
  ) -> crate::Result<Tensor> {
    let mut h = h.clone();

    for block in &self.output_blocks {
      let skip = skips.pop_matching(&h)?;
      h = Tensor::cat(&[&h, &skip], 1)?;
      h = block.forward_t(&h, emb, train)?;
    }
    skips.finish()?;

    Ok(h)
  }

  /// Full pathway pass. The decoder output is cast to `out_dtype` before
  /// the output head.
  pub fn forward_t(
    &self,
    x: &Tensor,
    emb: &Tensor,
    anchor_bias: Option<&Tensor>,
    out_dtype: DType,
    train: bool,
  ) -> crate::Result<Tensor> {
    let (h, skips) = self.encode(x, emb, anchor_bias, train)?;
    let h = self.middle(&h, emb, train)?;
    let h = self.decode(&h, skips, emb, train)?;

    Ok(self.out.forward(&h.to_dtype(out_dtype)?)?)
  }
}

#[cfg(test)]
mod tests {
  use candle_core::Device;
  use candle_nn::VarMap;

  use super::*;
  use crate::config::BackboneConfig;

  fn small_config() -> BackboneConfig {
    BackboneConfig::new(16, 8, 2, 1, 1, [2])
      .with_channel_mult(vec![1, 2])
      .with_norm_groups(4)
  }

  #[test]
  fn pathway_restores_input_resolution() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let config = small_config();
    let plan = LadderPlan::from_config(&config)?;
    let ctx = StageContext::from_config(&config);
    let pathway = Pathway::new(Modality::Gaussian, &plan, &ctx, 2, vb)?;

    let x = Tensor::randn(0f32, 1., (2, 2, 16, 16), &dev)?;
    let emb = Tensor::randn(0f32, 1., (2, 32), &dev)?;

    let (h, skips) = pathway.encode(&x, &emb, None, false)?;
    assert_eq!(skips.len(), plan.encoder.len());
    assert_eq!(h.dims(), [2, 16, 8, 8]);

    let y = pathway.forward_t(&x, &emb, None, DType::F32, false)?;
    assert_eq!(y.dims(), [2, 2, 16, 16]);
    // zero-initialized head
    assert_eq!(y.abs()?.sum_all()?.to_scalar::<f32>()?, 0.);

    assert!(varmap.data().lock().unwrap().contains_key("out_gaussian.2.weight"));
    assert!(varmap
      .data()
      .lock()
      .unwrap()
      .contains_key("input_blocks_gaussian.0.0.weight"));
    Ok(())
  }

  #[test]
  fn anchor_bias_shape_is_checked() -> crate::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let config = small_config();
    let plan = LadderPlan::from_config(&config)?;
    let ctx = StageContext::from_config(&config);
    let pathway = Pathway::new(Modality::Bernoulli, &plan, &ctx, 1, vb)?;

    let x = Tensor::randn(0f32, 1., (1, 2, 16, 16), &dev)?;
    let emb = Tensor::randn(0f32, 1., (1, 32), &dev)?;
    let bias = Tensor::ones((1, 4, 16, 16), DType::F32, &dev)?;
    assert!(matches!(
      pathway.encode(&x, &emb, Some(&bias), false),
      Err(BackboneError::Shape { .. })
    ));

    let bias = Tensor::ones((1, 8, 16, 16), DType::F32, &dev)?;
    let (anchored, skips) = pathway.encode(&x, &emb, Some(&bias), false)?;
    let (plain, _) = pathway.encode(&x, &emb, None, false)?;
    assert_eq!(skips.len(), plan.encoder.len());

    let diff = (anchored - plain)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(diff > 0.);
    Ok(())
  }

  #[test]
  fn skip_stack_checks_spatial_size() -> candle_core::Result<()> {
    let dev = Device::Cpu;
    let mut skips = SkipStack::default();
    skips.push(Tensor::zeros((1, 4, 8, 8), DType::F32, &dev)?);
    skips.push(Tensor::zeros((1, 4, 4, 4), DType::F32, &dev)?);

    let h = Tensor::zeros((1, 16, 8, 8), DType::F32, &dev)?;
    assert!(matches!(skips.pop_matching(&h), Err(BackboneError::Shape { .. })));

    assert!(skips.pop_matching(&h).is_ok());
    assert!(matches!(skips.pop_matching(&h), Err(BackboneError::Shape { .. })));
    assert!(skips.finish().is_ok());
    Ok(())
  }
}
