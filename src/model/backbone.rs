use candle_core::{Module, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder, VarMap};

use crate::{
  config::BackboneConfig,
  error::BackboneError,
  model::{
    blocks::{StageContext, TimeEmbedder},
    conditioning::{Conditioner, ConditioningOutput, MultiScaleFusion},
    pathway::{Modality, Pathway},
    plan::LadderPlan,
  },
};

const MIRRORED_PREFIXES: [(&str, &str); 3] = [
  ("input_blocks_gaussian.", "input_blocks_bernoulli."),
  ("middle_block_gaussian.", "middle_block_bernoulli."),
  ("output_blocks_gaussian.", "output_blocks_bernoulli."),
];

/// Per-modality predictions of one forward pass.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
  pub gaussian: Tensor,
  pub bernoulli: Tensor,
  /// The conditioning module's calibration map, `None` without one.
  pub calibration: Option<Tensor>,
}

/// Two structurally identical encoder-decoder pathways, one per noise
/// modality, sharing a timestep embedding and an optional conditioning
/// module.
#[derive(Debug)]
pub struct DualPathwayBackbone {
  config: BackboneConfig,
  plan: LadderPlan,
  time_embed: TimeEmbedder,
  label_emb: Option<Embedding>,
  gaussian: Pathway,
  bernoulli: Pathway,
  conditioner: Option<Box<dyn Conditioner>>,
}

impl DualPathwayBackbone {
  /// Builds the backbone with the built-in conditioning module under
  /// `mfcm` when `high_way` is set.
  pub fn new(config: BackboneConfig, vb: VarBuilder) -> crate::Result<Self> {
    let conditioner: Option<Box<dyn Conditioner>> = if config.high_way {
      Some(Box::new(MultiScaleFusion::new(&config, vb.pp("mfcm"))?))
    } else {
      None
    };

    Self::build(config, conditioner, vb)
  }

  /// Builds the backbone around a caller supplied conditioning module.
  pub fn with_conditioner(
    config: BackboneConfig,
    conditioner: Box<dyn Conditioner>,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    if !config.high_way {
      return Err(BackboneError::config(
        "a conditioning module was supplied but high_way is disabled",
      ));
    }

    Self::build(config, Some(conditioner), vb)
  }

  fn build(
    config: BackboneConfig,
    conditioner: Option<Box<dyn Conditioner>>,
    vb: VarBuilder,
  ) -> crate::Result<Self> {
    let plan = LadderPlan::from_config(&config)?;

    if let Some(conditioner) = &conditioner {
      let (low, high) = conditioner.anchor_widths();
      if 2 * low + high != config.model_channels {
        return Err(BackboneError::config(format!(
          "anchor widths ({low}, {high}) do not add up to {} channels",
          config.model_channels
        )));
      }
    }

    if config.use_checkpoint {
      tracing::warn!("Gradient checkpointing is not available, ignoring `use_checkpoint`...");
    }

    let time_embed = TimeEmbedder::new(config.model_channels, vb.pp("time_embed"))?;

    // built so checkpoints load, forward still refuses labels
    let label_emb = match config.num_classes {
      Some(num_classes) => Some(embedding(
        num_classes,
        config.time_embed_dim(),
        vb.pp("label_emb"),
      )?),
      None => None,
    };

    let ctx = StageContext::from_config(&config);
    let gaussian = Pathway::new(
      Modality::Gaussian,
      &plan,
      &ctx,
      config.out_channels_gaussian,
      vb.clone(),
    )?;
    let bernoulli = Pathway::new(
      Modality::Bernoulli,
      &plan,
      &ctx,
      config.out_channels_bernoulli,
      vb,
    )?;

    tracing::info!(
      "Backbone ready: {} levels, {} encoder / {} decoder stages, feature size {}, {:?} precision",
      config.channel_mult.len(),
      plan.encoder.len(),
      plan.decoder.len(),
      plan.feature_size,
      config.precision(),
    );

    Ok(Self {
      config,
      plan,
      time_embed,
      label_emb,
      gaussian,
      bernoulli,
      conditioner,
    })
  }

  pub fn config(&self) -> &BackboneConfig {
    &self.config
  }

  pub fn plan(&self) -> &LadderPlan {
    &self.plan
  }

  pub fn feature_size(&self) -> usize {
    self.plan.feature_size
  }

  pub fn label_embedding(&self) -> Option<&Embedding> {
    self.label_emb.as_ref()
  }

  pub fn has_conditioner(&self) -> bool {
    self.conditioner.is_some()
  }

  /// Attention matmul cost of both pathways for an input of `spatial` size.
  pub fn attention_flops(&self, batch: usize, spatial: &[usize]) -> u64 {
    2 * self.plan.attention_flops(batch, spatial)
  }

  /// Runs the conditioning module alone on a `(n, 1, *spatial)` image.
  pub fn conditioning_forward(&self, image: &Tensor) -> crate::Result<Option<ConditioningOutput>> {
    match &self.conditioner {
      Some(conditioner) => Ok(Some(conditioner.condition(image)?)),
      None => Ok(None),
    }
  }

  /// Inference pass over `x = [image, gaussian noise, bernoulli noise]`.
  pub fn forward(
    &self,
    x: &Tensor,
    timesteps: &Tensor,
    y: Option<&Tensor>,
  ) -> crate::Result<BackboneOutput> {
    self.forward_t(x, timesteps, y, false)
  }

  pub fn forward_t(
    &self,
    x: &Tensor,
    timesteps: &Tensor,
    y: Option<&Tensor>,
    train: bool,
  ) -> crate::Result<BackboneOutput> {
    let rank = self.config.dims.rank();
    if x.rank() != rank || x.dim(1)? != 3 {
      return Err(BackboneError::shape(
        format!("a rank-{rank} input with 3 channels (image, gaussian noise, bernoulli noise)"),
        format!("{:?}", x.dims()),
      ));
    }
    let batch = x.dim(0)?;

    if y.is_some() != self.config.num_classes.is_some() {
      return Err(BackboneError::ClassConditioning(
        "must specify y if and only if the model is class-conditional".to_owned(),
      ));
    }

    if self.config.num_classes.is_some() {
      return Err(BackboneError::Unsupported(
        "class-conditional forward pass".to_owned(),
      ));
    }

    let timesteps = squeeze_timesteps(timesteps, batch)?;
    let emb = self.time_embed.forward(&timesteps)?;

    let image = x.narrow(1, 0, 1)?;
    let noise_gaussian = x.narrow(1, 1, 1)?;
    let noise_bernoulli = x.narrow(1, 2, 1)?;

    let (anchor_bias, calibration) = match self.conditioning_forward(&image)? {
      Some(out) => (Some(out.anchor.bias()?), Some(out.calibration)),
      None => (None, None),
    };

    let dtype = self.config.precision().dtype();
    let h_gaussian = Tensor::cat(&[&image, &noise_gaussian], 1)?.to_dtype(dtype)?;
    let h_bernoulli = Tensor::cat(&[&image, &noise_bernoulli], 1)?.to_dtype(dtype)?;

    let gaussian = self
      .gaussian
      .forward_t(&h_gaussian, &emb, anchor_bias.as_ref(), x.dtype(), train)?;
    let bernoulli = self
      .bernoulli
      .forward_t(&h_bernoulli, &emb, anchor_bias.as_ref(), x.dtype(), train)?;

    Ok(BackboneOutput {
      gaussian,
      bernoulli,
      calibration,
    })
  }
}

/// Drops unit axes from `timesteps`, which must leave one value per sample.
fn squeeze_timesteps(timesteps: &Tensor, batch: usize) -> crate::Result<Tensor> {
  let kept = timesteps.dims().iter().filter(|&&d| d != 1).count();
  if kept > 1 || timesteps.elem_count() != batch {
    return Err(BackboneError::shape(
      format!("{batch} timesteps"),
      format!("{:?}", timesteps.dims()),
    ));
  }

  Ok(timesteps.reshape(batch)?)
}

/// Copies every gaussian encoder, middle and decoder parameter onto its
/// bernoulli counterpart so both pathways start from identical weights.
/// Output heads are left alone. Returns the number of copied variables.
pub fn mirror_pathway_init(varmap: &VarMap) -> crate::Result<usize> {
  let data = varmap
    .data()
    .lock()
    .map_err(|e| candle_core::Error::Msg(format!("variable map is poisoned: {e}")))?;

  let mut copied = 0;
  for (name, var) in data.iter() {
    let Some((from, to)) = MIRRORED_PREFIXES
      .iter()
      .find(|(from, _)| name.contains(from))
    else {
      continue;
    };

    let target = name.replacen(from, to, 1);
    let Some(counterpart) = data.get(&target) else {
      return Err(BackboneError::config(format!(
        "{name} has no counterpart {target}"
      )));
    };

    counterpart.set(var.as_tensor())?;
    copied += 1;
  }

  tracing::debug!("Mirrored {copied} pathway variables");
  Ok(copied)
}
