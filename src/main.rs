mod cli;
mod setup;

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use cli::Cli;
use echo_dnd::{mirror_pathway_init, model::LadderPlan, DualPathwayBackbone};
use setup::{setup_args, setup_tracing};

fn main() -> echo_dnd::Result<()> {
  setup_tracing();

  let args = Cli::parse();
  let config = setup_args(&args)?;

  let plan = LadderPlan::from_config(&config)?;
  println!("{plan}");

  let spatial = vec![config.image_size; config.dims.count()];
  tracing::info!(
    "Attention cost for batch {}: {} MACs per pathway",
    args.batch,
    plan.attention_flops(args.batch, &spatial)
  );

  if args.plan_only {
    return Ok(());
  }

  let device = if args.use_cpu {
    Device::Cpu
  } else {
    Device::cuda_if_available(0)?
  };

  let varmap = VarMap::new();
  let vb = match &args.weights {
    Some(path) => unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? },
    None => VarBuilder::from_varmap(&varmap, DType::F32, &device),
  };

  let model = DualPathwayBackbone::new(config, vb)?;

  if args.weights.is_none() {
    mirror_pathway_init(&varmap)?;
    let params: usize = varmap.all_vars().iter().map(|var| var.elem_count()).sum();
    tracing::info!("{params} parameters");
  }

  let mut shape = vec![args.batch, 3];
  shape.extend(&spatial);
  let x = Tensor::randn(0f32, 1., shape, &device)?;
  let timesteps = Tensor::full(args.timestep, args.batch, &device)?;

  let start = Instant::now();
  let out = model.forward(&x, &timesteps, None)?;
  tracing::info!("Forward pass took {:?}", start.elapsed());

  tracing::info!("gaussian: {:?}", out.gaussian.dims());
  tracing::info!("bernoulli: {:?}", out.bernoulli.dims());
  match &out.calibration {
    Some(calibration) => tracing::info!("calibration: {:?}", calibration.dims()),
    None => tracing::info!("calibration: none (high_way disabled)"),
  }

  Ok(())
}
