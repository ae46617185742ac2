use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, author)]
#[command(about = "Inspect the dual-pathway diffusion backbone", long_about = None)]
pub struct Cli {
  #[arg(short, long, help = "Backbone configuration (JSON)")]
  #[arg(value_name = "CONFIG")]
  pub config: Option<PathBuf>,

  #[arg(short, long, help = "Weights to load (safetensors), random init otherwise")]
  #[arg(value_name = "WEIGHTS")]
  pub weights: Option<PathBuf>,

  #[arg(short, long, help = "Batch size of the random input")]
  #[arg(value_name = "BATCH", default_value = "1")]
  pub batch: usize,

  #[arg(short, long, help = "Diffusion timestep fed to every sample")]
  #[arg(value_name = "STEP", default_value = "10")]
  pub timestep: u32,

  #[arg(short, long, help = "Override the configured image size")]
  #[arg(value_name = "SIZE")]
  pub image_size: Option<usize>,

  #[arg(short = 'C', long, help = "Use CPU instead of GPU for inference")]
  pub use_cpu: bool,

  #[arg(short, long, help = "Print the ladder plan without building the model")]
  pub plan_only: bool,
}
