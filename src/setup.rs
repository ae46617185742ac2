use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use echo_dnd::{BackboneConfig, BackboneError};

use crate::cli::Cli;

pub fn setup_tracing() {
  let subscriber = FmtSubscriber::builder()
    .with_max_level(Level::INFO)
    .with_target(false)
    .finish();

  tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");
}

/// 64px, three levels, attention at half resolution.
fn default_config() -> BackboneConfig {
  BackboneConfig::new(64, 32, 2, 1, 1, [2]).with_channel_mult(vec![1, 2, 4])
}

pub fn setup_args(args: &Cli) -> echo_dnd::Result<BackboneConfig> {
  if args.plan_only && args.weights.is_some() {
    tracing::warn!("Nothing is loaded with `--plan-only`! Ignoring `--weights`...");
  }

  if args.batch == 0 {
    return Err(BackboneError::config("batch size must be positive"));
  }

  let mut config = match &args.config {
    Some(path) => BackboneConfig::from_json_file(path)?,
    None => default_config(),
  };

  if let Some(image_size) = args.image_size {
    config.image_size = image_size;
  }

  let downsamples = config.channel_mult.len().saturating_sub(1);
  if config.image_size % (1 << downsamples) != 0 {
    tracing::warn!(
      "Image size {} is not divisible by {}, skip shapes will not line up",
      config.image_size,
      1 << downsamples
    );
  }

  config.validate()?;
  Ok(config)
}
