use std::{collections::VecDeque, fmt};

use smallvec::{smallvec, SmallVec};

use crate::{
  config::{BackboneConfig, SpatialDims},
  error::BackboneError,
  model::blocks::{resolve_heads, AttentionBlock, Direction},
};

/// One layer of a ladder stage, with its channel counts resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPlan {
  InputConv {
    in_channels: usize,
    out_channels: usize,
  },
  Residual {
    in_channels: usize,
    out_channels: usize,
    resample: Option<Direction>,
  },
  Attention {
    channels: usize,
    num_heads: usize,
  },
  Resample {
    direction: Direction,
    channels: usize,
    out_channels: usize,
  },
}

impl LayerPlan {
  pub fn is_attention(&self) -> bool {
    matches!(self, LayerPlan::Attention { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
  pub layers: SmallVec<[LayerPlan; 3]>,
  /// Downsample factor of the stage input.
  pub ds: usize,
  /// Channels of the skip tensor concatenated onto the input, decoder only.
  pub skip_channels: Option<usize>,
  pub out_channels: usize,
}

impl StagePlan {
  fn new(layers: SmallVec<[LayerPlan; 3]>, ds: usize, out_channels: usize) -> Self {
    Self {
      layers,
      ds,
      skip_channels: None,
      out_channels,
    }
  }

  pub fn has_attention(&self) -> bool {
    self.layers.iter().any(LayerPlan::is_attention)
  }
}

/// Output channels of every encoder stage, in build order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelLedger {
  recorded: Vec<usize>,
}

impl ChannelLedger {
  pub fn record(&mut self, channels: usize) {
    self.recorded.push(channels);
  }

  /// Reorders the ledger for the decoder, deepest stage first.
  pub fn into_decoder_queue(self) -> DecoderQueue {
    DecoderQueue {
      pending: self.recorded.into_iter().rev().collect(),
      taken: 0,
    }
  }
}

/// Skip widths handed to decoder stages in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderQueue {
  pending: VecDeque<usize>,
  taken: usize,
}

impl DecoderQueue {
  pub fn next_skip(&mut self) -> crate::Result<usize> {
    let Some(channels) = self.pending.pop_front() else {
      return Err(BackboneError::config(format!(
        "decoder stage {} has no matching encoder stage",
        self.taken
      )));
    };
    self.taken += 1;
    Ok(channels)
  }

  /// Fails unless every recorded encoder stage was consumed.
  pub fn finish(self) -> crate::Result<()> {
    if !self.pending.is_empty() {
      return Err(BackboneError::config(format!(
        "{} encoder stages left unconsumed after {} decoder stages",
        self.pending.len(),
        self.taken
      )));
    }

    Ok(())
  }
}

/// Tensor-free layout of one pathway: what every stage contains, at which
/// downsample factor it runs and how many channels it produces. Both
/// pathways are built from the same plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderPlan {
  pub encoder: Vec<StagePlan>,
  pub middle: StagePlan,
  pub decoder: Vec<StagePlan>,
  pub feature_size: usize,
  dims: SpatialDims,
}

impl LadderPlan {
  pub fn from_config(config: &BackboneConfig) -> crate::Result<Self> {
    config.validate()?;

    let mc = config.model_channels;
    let heads = |channels: usize, num_heads: usize| {
      resolve_heads(channels, num_heads, config.num_head_channels)
    };
    let last_level = config.channel_mult.len() - 1;

    let mut ledger = ChannelLedger::default();
    let mut encoder = vec![StagePlan::new(
      smallvec![LayerPlan::InputConv {
        in_channels: config.in_channels,
        out_channels: mc,
      }],
      1,
      mc,
    )];
    ledger.record(mc);

    let mut feature_size = mc;
    let mut ch = mc;
    let mut ds = 1;

    for (level, &mult) in config.channel_mult.iter().enumerate() {
      for _ in 0..config.num_res_blocks {
        let out_channels = mult * mc;
        let mut layers: SmallVec<[LayerPlan; 3]> = smallvec![LayerPlan::Residual {
          in_channels: ch,
          out_channels,
          resample: None,
        }];
        ch = out_channels;

        if config.attention_resolutions.contains(&ds) {
          layers.push(LayerPlan::Attention {
            channels: ch,
            num_heads: heads(ch, config.num_heads)?,
          });
        }

        encoder.push(StagePlan::new(layers, ds, ch));
        ledger.record(ch);
        feature_size += ch;
      }

      if level != last_level {
        let layer = if config.resblock_updown {
          LayerPlan::Residual {
            in_channels: ch,
            out_channels: ch,
            resample: Some(Direction::Down),
          }
        } else {
          LayerPlan::Resample {
            direction: Direction::Down,
            channels: ch,
            out_channels: ch,
          }
        };

        encoder.push(StagePlan::new(smallvec![layer], ds, ch));
        ledger.record(ch);
        ds *= 2;
        feature_size += ch;
      }
    }

    let middle = StagePlan::new(
      smallvec![
        LayerPlan::Residual {
          in_channels: ch,
          out_channels: ch,
          resample: None,
        },
        LayerPlan::Attention {
          channels: ch,
          num_heads: heads(ch, config.num_heads)?,
        },
        LayerPlan::Residual {
          in_channels: ch,
          out_channels: ch,
          resample: None,
        },
      ],
      ds,
      ch,
    );
    feature_size += ch;

    let mut queue = ledger.into_decoder_queue();
    let mut decoder = Vec::with_capacity(encoder.len());

    for (level, &mult) in config.channel_mult.iter().enumerate().rev() {
      for i in 0..=config.num_res_blocks {
        let skip = queue.next_skip()?;
        let out_channels = mult * mc;
        let mut layers: SmallVec<[LayerPlan; 3]> = smallvec![LayerPlan::Residual {
          in_channels: ch + skip,
          out_channels,
          resample: None,
        }];
        ch = out_channels;

        if config.attention_resolutions.contains(&ds) {
          layers.push(LayerPlan::Attention {
            channels: ch,
            num_heads: heads(ch, config.heads_upsample())?,
          });
        }

        let stage_ds = ds;
        if level != 0 && i == config.num_res_blocks {
          layers.push(if config.resblock_updown {
            LayerPlan::Residual {
              in_channels: ch,
              out_channels: ch,
              resample: Some(Direction::Up),
            }
          } else {
            LayerPlan::Resample {
              direction: Direction::Up,
              channels: ch,
              out_channels: ch,
            }
          });
          ds /= 2;
        }

        decoder.push(StagePlan {
          layers,
          ds: stage_ds,
          skip_channels: Some(skip),
          out_channels: ch,
        });
        feature_size += ch;
      }
    }
    queue.finish()?;

    Ok(Self {
      encoder,
      middle,
      decoder,
      feature_size,
      dims: config.dims,
    })
  }

  /// Channels entering the output head.
  pub fn final_channels(&self) -> usize {
    self
      .decoder
      .last()
      .map_or(self.middle.out_channels, |stage| stage.out_channels)
  }

  pub fn stages(&self) -> impl Iterator<Item = &StagePlan> {
    self
      .encoder
      .iter()
      .chain(std::iter::once(&self.middle))
      .chain(self.decoder.iter())
  }

  /// Attention matmul cost of one pathway for a `(batch, _, *spatial)`
  /// input.
  pub fn attention_flops(&self, batch: usize, spatial: &[usize]) -> u64 {
    self
      .stages()
      .flat_map(|stage| {
        stage.layers.iter().filter_map(move |layer| match layer {
          LayerPlan::Attention { channels, .. } => {
            let mut shape = vec![batch, *channels];
            shape.extend(self.spatial_at(spatial, stage.ds));
            Some(AttentionBlock::count_flops(&shape))
          }
          _ => None,
        })
      })
      .sum()
  }

  fn spatial_at(&self, spatial: &[usize], ds: usize) -> Vec<usize> {
    spatial
      .iter()
      .enumerate()
      .map(|(axis, &size)| {
        // depth is never resampled
        if self.dims == SpatialDims::Three && axis == 0 {
          size
        } else {
          size / ds
        }
      })
      .collect()
  }
}

impl fmt::Display for LayerPlan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LayerPlan::InputConv {
        in_channels,
        out_channels,
      } => write!(f, "conv {in_channels}->{out_channels}"),
      LayerPlan::Residual {
        in_channels,
        out_channels,
        resample,
      } => {
        write!(f, "res {in_channels}->{out_channels}")?;
        match resample {
          Some(Direction::Up) => write!(f, " up"),
          Some(Direction::Down) => write!(f, " down"),
          None => Ok(()),
        }
      }
      LayerPlan::Attention {
        channels,
        num_heads,
      } => write!(f, "attn {channels}x{num_heads}h"),
      LayerPlan::Resample {
        direction,
        channels,
        out_channels,
      } => {
        let op = match direction {
          Direction::Up => "upsample",
          Direction::Down => "downsample",
        };
        write!(f, "{op} {channels}->{out_channels}")
      }
    }
  }
}

fn write_stage(f: &mut fmt::Formatter<'_>, name: &str, stage: &StagePlan) -> fmt::Result {
  write!(f, "{name:>10} ds={:<3}", stage.ds)?;
  if let Some(skip) = stage.skip_channels {
    write!(f, " +skip {skip:<4}")?;
  }
  for layer in &stage.layers {
    write!(f, " | {layer}")?;
  }
  writeln!(f)
}

impl fmt::Display for LadderPlan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, stage) in self.encoder.iter().enumerate() {
      write_stage(f, &format!("input.{i}"), stage)?;
    }
    write_stage(f, "middle", &self.middle)?;
    for (i, stage) in self.decoder.iter().enumerate() {
      write_stage(f, &format!("output.{i}"), stage)?;
    }
    write!(f, "feature size {}", self.feature_size)
  }
}
