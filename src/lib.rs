pub mod config;
pub mod error;
pub mod model;
pub mod utils;

pub use config::{BackboneConfig, Precision, SpatialDims};
pub use error::{BackboneError, Result};
pub use model::{mirror_pathway_init, BackboneOutput, DualPathwayBackbone};
