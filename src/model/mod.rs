mod backbone;
mod blocks;
mod conditioning;
mod layers;
mod pathway;
mod plan;

pub use backbone::*;
pub use blocks::*;
pub use conditioning::*;
pub use layers::*;
pub use pathway::*;
pub use plan::*;
