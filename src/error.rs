use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackboneError {
  #[error("candle error: {0}")]
  Candle(#[from] candle_core::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("invalid shape: expected {expected}, got {got}")]
  Shape { expected: String, got: String },

  #[error("{0}")]
  ClassConditioning(String),

  #[error("unsupported: {0}")]
  Unsupported(String),
}

impl BackboneError {
  pub fn config(msg: impl Into<String>) -> Self {
    Self::Config(msg.into())
  }

  pub fn shape(expected: impl ToString, got: impl ToString) -> Self {
    Self::Shape {
      expected: expected.to_string(),
      got: got.to_string(),
    }
  }
}

pub type Result<T> = std::result::Result<T, BackboneError>;
