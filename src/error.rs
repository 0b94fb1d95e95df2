use crate::Label;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("invalid config: {0}")]
  Config(String),

  #[error("dimension mismatch: expected {expected}, got {actual}")]
  DimensionMismatch { expected: usize, actual: usize },

  #[error("label already exists: {0}")]
  DuplicateLabel(Label),

  #[error("label not found: {0}")]
  LabelNotFound(Label),

  #[error("index is full (max_elements={max_elements})")]
  IndexFull { max_elements: usize },

  #[error("cannot shrink below current element count ({current} live, {requested} requested)")]
  ResizeTooSmall { requested: usize, current: usize },

  #[error("invalid snapshot: {0}")]
  Snapshot(String),

  #[error("index has been unloaded")]
  IndexUnloaded,

  #[error("index is empty")]
  EmptyIndex,

  #[error("graph corrupted: {0}")]
  Corrupted(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
