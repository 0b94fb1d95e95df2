use crate::error::Error;
use crate::error::Result;
use crate::metric::MetricKind;
use tracing::warn;

/// Construction parameters. Immutable after the index is built, except for
/// capacity which grows through `resize_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexConfig {
  /// Vector dimensionality.
  pub dim: usize,
  /// Max neighbors per node at layers >= 1. Layer 0 holds up to `2 * m`.
  pub m: usize,
  /// Candidate-set breadth during insertion.
  pub ef_construction: usize,
  /// Seed for the layer-assignment RNG.
  pub random_seed: u64,
  pub metric: MetricKind,
  /// Initial slot capacity. Grows via `resize_index`.
  pub capacity: usize,
}

impl IndexConfig {
  pub fn new(dim: usize, metric: MetricKind, capacity: usize) -> Self {
    Self {
      dim,
      m: 16,
      ef_construction: 200,
      random_seed: 100,
      metric,
      capacity,
    }
  }

  pub fn with_m(mut self, m: usize) -> Self {
    self.m = m;
    self
  }

  pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
    self.ef_construction = ef_construction;
    self
  }

  pub fn with_random_seed(mut self, random_seed: u64) -> Self {
    self.random_seed = random_seed;
    self
  }

  pub fn max_m0(&self) -> usize {
    self.m * 2
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.dim == 0 {
      return Err(Error::Config("dim must be > 0".to_string()));
    }
    if self.m == 0 {
      return Err(Error::Config("M must be > 0".to_string()));
    }
    if self.ef_construction == 0 {
      return Err(Error::Config("efConstruction must be > 0".to_string()));
    }
    if self.capacity == 0 {
      return Err(Error::Config("capacity must be > 0".to_string()));
    }
    if self.capacity > crate::NodeId::MAX as usize {
      return Err(Error::Config(
        "capacity exceeds internal id range".to_string(),
      ));
    }
    Ok(())
  }

  /// Validated copy with hnswlib's parameter clamps applied.
  pub(crate) fn normalized(&self) -> Result<Self> {
    self.validate()?;
    let mut cfg = self.clone();
    if cfg.m > 10_000 {
      warn!("M parameter exceeds 10000; capping to 10000");
      cfg.m = 10_000;
    }
    cfg.ef_construction = cfg.ef_construction.max(cfg.m);
    Ok(cfg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_zero_parameters() {
    let base = IndexConfig::new(4, MetricKind::L2, 10);
    assert!(base.validate().is_ok());

    let mut cfg = base.clone();
    cfg.dim = 0;
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));

    let mut cfg = base.clone();
    cfg.m = 0;
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));

    let mut cfg = base.clone();
    cfg.ef_construction = 0;
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));

    let mut cfg = base.clone();
    cfg.capacity = 0;
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));
  }

  #[test]
  fn normalized_raises_ef_construction_to_m() {
    let cfg = IndexConfig::new(4, MetricKind::L2, 10)
      .with_m(32)
      .with_ef_construction(8);
    let cfg = cfg.normalized().unwrap();
    assert_eq!(cfg.ef_construction, 32);
  }

  #[test]
  fn normalized_caps_m() {
    let cfg = IndexConfig::new(4, MetricKind::L2, 10).with_m(20_000);
    let cfg = cfg.normalized().unwrap();
    assert_eq!(cfg.m, 10_000);
  }
}
