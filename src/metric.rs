//! Distance computation. Each metric carries its own kernel, picked once at
//! construction based on available CPU features. Cosine shares the
//! inner-product kernel and pre-normalizes vectors instead.

/// Raw kernel over unchecked pointers: L2 returns the squared distance, the
/// inner-product kernel returns the dot product (the `1 - dot` conversion
/// happens in the safe wrapper).
type KernelFn = unsafe fn(*const f32, *const f32, usize) -> f32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
  L2,
  InnerProduct,
  Cosine,
}

impl MetricKind {
  /// Whether vectors must be L2-normalized before insertion and query.
  pub fn needs_normalization(self) -> bool {
    matches!(self, MetricKind::Cosine)
  }

  pub(crate) fn code(self) -> u8 {
    match self {
      MetricKind::L2 => 0,
      MetricKind::InnerProduct => 1,
      MetricKind::Cosine => 2,
    }
  }

  pub(crate) fn from_code(code: u8) -> Option<Self> {
    match code {
      0 => Some(MetricKind::L2),
      1 => Some(MetricKind::InnerProduct),
      2 => Some(MetricKind::Cosine),
      _ => None,
    }
  }
}

impl std::fmt::Display for MetricKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MetricKind::L2 => write!(f, "l2"),
      MetricKind::InnerProduct => write!(f, "ip"),
      MetricKind::Cosine => write!(f, "cosine"),
    }
  }
}

unsafe fn l2_sq_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut res = 0.0_f32;
  for i in 0..dim {
    let t = *a.add(i) - *b.add(i);
    res += t * t;
  }
  res
}

unsafe fn dot_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut dot = 0.0_f32;
  for i in 0..dim {
    dot += *a.add(i) * *b.add(i);
  }
  dot
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86 {
  use super::KernelFn;
  #[cfg(target_arch = "x86")]
  use std::arch::x86::*;
  #[cfg(target_arch = "x86_64")]
  use std::arch::x86_64::*;

  #[target_feature(enable = "sse")]
  pub unsafe fn l2_sq_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      let d = _mm_sub_ps(_mm_loadu_ps(a.add(i)), _mm_loadu_ps(b.add(i)));
      acc = _mm_add_ps(acc, _mm_mul_ps(d, d));
      i += 4;
    }
    let mut lanes = [0.0_f32; 4];
    _mm_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut res = lanes.iter().sum::<f32>();
    while i < dim {
      let t = *a.add(i) - *b.add(i);
      res += t * t;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn l2_sq_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      let d = _mm256_sub_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)));
      acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
      i += 8;
    }
    let mut lanes = [0.0_f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut res = lanes.iter().sum::<f32>();
    while i < dim {
      let t = *a.add(i) - *b.add(i);
      res += t * t;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn dot_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      acc = _mm_add_ps(acc, _mm_mul_ps(_mm_loadu_ps(a.add(i)), _mm_loadu_ps(b.add(i))));
      i += 4;
    }
    let mut lanes = [0.0_f32; 4];
    _mm_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut dot = lanes.iter().sum::<f32>();
    while i < dim {
      dot += *a.add(i) * *b.add(i);
      i += 1;
    }
    dot
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn dot_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      acc = _mm256_add_ps(
        acc,
        _mm256_mul_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i))),
      );
      i += 8;
    }
    let mut lanes = [0.0_f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut dot = lanes.iter().sum::<f32>();
    while i < dim {
      dot += *a.add(i) * *b.add(i);
      i += 1;
    }
    dot
  }

  pub fn pick_l2_sq() -> Option<KernelFn> {
    if std::is_x86_feature_detected!("avx") {
      return Some(l2_sq_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(l2_sq_sse);
    }
    None
  }

  pub fn pick_dot() -> Option<KernelFn> {
    if std::is_x86_feature_detected!("avx") {
      return Some(dot_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(dot_sse);
    }
    None
  }
}

/// Distance function bound to a metric and dimension.
#[derive(Clone)]
pub(crate) struct Distance {
  kind: MetricKind,
  dim: usize,
  kernel: KernelFn,
}

impl std::fmt::Debug for Distance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Distance")
      .field("kind", &self.kind)
      .field("dim", &self.dim)
      .finish()
  }
}

impl Distance {
  pub fn new(kind: MetricKind, dim: usize) -> Self {
    let kernel = match kind {
      MetricKind::L2 => {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        if let Some(f) = x86::pick_l2_sq() {
          return Self { kind, dim, kernel: f };
        }
        l2_sq_scalar as KernelFn
      }
      // Cosine runs over pre-normalized vectors, so it reuses the dot kernel.
      MetricKind::InnerProduct | MetricKind::Cosine => {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        if let Some(f) = x86::pick_dot() {
          return Self { kind, dim, kernel: f };
        }
        dot_scalar as KernelFn
      }
    };
    Self { kind, dim, kernel }
  }

  pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), self.dim);
    debug_assert_eq!(b.len(), self.dim);
    let raw = unsafe { (self.kernel)(a.as_ptr(), b.as_ptr(), self.dim) };
    match self.kind {
      MetricKind::L2 => raw,
      MetricKind::InnerProduct | MetricKind::Cosine => 1.0 - raw,
    }
  }
}

/// Scales `vector` to unit length. The epsilon keeps the zero vector finite
/// instead of dividing by zero.
pub fn normalize_in_place(vector: &mut [f32]) {
  let norm_sq = vector.iter().map(|v| v * v).sum::<f32>();
  let inv_norm = (norm_sq.sqrt() + 1e-15).recip();
  for v in vector.iter_mut() {
    *v *= inv_norm;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  fn l2_ref(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
      .zip(b.iter())
      .map(|(a, b)| {
        let d = a - b;
        d * d
      })
      .sum()
  }

  fn ip_ref(a: &[f32], b: &[f32]) -> f32 {
    1.0 - a.iter().zip(b.iter()).map(|(a, b)| a * b).sum::<f32>()
  }

  #[test]
  fn l2_matches_scalar_across_dims() {
    let mut rng = StdRng::seed_from_u64(123);
    let dims = [
      1usize, 2, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 63, 64, 65, 127, 128, 129, 255,
    ];
    for &dim in &dims {
      let dist = Distance::new(MetricKind::L2, dim);
      for _ in 0..50 {
        let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        assert_relative_eq!(
          dist.distance(&a, &b),
          l2_ref(&a, &b),
          epsilon = 1e-3,
          max_relative = 1e-3
        );
      }
    }
  }

  #[test]
  fn inner_product_matches_scalar_across_dims() {
    let mut rng = StdRng::seed_from_u64(456);
    let dims = [
      1usize, 2, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 63, 64, 65, 127, 128, 129, 255,
    ];
    for &dim in &dims {
      let dist = Distance::new(MetricKind::InnerProduct, dim);
      for _ in 0..50 {
        let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        assert_relative_eq!(
          dist.distance(&a, &b),
          ip_ref(&a, &b),
          epsilon = 1e-3,
          max_relative = 1e-3
        );
      }
    }
  }

  #[test]
  fn normalize_produces_unit_vectors() {
    let mut v = vec![3.0_f32, 4.0];
    normalize_in_place(&mut v);
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
  }

  #[test]
  fn normalize_zero_vector_stays_finite() {
    let mut v = vec![0.0_f32; 8];
    normalize_in_place(&mut v);
    assert!(v.iter().all(|x| x.is_finite()));
  }

  #[test]
  fn cosine_self_distance_is_near_zero() {
    let mut rng = StdRng::seed_from_u64(789);
    let dist = Distance::new(MetricKind::Cosine, 32);
    for _ in 0..20 {
      let mut v: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
      normalize_in_place(&mut v);
      assert_relative_eq!(dist.distance(&v, &v), 0.0, epsilon = 1e-5);
    }
  }

  #[test]
  fn metric_codes_round_trip() {
    for kind in [MetricKind::L2, MetricKind::InnerProduct, MetricKind::Cosine] {
      assert_eq!(MetricKind::from_code(kind.code()), Some(kind));
    }
    assert_eq!(MetricKind::from_code(3), None);
  }
}
