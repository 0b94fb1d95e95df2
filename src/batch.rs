//! Batched insert and search. Inputs are split into contiguous, disjoint
//! partitions, one scoped worker per partition; each worker writes into its
//! own pre-allocated slice of the output, so aggregation needs no locking and
//! preserves input order. Per-item failures never abort sibling items.

use crate::error::Error;
use crate::error::Result;
use crate::hnsw::HnswIndex;
use crate::Label;
use crate::NodeId;
use std::thread;

fn chunk_size(items: usize, parallelism: usize) -> usize {
  let workers = parallelism.clamp(1, items.max(1));
  items.div_ceil(workers).max(1)
}

impl HnswIndex {
  /// Inserts `vectors[i]` under `labels[i]`, fanning out over `parallelism`
  /// workers. Blocks until all workers finish. The returned vector holds one
  /// result per input, in input order.
  pub fn add_batch(
    &self,
    vectors: &[Vec<f32>],
    labels: &[Label],
    parallelism: usize,
  ) -> Result<Vec<Result<NodeId>>> {
    self.ensure_loaded()?;
    if vectors.len() != labels.len() {
      return Err(Error::Config(format!(
        "vectors and labels must have equal length ({} vs {})",
        vectors.len(),
        labels.len()
      )));
    }
    if vectors.is_empty() {
      return Ok(Vec::new());
    }

    let size = chunk_size(vectors.len(), parallelism);
    let mut out: Vec<Option<Result<NodeId>>> = Vec::with_capacity(vectors.len());
    out.resize_with(vectors.len(), || None);

    thread::scope(|s| {
      for ((vec_chunk, label_chunk), out_chunk) in vectors
        .chunks(size)
        .zip(labels.chunks(size))
        .zip(out.chunks_mut(size))
      {
        s.spawn(move || {
          for ((v, &label), slot) in vec_chunk.iter().zip(label_chunk).zip(out_chunk) {
            *slot = Some(self.add_point(v, label));
          }
        });
      }
    });

    Ok(
      out
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(Error::Corrupted("batch slot unfilled".to_string()))))
        .collect(),
    )
  }

  /// Top-k search for every query, fanned out as in `add_batch`.
  pub fn search_batch(
    &self,
    queries: &[Vec<f32>],
    k: usize,
    parallelism: usize,
  ) -> Result<Vec<Result<Vec<(Label, f32)>>>> {
    self.ensure_loaded()?;
    if queries.is_empty() {
      return Ok(Vec::new());
    }

    let size = chunk_size(queries.len(), parallelism);
    let mut out: Vec<Option<Result<Vec<(Label, f32)>>>> = Vec::with_capacity(queries.len());
    out.resize_with(queries.len(), || None);

    thread::scope(|s| {
      for (query_chunk, out_chunk) in queries.chunks(size).zip(out.chunks_mut(size)) {
        s.spawn(move || {
          for (q, slot) in query_chunk.iter().zip(out_chunk) {
            *slot = Some(self.search_knn(q, k));
          }
        });
      }
    });

    Ok(
      out
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(Error::Corrupted("batch slot unfilled".to_string()))))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::IndexConfig;
  use crate::metric::MetricKind;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
      .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
      .collect()
  }

  fn new_index(dim: usize, capacity: usize) -> HnswIndex {
    let cfg = IndexConfig::new(dim, MetricKind::L2, capacity)
      .with_m(16)
      .with_ef_construction(100)
      .with_random_seed(42);
    HnswIndex::new(cfg).unwrap()
  }

  #[test]
  fn add_batch_count_is_parallelism_independent() {
    let n = 200;
    let vectors = random_vectors(n, 4, 1);
    let labels: Vec<Label> = (0..n as Label).collect();

    for parallelism in [1usize, 2, 7, 16, 64] {
      let idx = new_index(4, n);
      let results = idx.add_batch(&vectors, &labels, parallelism).unwrap();
      assert_eq!(results.len(), n);
      assert!(results.iter().all(|r| r.is_ok()));
      assert_eq!(idx.get_current_element_count(), n);
      idx.check_integrity().unwrap();
    }
  }

  #[test]
  fn add_batch_membership_matches_sequential_insertion() {
    let n = 100;
    let vectors = random_vectors(n, 8, 3);
    let labels: Vec<Label> = (0..n as Label).collect();

    let idx = new_index(8, n);
    idx.add_batch(&vectors, &labels, 8).unwrap();
    idx.set_ef(n);

    for (v, &label) in vectors.iter().zip(&labels) {
      assert_eq!(idx.get_vector_by_label(label).unwrap().as_slice(), v.as_slice());
      let res = idx.search_knn(v, 1).unwrap();
      assert_eq!(res[0].0, label);
    }
  }

  #[test]
  fn add_batch_collects_per_item_errors_in_input_order() {
    let idx = new_index(2, 10);
    idx.add_point(&[0.0, 0.0], 5).unwrap();

    let vectors = vec![
      vec![1.0, 1.0],
      vec![2.0, 2.0],
      vec![3.0], // wrong dimension
      vec![4.0, 4.0],
    ];
    let labels = vec![1, 5, 2, 3]; // 5 duplicates the pre-inserted label

    let results = idx.add_batch(&vectors, &labels, 2).unwrap();
    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::DuplicateLabel(5))));
    assert!(matches!(results[2], Err(Error::DimensionMismatch { .. })));
    assert!(results[3].is_ok());
    assert_eq!(idx.get_current_element_count(), 3);
  }

  #[test]
  fn add_batch_rejects_length_mismatch() {
    let idx = new_index(2, 10);
    let vectors = vec![vec![0.0, 0.0]];
    let labels = vec![0, 1];
    assert!(matches!(
      idx.add_batch(&vectors, &labels, 2),
      Err(Error::Config(_))
    ));
  }

  #[test]
  fn search_batch_matches_single_searches() {
    let n = 80;
    let vectors = random_vectors(n, 6, 11);
    let labels: Vec<Label> = (0..n as Label).collect();
    let idx = new_index(6, n);
    idx.add_batch(&vectors, &labels, 4).unwrap();
    idx.set_ef(32);

    let queries = random_vectors(10, 6, 17);
    for parallelism in [1usize, 3, 10, 32] {
      let batched = idx.search_batch(&queries, 5, parallelism).unwrap();
      assert_eq!(batched.len(), queries.len());
      for (q, res) in queries.iter().zip(batched) {
        assert_eq!(res.unwrap(), idx.search_knn(q, 5).unwrap());
      }
    }
  }

  #[test]
  fn search_batch_reports_bad_queries_without_aborting_siblings() {
    let idx = new_index(3, 10);
    idx.add_point(&[0.0, 0.0, 0.0], 0).unwrap();

    let queries = vec![vec![0.0, 0.0, 0.0], vec![1.0], vec![1.0, 1.0, 1.0]];
    let results = idx.search_batch(&queries, 1, 2).unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::DimensionMismatch { .. })));
    assert!(results[2].is_ok());
  }

  #[test]
  fn empty_batches_are_no_ops() {
    let idx = new_index(2, 4);
    assert!(idx.add_batch(&[], &[], 4).unwrap().is_empty());
    assert!(idx.search_batch(&[], 3, 4).unwrap().is_empty());
  }
}
