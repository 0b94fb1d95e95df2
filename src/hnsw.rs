use crate::config::IndexConfig;
use crate::error::Error;
use crate::error::Result;
use crate::metric::normalize_in_place;
use crate::metric::Distance;
use crate::visited::VisitedPool;
use crate::Label;
use crate::NodeId;
use ahash::HashMap;
use ahash::HashMapExt;
use arc_swap::ArcSwapOption;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::cmp::max;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const LABEL_OP_LOCK_STRIPES: usize = 1024;

/// Per-layer adjacency for one slot. `layers.len()` is the assigned layer + 1
/// once the slot is occupied; layer 0 first.
#[derive(Debug, Default)]
struct LinkTable {
  layers: Vec<Vec<NodeId>>,
}

/// Max-heap entry ordered by distance.
type Candidate = (OrderedFloat<f32>, NodeId);

#[derive(Debug)]
pub struct HnswIndex {
  cfg: IndexConfig,
  dist: Distance,
  /// `1 / ln(M)`, the scale of the exponential layer draw.
  mult: f64,

  visited: VisitedPool,

  /// Held for write by `save`; held for read by every mutation, so a snapshot
  /// never observes a half-applied insert.
  mutation_lock: RwLock<()>,
  /// Striped by label hash; serializes operations on the same label.
  label_op_locks: Vec<Mutex<()>>,
  /// Protects entry point and max layer handoff.
  global: Mutex<()>,

  label_lookup: Mutex<HashMap<Label, NodeId>>,

  cur_element_count: AtomicUsize,
  num_deleted: AtomicUsize,

  ef: AtomicUsize,
  max_layer: AtomicI32,
  /// `NodeId::MAX` means empty.
  entry_point: AtomicU32,

  labels: Vec<AtomicU32>,
  layers_of: Vec<AtomicU32>,
  deleted: Vec<AtomicBool>,
  vectors: Vec<ArcSwapOption<Vec<f32>>>,
  links: Vec<Mutex<LinkTable>>,

  level_rng: Mutex<StdRng>,

  unloaded: AtomicBool,
}

impl HnswIndex {
  pub fn new(config: IndexConfig) -> Result<Self> {
    let cfg = config.normalized()?;
    let dist = Distance::new(cfg.metric, cfg.dim);
    let mult = 1.0 / (cfg.m as f64).ln().max(f64::MIN_POSITIVE);
    let capacity = cfg.capacity;

    let mut label_op_locks = Vec::with_capacity(LABEL_OP_LOCK_STRIPES);
    label_op_locks.resize_with(LABEL_OP_LOCK_STRIPES, || Mutex::new(()));

    let mut labels = Vec::with_capacity(capacity);
    labels.resize_with(capacity, || AtomicU32::new(0));
    let mut layers_of = Vec::with_capacity(capacity);
    layers_of.resize_with(capacity, || AtomicU32::new(0));
    let mut deleted = Vec::with_capacity(capacity);
    deleted.resize_with(capacity, || AtomicBool::new(false));
    let mut vectors = Vec::with_capacity(capacity);
    vectors.resize_with(capacity, ArcSwapOption::empty);
    let mut links = Vec::with_capacity(capacity);
    links.resize_with(capacity, || Mutex::new(LinkTable::default()));

    let level_rng = Mutex::new(StdRng::seed_from_u64(cfg.random_seed));

    Ok(Self {
      dist,
      mult,
      visited: VisitedPool::new(capacity),
      mutation_lock: RwLock::new(()),
      label_op_locks,
      global: Mutex::new(()),
      label_lookup: Mutex::new(HashMap::new()),
      cur_element_count: AtomicUsize::new(0),
      num_deleted: AtomicUsize::new(0),
      ef: AtomicUsize::new(10),
      max_layer: AtomicI32::new(-1),
      entry_point: AtomicU32::new(NodeId::MAX),
      labels,
      layers_of,
      deleted,
      vectors,
      links,
      level_rng,
      unloaded: AtomicBool::new(false),
      cfg,
    })
  }

  pub fn config(&self) -> &IndexConfig {
    &self.cfg
  }

  pub fn dim(&self) -> usize {
    self.cfg.dim
  }

  pub fn set_ef(&self, ef: usize) {
    self.ef.store(ef, Ordering::Release);
  }

  pub fn get_max_elements(&self) -> usize {
    self.cfg.capacity
  }

  pub fn get_current_element_count(&self) -> usize {
    self.cur_element_count.load(Ordering::Acquire)
  }

  pub fn get_delete_count(&self) -> usize {
    self.num_deleted.load(Ordering::Acquire)
  }

  pub(crate) fn ensure_loaded(&self) -> Result<()> {
    if self.unloaded.load(Ordering::Acquire) {
      return Err(Error::IndexUnloaded);
    }
    Ok(())
  }

  fn entry_point_id(&self) -> Option<NodeId> {
    let raw = self.entry_point.load(Ordering::Acquire);
    if raw == NodeId::MAX {
      None
    } else {
      Some(raw)
    }
  }

  fn label_op_lock(&self, label: Label) -> &Mutex<()> {
    &self.label_op_locks[label as usize & (LABEL_OP_LOCK_STRIPES - 1)]
  }

  fn layer_cap(&self, layer: usize) -> usize {
    if layer == 0 {
      self.cfg.max_m0()
    } else {
      self.cfg.m
    }
  }

  /// Snapshot of a slot's neighbor list at one layer.
  fn neighbors(&self, id: NodeId, layer: usize) -> Result<Vec<NodeId>> {
    let table = self
      .links
      .get(id as usize)
      .ok_or_else(|| Error::Corrupted(format!("internal id {id} out of bounds")))?
      .lock();
    table
      .layers
      .get(layer)
      .cloned()
      .ok_or_else(|| Error::Corrupted(format!("slot {id} has no layer {layer}")))
  }

  fn vector(&self, id: NodeId) -> Result<Arc<Vec<f32>>> {
    self
      .vectors
      .get(id as usize)
      .ok_or_else(|| Error::Corrupted(format!("internal id {id} out of bounds")))?
      .load_full()
      .ok_or_else(|| Error::Corrupted(format!("slot {id} has no vector")))
  }

  fn distance_to(&self, query: &[f32], id: NodeId) -> Result<f32> {
    Ok(self.dist.distance(query, self.vector(id)?.as_slice()))
  }

  fn distance_between(&self, a: NodeId, b: NodeId) -> Result<f32> {
    Ok(self.dist.distance(self.vector(a)?.as_slice(), self.vector(b)?.as_slice()))
  }

  fn is_deleted(&self, id: NodeId) -> bool {
    self
      .deleted
      .get(id as usize)
      .is_some_and(|d| d.load(Ordering::Acquire))
  }

  /// Exponential layer draw with scale `1/ln(M)`, floored. Unbounded above.
  fn random_layer(&self) -> usize {
    let mut u: f64 = self.level_rng.lock().gen();
    if u == 0.0 {
      u = f64::MIN_POSITIVE;
    }
    (-u.ln() * self.mult) as usize
  }

  /// Single greedy step loop: follow strictly-improving neighbors at `layer`
  /// until a local minimum.
  fn greedy_descend(&self, query: &[f32], start: NodeId, layer: usize) -> Result<(NodeId, f32)> {
    let mut curr = start;
    let mut curr_dist = self.distance_to(query, curr)?;
    let mut changed = true;
    while changed {
      changed = false;
      for cand in self.neighbors(curr, layer)? {
        let d = self.distance_to(query, cand)?;
        if d < curr_dist {
          curr_dist = d;
          curr = cand;
          changed = true;
        }
      }
    }
    Ok((curr, curr_dist))
  }

  /// Best-first expansion at one layer. Returns a max-heap of at most `ef`
  /// candidates; tombstoned nodes are traversed but excluded from the heap.
  fn search_layer(
    &self,
    entry: NodeId,
    query: &[f32],
    layer: usize,
    ef: usize,
  ) -> Result<BinaryHeap<Candidate>> {
    let mut visited = self.visited.checkout();

    let mut found: BinaryHeap<Candidate> = BinaryHeap::new();
    // Min-order via negated distances.
    let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();

    let mut worst_dist;
    if self.is_deleted(entry) {
      worst_dist = f32::INFINITY;
      frontier.push((OrderedFloat(-worst_dist), entry));
    } else {
      let d = self.distance_to(query, entry)?;
      worst_dist = d;
      found.push((OrderedFloat(d), entry));
      frontier.push((OrderedFloat(-d), entry));
    }
    visited.mark_visited(entry as usize);

    while let Some((neg_dist, curr)) = frontier.pop() {
      let curr_dist = -neg_dist.0;
      if curr_dist > worst_dist && found.len() == ef {
        break;
      }

      for cand in self.neighbors(curr, layer)? {
        if visited.is_visited(cand as usize) {
          continue;
        }
        visited.mark_visited(cand as usize);

        let d = self.distance_to(query, cand)?;
        if found.len() < ef || worst_dist > d {
          frontier.push((OrderedFloat(-d), cand));
          if !self.is_deleted(cand) {
            found.push((OrderedFloat(d), cand));
          }
          if found.len() > ef {
            found.pop();
          }
          if let Some((worst, _)) = found.peek() {
            worst_dist = worst.0;
          }
        }
      }
    }

    Ok(found)
  }

  /// hnswlib's diversity heuristic: walk candidates nearest-first, keeping one
  /// only if it is closer to the query than to every neighbor already kept.
  /// Returns at most `m` ids, ascending by distance to the query.
  fn select_neighbors(&self, candidates: BinaryHeap<Candidate>, m: usize) -> Result<Vec<NodeId>> {
    if candidates.len() <= m {
      let mut out: Vec<Candidate> = candidates.into_vec();
      out.sort_unstable();
      return Ok(out.into_iter().map(|(_, id)| id).collect());
    }

    let mut nearest_first: Vec<Candidate> = candidates.into_vec();
    nearest_first.sort_unstable();

    let mut selected: Vec<NodeId> = Vec::with_capacity(m);
    for (dist_to_query, cand) in nearest_first {
      if selected.len() >= m {
        break;
      }
      let mut keep = true;
      for &chosen in &selected {
        if self.distance_between(chosen, cand)? < dist_to_query.0 {
          keep = false;
          break;
        }
      }
      if keep {
        selected.push(cand);
      }
    }
    Ok(selected)
  }

  /// Adds `new_id` to each selected neighbor's list, re-running the selection
  /// heuristic when a list would exceed its layer cap. Skips neighbors that
  /// already link back (relevant for in-place updates).
  fn connect_backlinks(&self, new_id: NodeId, selected: &[NodeId], layer: usize) -> Result<()> {
    let cap = self.layer_cap(layer);

    for &neighbor in selected {
      if neighbor == new_id {
        return Err(Error::Corrupted("self link".to_string()));
      }

      // The lock is held across reselection so a concurrent backlink cannot
      // be overwritten. Distance lookups take no locks, so this cannot
      // deadlock.
      let mut table = self.links[neighbor as usize].lock();
      if table.layers.len() <= layer {
        return Err(Error::Corrupted(format!(
          "slot {neighbor} has no layer {layer}"
        )));
      }
      if table.layers[layer].contains(&new_id) {
        continue;
      }
      if table.layers[layer].len() < cap {
        // Room left: link without pruning.
        table.layers[layer].push(new_id);
        continue;
      }

      // Over cap: rebuild the neighbor's list from its current links plus the
      // new element, using the same diversity heuristic.
      let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
      candidates.push((OrderedFloat(self.distance_between(new_id, neighbor)?), new_id));
      for &other in &table.layers[layer] {
        candidates.push((OrderedFloat(self.distance_between(other, neighbor)?), other));
      }
      let pruned = self.select_neighbors(candidates, cap)?;
      table.layers[layer] = pruned;
    }

    Ok(())
  }

  /// Inserts a vector under a new label.
  ///
  /// Validation happens before any graph write: the vector length must equal
  /// the configured dimension, the label must be unknown, and a free slot
  /// must exist. Cosine indexes normalize the vector first.
  pub fn add_point(&self, vector: &[f32], label: Label) -> Result<NodeId> {
    self.ensure_loaded()?;
    if vector.len() != self.cfg.dim {
      return Err(Error::DimensionMismatch {
        expected: self.cfg.dim,
        actual: vector.len(),
      });
    }
    let mut vector = vector.to_vec();
    if self.cfg.metric.needs_normalization() {
      normalize_in_place(&mut vector);
    }

    let _label_guard = self.label_op_lock(label).lock();
    let _mutation_guard = self.mutation_lock.read();
    self.insert(Arc::new(vector), label)
  }

  fn insert(&self, vector: Arc<Vec<f32>>, label: Label) -> Result<NodeId> {
    let new_id: NodeId;
    {
      let mut lookup = self.label_lookup.lock();
      if lookup.contains_key(&label) {
        return Err(Error::DuplicateLabel(label));
      }
      let count = self.cur_element_count.load(Ordering::Acquire);
      if count >= self.cfg.capacity {
        return Err(Error::IndexFull {
          max_elements: self.cfg.capacity,
        });
      }
      new_id = count as NodeId;
      self.cur_element_count.store(count + 1, Ordering::Release);
      lookup.insert(label, new_id);
    }

    let new_layer = self.random_layer();

    self.labels[new_id as usize].store(label, Ordering::Release);
    self.layers_of[new_id as usize].store(new_layer as u32, Ordering::Release);
    self.deleted[new_id as usize].store(false, Ordering::Release);
    self.vectors[new_id as usize].store(Some(Arc::clone(&vector)));
    {
      let mut table = self.links[new_id as usize].lock();
      table.layers.clear();
      table.layers.resize(new_layer + 1, Vec::new());
    }

    let query = vector.as_slice();

    // Take the global lock only when this insert may move the entry point.
    let mut entry_guard = Some(self.global.lock());
    let max_layer = self.max_layer.load(Ordering::Acquire);
    if (new_layer as i32) <= max_layer {
      entry_guard.take();
    }

    let Some(entry) = self.entry_point_id() else {
      // First element becomes the entry point.
      self.entry_point.store(new_id, Ordering::Release);
      self.max_layer.store(new_layer as i32, Ordering::Release);
      return Ok(new_id);
    };

    let mut curr = entry;
    if (new_layer as i32) < max_layer {
      for layer in (new_layer + 1..=max_layer as usize).rev() {
        (curr, _) = self.greedy_descend(query, curr, layer)?;
      }
    }

    let entry_deleted = self.is_deleted(entry);
    let top_link_layer = new_layer.min(max_layer.max(0) as usize);

    // Phase 1: fill the new slot's own lists top-down, remembering selections.
    let mut selected_per_layer: Vec<Vec<NodeId>> = vec![Vec::new(); top_link_layer + 1];
    for layer in (0..=top_link_layer).rev() {
      let mut candidates = self.search_layer(curr, query, layer, self.cfg.ef_construction)?;
      if entry_deleted {
        // The entry may be the only reachable node; keep it linkable.
        candidates.push((OrderedFloat(self.distance_to(query, entry)?), entry));
        if candidates.len() > self.cfg.ef_construction {
          candidates.pop();
        }
      }

      let selected = self.select_neighbors(candidates, self.cfg.m)?;
      let &closest = selected
        .first()
        .ok_or_else(|| Error::Corrupted("no linkable neighbors found".to_string()))?;

      {
        let mut table = self.links[new_id as usize].lock();
        table.layers[layer] = selected.clone();
      }
      selected_per_layer[layer] = selected;
      curr = closest;
    }

    // Phase 2: publish backlinks.
    for layer in (0..=top_link_layer).rev() {
      self.connect_backlinks(new_id, &selected_per_layer[layer], layer)?;
    }

    if (new_layer as i32) > max_layer {
      debug_assert!(entry_guard.is_some());
      self.entry_point.store(new_id, Ordering::Release);
      self.max_layer.store(new_layer as i32, Ordering::Release);
    }

    Ok(new_id)
  }

  /// Replaces the vector stored under an existing label and repairs the links
  /// around it. Distinct from `add_point`, which rejects known labels.
  pub fn update_point(&self, vector: &[f32], label: Label) -> Result<()> {
    self.ensure_loaded()?;
    if vector.len() != self.cfg.dim {
      return Err(Error::DimensionMismatch {
        expected: self.cfg.dim,
        actual: vector.len(),
      });
    }
    let mut vector = vector.to_vec();
    if self.cfg.metric.needs_normalization() {
      normalize_in_place(&mut vector);
    }

    let _label_guard = self.label_op_lock(label).lock();
    let _mutation_guard = self.mutation_lock.read();

    let id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;

    let vector = Arc::new(vector);
    self.vectors[id as usize].store(Some(Arc::clone(&vector)));

    let entry = self.entry_point_id().ok_or(Error::EmptyIndex)?;
    if entry == id && self.get_current_element_count() == 1 {
      return Ok(());
    }

    let node_layer = self.layers_of[id as usize].load(Ordering::Acquire) as usize;

    // Refresh the neighborhoods that referenced the moved point: every 1-hop
    // neighbor reselects its links from the surrounding 2-hop candidate set.
    for layer in 0..=node_layer {
      let one_hop = self.neighbors(id, layer)?;
      if one_hop.is_empty() {
        continue;
      }

      let mut candidate_pool: ahash::HashSet<NodeId> = ahash::HashSet::default();
      candidate_pool.insert(id);
      for &n in &one_hop {
        candidate_pool.insert(n);
        for two_hop in self.neighbors(n, layer)? {
          candidate_pool.insert(two_hop);
        }
      }

      let cap = self.layer_cap(layer);
      for &neighbor in &one_hop {
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        for &cand in candidate_pool.iter() {
          if cand == neighbor {
            continue;
          }
          candidates.push((OrderedFloat(self.distance_between(neighbor, cand)?), cand));
        }
        if candidates.is_empty() {
          continue;
        }
        let reselected = self.select_neighbors(candidates, cap)?;
        let mut table = self.links[neighbor as usize].lock();
        table.layers[layer] = reselected;
      }
    }

    self.repair_own_links(vector.as_slice(), id, node_layer)?;
    Ok(())
  }

  fn repair_own_links(&self, query: &[f32], id: NodeId, node_layer: usize) -> Result<()> {
    // Same load order as `search_knn`: max layer first, then the entry.
    let max_layer = self.max_layer.load(Ordering::Acquire).max(0) as usize;
    let entry = self.entry_point_id().ok_or(Error::EmptyIndex)?;

    let mut curr = entry;
    if node_layer < max_layer {
      for layer in (node_layer + 1..=max_layer).rev() {
        (curr, _) = self.greedy_descend(query, curr, layer)?;
      }
    }

    for layer in (0..=node_layer.min(max_layer)).rev() {
      let found = self.search_layer(curr, query, layer, self.cfg.ef_construction)?;
      // The point being repaired must not select itself.
      let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
      for (d, cand) in found {
        if cand != id {
          candidates.push((d, cand));
        }
      }
      if candidates.is_empty() {
        continue;
      }

      let selected = self.select_neighbors(candidates, self.cfg.m)?;
      let &closest = selected
        .first()
        .ok_or_else(|| Error::Corrupted("no linkable neighbors found".to_string()))?;
      {
        let mut table = self.links[id as usize].lock();
        table.layers[layer] = selected.clone();
      }
      self.connect_backlinks(id, &selected, layer)?;
      curr = closest;
    }
    Ok(())
  }

  /// Top-k search. Tombstoned nodes are routed through but never returned.
  /// Returns at most `k` `(label, distance)` pairs, ascending by distance;
  /// fewer when fewer live nodes are reachable. `k == 0` and searches against
  /// an empty index answer with an empty result rather than an error.
  pub fn search_knn(&self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>> {
    self.ensure_loaded()?;
    if query.len() != self.cfg.dim {
      return Err(Error::DimensionMismatch {
        expected: self.cfg.dim,
        actual: query.len(),
      });
    }
    if k == 0 || self.get_current_element_count() == 0 {
      return Ok(Vec::new());
    }

    let mut owned;
    let query = if self.cfg.metric.needs_normalization() {
      owned = query.to_vec();
      normalize_in_place(&mut owned);
      owned.as_slice()
    } else {
      query
    };

    // The max layer is read before the entry point. An insert that raises the
    // graph publishes the entry first, so this order never pairs a stale
    // entry with the raised layer.
    let max_layer = self.max_layer.load(Ordering::Acquire).max(0) as usize;
    let entry = self.entry_point_id().ok_or(Error::EmptyIndex)?;

    let mut curr = entry;
    for layer in (1..=max_layer).rev() {
      (curr, _) = self.greedy_descend(query, curr, layer)?;
    }

    let ef = max(self.ef.load(Ordering::Acquire), k);
    let mut found = self.search_layer(curr, query, 0, ef)?;

    while found.len() > k {
      found.pop();
    }
    let mut results = Vec::with_capacity(found.len());
    while let Some((dist, id)) = found.pop() {
      results.push((self.labels[id as usize].load(Ordering::Acquire), dist.0));
    }
    results.reverse();
    Ok(results)
  }

  /// Tombstones a label. `Ok(true)` when the flag flipped; marking an
  /// already-deleted label is a no-op returning `Ok(false)`.
  pub fn mark_delete(&self, label: Label) -> Result<bool> {
    self.ensure_loaded()?;
    let _label_guard = self.label_op_lock(label).lock();
    let _mutation_guard = self.mutation_lock.read();
    let id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    if self.deleted[id as usize].swap(true, Ordering::AcqRel) {
      return Ok(false);
    }
    self.num_deleted.fetch_add(1, Ordering::AcqRel);
    Ok(true)
  }

  /// Restores a tombstoned label. `Ok(false)` when it was not deleted.
  pub fn unmark_delete(&self, label: Label) -> Result<bool> {
    self.ensure_loaded()?;
    let _label_guard = self.label_op_lock(label).lock();
    let _mutation_guard = self.mutation_lock.read();
    let id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    if !self.deleted[id as usize].swap(false, Ordering::AcqRel) {
      return Ok(false);
    }
    self.num_deleted.fetch_sub(1, Ordering::AcqRel);
    Ok(true)
  }

  pub fn is_marked_deleted(&self, label: Label) -> Result<bool> {
    self.ensure_loaded()?;
    let id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    Ok(self.is_deleted(id))
  }

  /// Stored vector for a live label (post-normalization for cosine indexes).
  /// Tombstoned labels report `LabelNotFound`.
  pub fn get_vector_by_label(&self, label: Label) -> Result<Arc<Vec<f32>>> {
    self.ensure_loaded()?;
    let id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    if self.is_deleted(id) {
      return Err(Error::LabelNotFound(label));
    }
    self.vector(id)
  }

  /// Grows slot capacity. Existing ids, vectors, and links are untouched.
  /// Requires exclusive access; shrinking below the live count is rejected.
  pub fn resize_index(&mut self, new_capacity: usize) -> Result<()> {
    self.ensure_loaded()?;
    let count = self.cur_element_count.load(Ordering::Acquire);
    if new_capacity < count {
      return Err(Error::ResizeTooSmall {
        requested: new_capacity,
        current: count,
      });
    }
    if new_capacity > NodeId::MAX as usize {
      return Err(Error::Config(
        "capacity exceeds internal id range".to_string(),
      ));
    }

    self.labels.resize_with(new_capacity, || AtomicU32::new(0));
    self
      .layers_of
      .resize_with(new_capacity, || AtomicU32::new(0));
    self
      .deleted
      .resize_with(new_capacity, || AtomicBool::new(false));
    self.vectors.resize_with(new_capacity, ArcSwapOption::empty);
    self
      .links
      .resize_with(new_capacity, || Mutex::new(LinkTable::default()));
    self.visited.resize(new_capacity);
    self.cfg.capacity = new_capacity;
    Ok(())
  }

  /// Releases all backing storage in one step and invalidates the index.
  /// Every later call fails with `IndexUnloaded`, as does a second unload.
  pub fn unload(&mut self) -> Result<()> {
    if self.unloaded.swap(true, Ordering::AcqRel) {
      return Err(Error::IndexUnloaded);
    }
    self.labels = Vec::new();
    self.layers_of = Vec::new();
    self.deleted = Vec::new();
    self.vectors = Vec::new();
    self.links = Vec::new();
    self.label_lookup.lock().clear();
    self.visited.resize(0);
    self.cur_element_count.store(0, Ordering::Release);
    self.num_deleted.store(0, Ordering::Release);
    self.entry_point.store(NodeId::MAX, Ordering::Release);
    self.max_layer.store(-1, Ordering::Release);
    Ok(())
  }

  /// Structural sanity check used by tests: ids in range, no self loops, no
  /// duplicate edges, list lengths within layer caps.
  pub fn check_integrity(&self) -> Result<()> {
    self.ensure_loaded()?;
    let _mutation_guard = self.mutation_lock.write();
    let count = self.get_current_element_count();
    for id in 0..count {
      let node_layer = self.layers_of[id].load(Ordering::Acquire) as usize;
      for layer in 0..=node_layer {
        let list = self.neighbors(id as NodeId, layer)?;
        if list.len() > self.layer_cap(layer) {
          return Err(Error::Corrupted(format!(
            "slot {id} exceeds layer {layer} cap"
          )));
        }
        let mut seen = ahash::HashSet::default();
        for to in list {
          if to as usize >= count {
            return Err(Error::Corrupted(format!("edge to unoccupied slot {to}")));
          }
          if to as usize == id {
            return Err(Error::Corrupted(format!("self loop at slot {id}")));
          }
          if !seen.insert(to) {
            return Err(Error::Corrupted(format!("duplicate edge at slot {id}")));
          }
        }
      }
    }
    Ok(())
  }

  // Snapshot accessors; the wire format lives in `snapshot`.

  pub(crate) fn snapshot_guard(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
    self.mutation_lock.write()
  }

  pub(crate) fn entry_point_raw(&self) -> u32 {
    self.entry_point.load(Ordering::Acquire)
  }

  pub(crate) fn max_layer_raw(&self) -> i32 {
    self.max_layer.load(Ordering::Acquire)
  }

  pub(crate) fn record(&self, id: NodeId) -> Result<(Label, bool, u32, Arc<Vec<f32>>)> {
    let label = self.labels[id as usize].load(Ordering::Acquire);
    let deleted = self.is_deleted(id);
    let layer = self.layers_of[id as usize].load(Ordering::Acquire);
    Ok((label, deleted, layer, self.vector(id)?))
  }

  pub(crate) fn restore_record(
    &self,
    id: NodeId,
    label: Label,
    deleted: bool,
    layer: u32,
    vector: Vec<f32>,
    layers: Vec<Vec<NodeId>>,
  ) -> Result<()> {
    let mut lookup = self.label_lookup.lock();
    if lookup.insert(label, id).is_some() {
      return Err(Error::Snapshot(format!("duplicate label {label}")));
    }
    self.labels[id as usize].store(label, Ordering::Release);
    self.layers_of[id as usize].store(layer, Ordering::Release);
    self.deleted[id as usize].store(deleted, Ordering::Release);
    if deleted {
      self.num_deleted.fetch_add(1, Ordering::AcqRel);
    }
    self.vectors[id as usize].store(Some(Arc::new(vector)));
    self.links[id as usize].lock().layers = layers;
    Ok(())
  }

  pub(crate) fn restore_graph_state(&self, count: usize, entry_point: u32, max_layer: i32) {
    self.cur_element_count.store(count, Ordering::Release);
    self.entry_point.store(entry_point, Ordering::Release);
    self.max_layer.store(max_layer, Ordering::Release);
  }

  pub(crate) fn node_neighbors(&self, id: NodeId, layer: usize) -> Result<Vec<NodeId>> {
    self.neighbors(id, layer)
  }
}
