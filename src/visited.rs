//! Reusable visited-set scratch for best-first search. Instead of clearing a
//! bitmap per query, each checkout bumps an epoch counter; a slot is visited
//! iff it holds the current epoch. The backing array is only zeroed when the
//! epoch wraps.

use parking_lot::Mutex;

pub type Epoch = u16;

#[derive(Debug)]
pub struct VisitedList {
  epoch: Epoch,
  slots: Vec<Epoch>,
}

impl VisitedList {
  pub fn new(num_elements: usize) -> Self {
    Self {
      epoch: Epoch::MAX,
      slots: vec![0; num_elements],
    }
  }

  fn advance(&mut self) -> Epoch {
    self.epoch = self.epoch.wrapping_add(1);
    if self.epoch == 0 {
      self.slots.fill(0);
      self.epoch = 1;
    }
    self.epoch
  }
}

#[derive(Debug)]
pub struct VisitedPool {
  pool: Mutex<Vec<VisitedList>>,
  num_elements: usize,
}

impl VisitedPool {
  pub fn new(num_elements: usize) -> Self {
    Self {
      pool: Mutex::new(Vec::new()),
      num_elements,
    }
  }

  /// Discards pooled lists; they are rebuilt lazily at the new size.
  pub fn resize(&mut self, num_elements: usize) {
    *self = Self::new(num_elements);
  }

  pub fn checkout(&self) -> VisitedGuard<'_> {
    let mut list = {
      let mut pool = self.pool.lock();
      pool
        .pop()
        .unwrap_or_else(|| VisitedList::new(self.num_elements))
    };
    let epoch = list.advance();
    VisitedGuard {
      pool: &self.pool,
      list: Some(list),
      epoch,
    }
  }
}

pub struct VisitedGuard<'a> {
  pool: &'a Mutex<Vec<VisitedList>>,
  list: Option<VisitedList>,
  epoch: Epoch,
}

impl VisitedGuard<'_> {
  #[inline]
  pub fn is_visited(&self, id: usize) -> bool {
    self.list.as_ref().is_some_and(|l| l.slots[id] == self.epoch)
  }

  #[inline]
  pub fn mark_visited(&mut self, id: usize) {
    if let Some(l) = self.list.as_mut() {
      l.slots[id] = self.epoch;
    }
  }
}

impl Drop for VisitedGuard<'_> {
  fn drop(&mut self) {
    if let Some(list) = self.list.take() {
      self.pool.lock().push(list);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checkout_reuse_does_not_leak_marks() {
    let pool = VisitedPool::new(8);
    {
      let mut g = pool.checkout();
      g.mark_visited(3);
      assert!(g.is_visited(3));
      assert!(!g.is_visited(4));
    }
    let g = pool.checkout();
    assert!(!g.is_visited(3));
  }

  #[test]
  fn concurrent_checkouts_are_independent() {
    let pool = VisitedPool::new(4);
    let mut a = pool.checkout();
    let mut b = pool.checkout();
    a.mark_visited(0);
    b.mark_visited(1);
    assert!(a.is_visited(0));
    assert!(!a.is_visited(1));
    assert!(b.is_visited(1));
    assert!(!b.is_visited(0));
  }

  #[test]
  fn epoch_wrap_clears_slots() {
    let mut list = VisitedList::new(2);
    list.slots[0] = Epoch::MAX;
    // First advance lands on 0 and wraps to 1 with a cleared backing array.
    let epoch = list.advance();
    assert_eq!(epoch, 1);
    assert_eq!(list.slots[0], 0);
  }
}
