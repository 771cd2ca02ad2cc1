//! Protected sections around heap mutation.
//!
//! The engine brackets every public operation with [`CriticalSection::enter`]
//! and [`CriticalSection::exit`]. Those calls nest: `reallocate` frees its
//! surplus through the public `free`, and the integrity checker protects
//! itself even when it runs inside an allocation. Implementations must only
//! take and release the real lock (mask interrupts, grab a mutex, ...) on the
//! outermost pair.

use core::cell::Cell;

pub trait CriticalSection {
  fn enter(&self);
  fn exit(&self);
}

/// No protection at all, for heaps that are only touched from one context.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSection;

impl CriticalSection for NoopSection {
  #[inline]
  fn enter(&self) {}

  #[inline]
  fn exit(&self) {}
}

/// Depth-counting section used to verify nesting in tests.
///
/// Only the 0 -> 1 transition counts as an acquisition; that is where an
/// embedder would mask interrupts.
#[derive(Debug, Default)]
pub struct DepthCounter {
  depth: Cell<usize>,
  max_depth: Cell<usize>,
  acquisitions: Cell<usize>,
}

impl DepthCounter {
  pub const fn new() -> Self {
    Self {
      depth: Cell::new(0),
      max_depth: Cell::new(0),
      acquisitions: Cell::new(0),
    }
  }

  pub fn depth(&self) -> usize {
    self.depth.get()
  }

  /// Deepest nesting observed since construction or the last reset.
  pub fn max_depth(&self) -> usize {
    self.max_depth.get()
  }

  /// How many times the outermost section was entered.
  pub fn acquisitions(&self) -> usize {
    self.acquisitions.get()
  }

  pub fn reset(&self) {
    self.max_depth.set(self.depth.get());
    self.acquisitions.set(0);
  }
}

impl CriticalSection for DepthCounter {
  fn enter(&self) {
    let depth = self.depth.get() + 1;

    if depth == 1 {
      self.acquisitions.set(self.acquisitions.get() + 1);
    }

    self.depth.set(depth);

    if depth > self.max_depth.get() {
      self.max_depth.set(depth);
    }
  }

  fn exit(&self) {
    let depth = self.depth.get();
    debug_assert!(depth > 0, "critical section exit without matching enter");
    self.depth.set(depth.saturating_sub(1));
  }
}

impl<T: CriticalSection + ?Sized> CriticalSection for &T {
  fn enter(&self) {
    (**self).enter();
  }

  fn exit(&self) {
    (**self).exit();
  }
}
