//! The block table: the heap region seen as an array of 8-byte cells.
//!
//! ```text
//!   One cell:
//!   ┌──────────┬──────────┬──────────────┬──────────────┐
//!   │ next u16 │ prev u16 │ next_free u16│ prev_free u16│
//!   └──────────┴──────────┴──────────────┴──────────────┘
//!   ◄───── header ──────► ◄──── body (payload of a USED block) ───►
//! ```
//!
//! Every block starts with a header. Blocks are linked by index, in address
//! order, through `next`/`prev`; the high bit of `next` tags a block as FREE.
//! A block's span is `next - index`, it is never stored. FREE blocks are also
//! threaded on a second ring through `next_free`/`prev_free`, which live in
//! the first payload bytes because a free block has no payload to protect.
//!
//! Block 0 is the sentinel: it heads both rings and is never handed out. The
//! last cell is a USED terminator whose `next` is 0.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::info::InlineMetrics;

/// Position of a block in the table.
pub type BlockIndex = u16;

/// Size of one cell in bytes.
pub const BLOCK_SIZE: usize = 8;
/// Bytes of header in front of every payload.
pub const HEADER_SIZE: usize = 4;
/// Payload bytes available in a block's first cell.
pub const BODY_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;
/// Largest table indices can address.
pub const MAX_BLOCKS: usize = 0x8000;
/// Sentinel, one free block and the terminator.
pub const MIN_BLOCKS: usize = 3;

pub(crate) const FREELIST_MASK: u16 = 0x8000;
pub(crate) const BLOCKNO_MASK: u16 = 0x7FFF;

const NEXT: usize = 0;
const PREV: usize = 2;
const NEXT_FREE: usize = 4;
const PREV_FREE: usize = 6;

/// Cells needed to serve a request of `size` bytes, header included.
pub fn blocks_for(size: usize) -> usize {
  if size <= BODY_SIZE {
    1
  } else {
    1 + (size - BODY_SIZE).div_ceil(BLOCK_SIZE)
  }
}

pub(crate) struct BlockTable<'a> {
  base: NonNull<u8>,
  count: usize,
  metrics: Option<InlineMetrics>,
  _region: PhantomData<&'a mut [u8]>,
}

impl<'a> BlockTable<'a> {
  /// Lays out an empty heap: the sentinel, one free block spanning every
  /// usable cell, and the terminator.
  ///
  /// # Safety
  ///
  /// `base` must be valid for reads and writes of `count * BLOCK_SIZE` bytes
  /// for `'a`, and `MIN_BLOCKS <= count <= MAX_BLOCKS`.
  pub unsafe fn init(
    base: NonNull<u8>,
    count: usize,
    inline_metrics: bool,
  ) -> Self {
    debug_assert!((MIN_BLOCKS..=MAX_BLOCKS).contains(&count));

    let mut table = Self {
      base,
      count,
      metrics: None,
      _region: PhantomData,
    };

    let first: BlockIndex = 1;
    let last = table.last();

    table.set_raw_next(0, first);
    table.set_raw_prev(0, last);
    table.set_next_free(0, first);
    table.set_prev_free(0, first);

    table.set_raw_next(first, last | FREELIST_MASK);
    table.set_raw_prev(first, 0);
    table.set_next_free(first, 0);
    table.set_prev_free(first, 0);

    table.set_raw_next(last, 0);
    table.set_raw_prev(last, first);

    if inline_metrics {
      table.metrics = Some(InlineMetrics::new(table.usable_blocks()));
    }

    table
  }

  pub fn count(&self) -> usize {
    self.count
  }

  /// Index of the terminator.
  pub fn last(&self) -> BlockIndex {
    (self.count - 1) as BlockIndex
  }

  /// Cells that can ever be handed out.
  pub fn usable_blocks(&self) -> usize {
    self.count - 2
  }

  pub fn metrics(&self) -> Option<&InlineMetrics> {
    self.metrics.as_ref()
  }

  pub fn block_addr(
    &self,
    block: BlockIndex,
  ) -> *mut u8 {
    debug_assert!((block as usize) < self.count, "block {block} out of range");
    self.base.as_ptr().wrapping_add(block as usize * BLOCK_SIZE)
  }

  /// Address of the payload, just past the header.
  pub fn data(
    &self,
    block: BlockIndex,
  ) -> *mut u8 {
    self.block_addr(block).wrapping_add(HEADER_SIZE)
  }

  pub fn contains(
    &self,
    ptr: *const u8,
  ) -> bool {
    let start = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= start && addr < start + self.count * BLOCK_SIZE
  }

  /// Block owning `ptr`. Truncates, so any address inside the first cell
  /// resolves to that block.
  pub fn index_of(
    &self,
    ptr: *const u8,
  ) -> BlockIndex {
    debug_assert!(self.contains(ptr), "{ptr:?} is not inside the heap");
    ((ptr as usize - self.base.as_ptr() as usize) / BLOCK_SIZE) as BlockIndex
  }

  fn field(
    &self,
    block: BlockIndex,
    offset: usize,
  ) -> *mut u16 {
    debug_assert!((block as usize) < self.count, "block {block} out of range");
    self
      .base
      .as_ptr()
      .wrapping_add(block as usize * BLOCK_SIZE + offset)
      .cast::<u16>()
  }

  fn read(
    &self,
    block: BlockIndex,
    offset: usize,
  ) -> u16 {
    // SAFETY: `field` stays inside the region as long as `block` is in range.
    unsafe { self.field(block, offset).read_unaligned() }
  }

  fn write(
    &mut self,
    block: BlockIndex,
    offset: usize,
    value: u16,
  ) {
    // SAFETY: see `read`.
    unsafe { self.field(block, offset).write_unaligned(value) }
  }

  pub fn raw_next(
    &self,
    block: BlockIndex,
  ) -> u16 {
    self.read(block, NEXT)
  }

  pub fn set_raw_next(
    &mut self,
    block: BlockIndex,
    value: u16,
  ) {
    self.write(block, NEXT, value);
  }

  pub fn raw_prev(
    &self,
    block: BlockIndex,
  ) -> u16 {
    self.read(block, PREV)
  }

  pub fn set_raw_prev(
    &mut self,
    block: BlockIndex,
    value: u16,
  ) {
    self.write(block, PREV, value);
  }

  pub fn next(
    &self,
    block: BlockIndex,
  ) -> BlockIndex {
    self.raw_next(block) & BLOCKNO_MASK
  }

  pub fn prev(
    &self,
    block: BlockIndex,
  ) -> BlockIndex {
    self.raw_prev(block) & BLOCKNO_MASK
  }

  pub fn next_free(
    &self,
    block: BlockIndex,
  ) -> BlockIndex {
    self.read(block, NEXT_FREE)
  }

  pub fn set_next_free(
    &mut self,
    block: BlockIndex,
    value: BlockIndex,
  ) {
    self.write(block, NEXT_FREE, value);
  }

  pub fn prev_free(
    &self,
    block: BlockIndex,
  ) -> BlockIndex {
    self.read(block, PREV_FREE)
  }

  pub fn set_prev_free(
    &mut self,
    block: BlockIndex,
    value: BlockIndex,
  ) {
    self.write(block, PREV_FREE, value);
  }

  pub fn is_free(
    &self,
    block: BlockIndex,
  ) -> bool {
    self.raw_next(block) & FREELIST_MASK != 0
  }

  /// Length of `block` in cells.
  pub fn span(
    &self,
    block: BlockIndex,
  ) -> usize {
    let next = self.next(block) as usize;
    let block = block as usize;

    if next > block {
      next - block
    } else {
      self.count - block
    }
  }

  /// Payload bytes `block` can hold.
  pub fn capacity(
    &self,
    block: BlockIndex,
  ) -> usize {
    self.span(block) * BLOCK_SIZE - HEADER_SIZE
  }

  /// Cuts `block` after `blocks` cells. The tail becomes a block of its own,
  /// tagged FREE when `tail_free` is set, but is not linked on the free ring;
  /// `block` loses its FREE tag.
  pub fn split(
    &mut self,
    block: BlockIndex,
    blocks: BlockIndex,
    tail_free: bool,
  ) -> BlockIndex {
    debug_assert!(blocks > 0 && (blocks as usize) < self.span(block));

    let tail = block + blocks;
    let next = self.next(block);
    let mask = if tail_free { FREELIST_MASK } else { 0 };

    self.set_raw_next(tail, next | mask);
    self.set_raw_prev(tail, block);
    self.set_raw_prev(next, tail);
    self.set_raw_next(block, tail);

    tail
  }

  /// Allocates the head of a free block. The tail stays FREE and takes over
  /// the block's position on the free ring.
  pub fn split_free(
    &mut self,
    block: BlockIndex,
    blocks: BlockIndex,
  ) -> BlockIndex {
    debug_assert!(self.is_free(block));

    self.metric_remove(block);
    let tail = self.split(block, blocks, true);
    self.replace_free(block, tail);
    self.metric_add(tail);

    tail
  }

  /// Moves the free-ring position of `old` to `new`.
  fn replace_free(
    &mut self,
    old: BlockIndex,
    new: BlockIndex,
  ) {
    let prev = self.prev_free(old);
    let next = self.next_free(old);

    self.set_next_free(prev, new);
    self.set_prev_free(new, prev);
    self.set_prev_free(next, new);
    self.set_next_free(new, next);
  }

  /// Tags `block` FREE and pushes it on the head of the free ring.
  pub fn mark_free(
    &mut self,
    block: BlockIndex,
  ) {
    debug_assert!(block != 0 && !self.is_free(block));

    let head = self.next_free(0);

    self.set_prev_free(head, block);
    self.set_next_free(block, head);
    self.set_prev_free(block, 0);
    self.set_next_free(0, block);
    self.set_raw_next(block, self.raw_next(block) | FREELIST_MASK);

    self.metric_add(block);
  }

  /// Unlinks `block` from the free ring and clears its FREE tag.
  pub fn mark_used(
    &mut self,
    block: BlockIndex,
  ) {
    debug_assert!(self.is_free(block));

    self.metric_remove(block);

    let prev = self.prev_free(block);
    let next = self.next_free(block);

    self.set_next_free(prev, next);
    self.set_prev_free(next, prev);
    self.set_raw_next(block, self.raw_next(block) & BLOCKNO_MASK);
  }

  /// Absorbs the following block into the USED `block` if it is FREE.
  pub fn merge_with_next(
    &mut self,
    block: BlockIndex,
  ) -> bool {
    debug_assert!(!self.is_free(block));

    let next = self.next(block);

    if !self.is_free(next) {
      return false;
    }

    self.mark_used(next);

    let after = self.next(next);
    self.set_raw_prev(after, block);
    self.set_raw_next(block, after);

    true
  }

  /// Lets the previous block absorb `block` and returns it.
  ///
  /// With `free` set the previous block must be FREE and stays on the free
  /// ring; otherwise it must already be unlinked and the result is USED.
  pub fn merge_into_prev(
    &mut self,
    block: BlockIndex,
    free: bool,
  ) -> BlockIndex {
    let prev = self.prev(block);
    let next = self.next(block);
    debug_assert_eq!(self.is_free(prev), free);

    if free {
      self.metric_remove(prev);
    }

    let mask = if free { FREELIST_MASK } else { 0 };
    self.set_raw_next(prev, next | mask);
    self.set_raw_prev(next, prev);

    if free {
      self.metric_add(prev);
    }

    prev
  }

  fn metric_add(
    &mut self,
    block: BlockIndex,
  ) {
    let span = self.span(block);
    if let Some(metrics) = &mut self.metrics {
      metrics.add(span);
    }
  }

  fn metric_remove(
    &mut self,
    block: BlockIndex,
  ) {
    let span = self.span(block);
    if let Some(metrics) = &mut self.metrics {
      metrics.remove(span);
    }
  }

  #[cfg(test)]
  pub fn bytes(&self) -> &[u8] {
    // SAFETY: the table owns the whole region for `'a`.
    unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.count * BLOCK_SIZE) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn with_table<F: FnOnce(&mut BlockTable<'_>)>(
    count: usize,
    f: F,
  ) {
    let mut words = vec![0u64; count];
    let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
    let mut table = unsafe { BlockTable::init(base, count, true) };
    f(&mut table);
  }

  #[test]
  fn test_blocks_for() {
    assert_eq!(blocks_for(1), 1);
    assert_eq!(blocks_for(4), 1);
    assert_eq!(blocks_for(5), 2);
    assert_eq!(blocks_for(12), 2);
    assert_eq!(blocks_for(13), 3);
    assert_eq!(blocks_for(20), 3);
  }

  #[test]
  fn test_init_layout() {
    with_table(16, |table| {
      assert_eq!(table.next(0), 1);
      assert_eq!(table.prev(0), 15);
      assert_eq!(table.next_free(0), 1);
      assert_eq!(table.prev_free(0), 1);

      assert!(table.is_free(1));
      assert_eq!(table.span(1), 14);
      assert_eq!(table.next_free(1), 0);

      assert!(!table.is_free(15));
      assert_eq!(table.next(15), 0);
      assert_eq!(table.span(15), 1);

      let metrics = table.metrics().unwrap();
      assert_eq!(metrics.free_blocks, 14);
      assert_eq!(metrics.free_entries, 1);
    });
  }

  #[test]
  fn test_index_address_round_trip() {
    with_table(8, |table| {
      for block in 0..8 {
        assert_eq!(table.index_of(table.data(block)), block);
        assert_eq!(table.index_of(table.block_addr(block)), block);
      }
    });
  }

  #[test]
  fn test_split_free_keeps_ring_position() {
    with_table(16, |table| {
      let tail = table.split_free(1, 3);

      assert_eq!(tail, 4);
      assert!(!table.is_free(1));
      assert!(table.is_free(4));
      assert_eq!(table.span(1), 3);
      assert_eq!(table.span(4), 11);
      assert_eq!(table.prev(4), 1);
      assert_eq!(table.prev(15), 4);
      assert_eq!(table.next_free(0), 4);
      assert_eq!(table.prev_free(0), 4);
      assert_eq!(table.metrics().unwrap().free_blocks, 11);
    });
  }

  #[test]
  fn test_mark_free_then_merge() {
    with_table(16, |table| {
      table.split_free(1, 2);
      table.split_free(3, 2);

      // 1 and 3 used, 5.. free
      table.mark_free(1);
      assert_eq!(table.next_free(0), 1);
      assert_eq!(table.next_free(1), 5);

      assert!(table.merge_with_next(3));
      assert_eq!(table.span(3), 12);
      assert_eq!(table.next_free(0), 1);
      assert_eq!(table.next_free(1), 0);

      let merged = table.merge_into_prev(3, true);
      assert_eq!(merged, 1);
      assert_eq!(table.span(1), 14);
      assert!(table.is_free(1));

      let metrics = table.metrics().unwrap();
      assert_eq!(metrics.free_blocks, 14);
      assert_eq!(metrics.free_entries, 1);
      assert_eq!(metrics.free_blocks_squared, 14 * 14);
    });
  }

  #[test]
  fn test_merge_with_used_neighbor_is_noop() {
    with_table(16, |table| {
      table.split_free(1, 2);
      table.split_free(3, 2);

      assert!(!table.merge_with_next(1));
      assert_eq!(table.span(1), 2);
    });
  }
}
