//! Heap health statistics.
//!
//! [`Heap::info`] walks every block once and fills a [`HeapInfo`]. With
//! inline metrics enabled the free-block counters are also kept up to date by
//! the block table, so the free size, usage and fragmentation queries answer
//! without walking.

use core::ptr;

use log::Level;

use crate::block::BLOCK_SIZE;
use crate::critical::CriticalSection;
use crate::heap::Heap;

/// Result of the last heap walk. Entries count blocks, blocks count cells.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
  pub total_entries: usize,
  pub used_entries: usize,
  pub free_entries: usize,

  pub total_blocks: usize,
  pub used_blocks: usize,
  pub free_blocks: usize,
  pub free_blocks_squared: usize,

  pub max_free_contiguous_blocks: usize,
}

/// Free-block counters maintained on every free-ring insert and removal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InlineMetrics {
  pub free_entries: usize,
  pub free_blocks: usize,
  pub free_blocks_squared: usize,
}

impl InlineMetrics {
  pub fn new(free_blocks: usize) -> Self {
    Self {
      free_entries: 1,
      free_blocks,
      free_blocks_squared: free_blocks * free_blocks,
    }
  }

  pub fn add(
    &mut self,
    span: usize,
  ) {
    self.free_entries += 1;
    self.free_blocks += span;
    self.free_blocks_squared += span * span;
  }

  pub fn remove(
    &mut self,
    span: usize,
  ) {
    self.free_entries -= 1;
    self.free_blocks -= span;
    self.free_blocks_squared -= span * span;
  }
}

/// `used * 100 / free`, or `None` when nothing is free.
fn usage(
  used_blocks: usize,
  free_blocks: usize,
) -> Option<usize> {
  (free_blocks != 0).then(|| used_blocks * 100 / free_blocks)
}

/// 0 for a single free block, approaching 100 as free space splinters.
fn fragmentation(
  free_blocks: usize,
  free_blocks_squared: usize,
) -> usize {
  if free_blocks == 0 {
    0
  } else {
    100 - free_blocks_squared.isqrt() * 100 / free_blocks
  }
}

impl<C: CriticalSection> Heap<'_, C> {
  fn info_enabled(&self) -> bool {
    self.config.info || self.config.inline_metrics
  }

  /// Snapshot filled by the last call to [`Heap::info`].
  pub fn heap_info(&self) -> &HeapInfo {
    &self.info
  }

  /// Walks the heap and refreshes [`Heap::heap_info`].
  ///
  /// Returns `ptr` as soon as it is found to be the address of a free block,
  /// leaving the snapshot partial, and null otherwise. `force` logs the block
  /// table at `info` level instead of `trace`.
  pub fn info(
    &mut self,
    ptr: *const u8,
    force: bool,
  ) -> *const u8 {
    if !self.info_enabled() {
      return ptr::null();
    }

    let level = if force { Level::Info } else { Level::Trace };

    self.protected(|heap| {
      let table = &heap.table;
      let mut info = HeapInfo::default();

      heap_log!(heap, log, level, "+----------+-------+--------+--------+-------+--------+--------+");

      let mut block = table.next(0);
      while table.next(block) != 0 {
        let span = table.span(block);
        info.total_entries += 1;
        info.total_blocks += span;

        if table.is_free(block) {
          info.free_entries += 1;
          info.free_blocks += span;
          info.free_blocks_squared += span * span;
          info.max_free_contiguous_blocks = info.max_free_contiguous_blocks.max(span);

          heap_log!(
            heap,
            log,
            level,
            "|{:p}|B {block:5}|NB {:5}|PB {:5}|Z {span:5}|NF {:5}|PF {:5}|",
            table.block_addr(block),
            table.next(block),
            table.prev(block),
            table.next_free(block),
            table.prev_free(block),
          );

          if ptr::eq(ptr, table.block_addr(block)) {
            heap.info = info;
            return ptr;
          }
        } else {
          info.used_entries += 1;
          info.used_blocks += span;

          heap_log!(
            heap,
            log,
            level,
            "|{:p}|B {block:5}|NB {:5}|PB {:5}|Z {span:5}|",
            table.block_addr(block),
            table.next(block),
            table.prev(block),
          );
        }

        block = table.next(block);
      }

      heap_log!(
        heap,
        log,
        level,
        "|{:p}|B {block:5}|NB {:5}|PB {:5}|Z {:5}|NF {:5}|PF {:5}|",
        table.block_addr(block),
        table.next(block),
        table.prev(block),
        table.span(block),
        table.next_free(0),
        table.prev_free(0),
      );
      heap_log!(
        heap,
        log,
        level,
        "Total Entries {:5}    Used Entries {:5}    Free Entries {:5}",
        info.total_entries,
        info.used_entries,
        info.free_entries
      );
      heap_log!(
        heap,
        log,
        level,
        "Total Blocks  {:5}    Used Blocks  {:5}    Free Blocks  {:5}",
        info.total_blocks,
        info.used_blocks,
        info.free_blocks
      );
      heap_log!(
        heap,
        log,
        level,
        "Usage Metric: {:?}    Fragmentation Metric: {}",
        usage(info.used_blocks, info.free_blocks),
        fragmentation(info.free_blocks, info.free_blocks_squared)
      );

      heap.info = info;
      ptr::null()
    })
  }

  /// Free cells and the sum of their squares, from the inline counters when
  /// they are kept, from a fresh walk otherwise.
  fn free_counts(&mut self) -> (usize, usize) {
    if let Some(metrics) = self.table.metrics() {
      return (metrics.free_blocks, metrics.free_blocks_squared);
    }

    self.info(ptr::null(), false);
    (self.info.free_blocks, self.info.free_blocks_squared)
  }

  /// Bytes held by free blocks, headers included.
  pub fn free_heap_size(&mut self) -> usize {
    if !self.info_enabled() {
      return 0;
    }

    self.free_counts().0 * BLOCK_SIZE
  }

  /// Bytes in the largest free block. Always walks the heap.
  pub fn max_free_block_size(&mut self) -> usize {
    if !self.info_enabled() {
      return 0;
    }

    self.info(ptr::null(), false);
    self.info.max_free_contiguous_blocks * BLOCK_SIZE
  }

  /// Used cells per hundred free cells; `None` when the heap is full.
  pub fn usage_metric(&mut self) -> Option<usize> {
    if !self.info_enabled() {
      return None;
    }

    let (free, _) = self.free_counts();
    usage(self.table.usable_blocks() - free, free)
  }

  /// 0 when all free space is one block, higher as it is split up.
  pub fn fragmentation_metric(&mut self) -> usize {
    if !self.info_enabled() {
      return 0;
    }

    let (free, squared) = self.free_counts();
    fragmentation(free, squared)
  }
}
