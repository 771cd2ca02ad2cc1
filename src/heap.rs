use core::ptr::{self, NonNull};

use log::{debug, warn};

use crate::align_to;
use crate::block::{BLOCK_SIZE, BlockIndex, BlockTable, MAX_BLOCKS, MIN_BLOCKS, blocks_for};
use crate::config::{FitStrategy, HeapConfig};
use crate::critical::{CriticalSection, NoopSection};
use crate::error::{Corruption, HeapError};
use crate::info::HeapInfo;

/// Statically allocated storage for a heap, aligned to a whole cell.
///
/// ```rust
/// use umheap::{Heap, HeapConfig, HeapRegion};
///
/// let mut region = HeapRegion::<1024>::new();
/// let mut heap = Heap::new(region.as_mut_slice(), HeapConfig::default()).unwrap();
///
/// let ptr = heap.allocate(32);
/// assert!(!ptr.is_null());
/// unsafe { heap.free(ptr) };
/// ```
#[repr(C, align(8))]
pub struct HeapRegion<const N: usize>([u8; N]);

impl<const N: usize> HeapRegion<N> {
  pub const fn new() -> Self {
    Self([0; N])
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.0
  }
}

impl<const N: usize> Default for HeapRegion<N> {
  fn default() -> Self {
    Self::new()
  }
}

/// A heap carved out of one caller-supplied region.
///
/// Every public operation runs inside the `C` protected section. Pointers
/// returned by the heap are 4-byte aligned when the region is 8-byte aligned.
pub struct Heap<'a, C: CriticalSection = NoopSection> {
  pub(crate) table: BlockTable<'a>,
  pub(crate) config: HeapConfig,
  pub(crate) info: HeapInfo,
  critical: C,
  corruptions: usize,
}

// SAFETY: the heap exclusively owns its region; every access goes through
// `&mut self`.
unsafe impl<C: CriticalSection + Send> Send for Heap<'_, C> {}

impl<'a> Heap<'a, NoopSection> {
  pub fn new(
    region: &'a mut [u8],
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    Self::with_critical_section(region, config, NoopSection)
  }
}

impl<'a, C: CriticalSection> Heap<'a, C> {
  /// Builds a heap whose operations are bracketed by `critical`.
  ///
  /// The start of `region` is rounded up to a whole cell and anything past
  /// `MAX_BLOCKS` cells is left unused.
  pub fn with_critical_section(
    region: &'a mut [u8],
    config: HeapConfig,
    critical: C,
  ) -> Result<Self, HeapError> {
    let len = region.len();
    let start = region.as_ptr() as usize;
    let skip = align_to!(start, BLOCK_SIZE) - start;
    let available = len.saturating_sub(skip) / BLOCK_SIZE;

    if available < MIN_BLOCKS {
      return Err(HeapError::RegionTooSmall {
        len,
        min: MIN_BLOCKS * BLOCK_SIZE + skip,
      });
    }

    if available > MAX_BLOCKS && config.logging {
      warn!(
        "heap region holds {available} blocks, only {MAX_BLOCKS} are addressable"
      );
    }

    let count = available.min(MAX_BLOCKS);
    let base = NonNull::from(region).cast::<u8>();

    // SAFETY: `skip + count * BLOCK_SIZE <= len`, and the region is borrowed
    // for `'a`.
    let table = unsafe { BlockTable::init(base.add(skip), count, config.inline_metrics) };

    if config.logging {
      debug!(
        "heap initialized at {:?}: {count} blocks of {BLOCK_SIZE} bytes, {:?}",
        table.block_addr(0),
        config.strategy
      );
    }

    Ok(Self {
      table,
      config,
      info: HeapInfo::default(),
      critical,
      corruptions: 0,
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn critical_section(&self) -> &C {
    &self.critical
  }

  /// Corruptions reported since the heap was built.
  pub fn corruption_count(&self) -> usize {
    self.corruptions
  }

  /// Total number of cells, sentinel and terminator included.
  pub fn block_count(&self) -> usize {
    self.table.count()
  }

  pub(crate) fn protected<R>(
    &mut self,
    f: impl FnOnce(&mut Self) -> R,
  ) -> R {
    self.critical.enter();
    let result = f(self);
    self.critical.exit();
    result
  }

  pub(crate) fn report(
    &mut self,
    corruption: Corruption,
  ) {
    self.corruptions += 1;
    (self.config.on_corruption)(&corruption);
  }

  fn check_before(
    &mut self,
    operation: &str,
  ) -> bool {
    if !self.config.integrity_check {
      return true;
    }

    let ok = self.integrity_check();
    if !ok {
      heap_log!(self, warn, "{operation} refused: heap failed its integrity check");
    }
    ok
  }

  fn check_after(&mut self) {
    if self.config.integrity_check {
      self.integrity_check();
    }
  }

  /// Allocates `size` bytes. Returns null when `size` is zero or when no
  /// free block is large enough; the heap is left untouched in both cases.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    if size == 0 {
      heap_log!(self, debug, "allocate 0 bytes -> null");
      return ptr::null_mut();
    }

    self.protected(|heap| {
      if !heap.check_before("allocate") {
        return ptr::null_mut();
      }

      let ptr = heap.allocate_core(size);
      heap.check_after();
      ptr
    })
  }

  /// Allocates `count * size` zeroed bytes; null on overflow or exhaustion.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      heap_log!(self, warn, "zero_allocate({count}, {size}) overflows");
      return ptr::null_mut();
    };

    self.protected(|heap| {
      let ptr = heap.allocate(total);

      if !ptr.is_null() {
        // SAFETY: the block behind `ptr` holds at least `total` bytes.
        unsafe { ptr::write_bytes(ptr, 0, total) };
      }

      ptr
    })
  }

  /// Returns a block to the heap, merging it with free neighbors.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this heap.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    if ptr.is_null() {
      heap_log!(self, debug, "free a null pointer -> do nothing");
      return;
    }

    self.protected(|heap| {
      if !heap.check_before("free") {
        return;
      }

      // SAFETY: forwarded from the caller.
      unsafe { heap.free_core(ptr) };
      heap.check_after();
    });
  }

  /// Resizes the allocation behind `ptr`, in place when possible.
  ///
  /// A null `ptr` allocates, a zero `size` frees and returns null. When the
  /// block has to move and no room is left, null is returned and `ptr` stays
  /// valid with its contents untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this heap.
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    if ptr.is_null() {
      heap_log!(self, debug, "realloc the null pointer -> allocate");
      return self.allocate(size);
    }

    if size == 0 {
      heap_log!(self, debug, "realloc to 0 size -> free the block");
      // SAFETY: forwarded from the caller.
      unsafe { self.free(ptr) };
      return ptr::null_mut();
    }

    self.protected(|heap| {
      if !heap.check_before("reallocate") {
        return ptr::null_mut();
      }

      // SAFETY: forwarded from the caller.
      let result = unsafe { heap.reallocate_core(ptr, size) };
      heap.check_after();
      result
    })
  }

  /// Finds a free block of at least `blocks` cells.
  fn find_free(
    &self,
    blocks: usize,
  ) -> Option<BlockIndex> {
    let mut best: Option<(BlockIndex, usize)> = None;
    let mut block = self.table.next_free(0);

    while block != 0 {
      let span = self.table.span(block);
      heap_log!(self, trace, "looking at free block {block} of {span} blocks");

      if span >= blocks {
        match self.config.strategy {
          FitStrategy::FirstFit => return Some(block),
          FitStrategy::BestFit => {
            if best.is_none_or(|(_, best_span)| span < best_span) {
              best = Some((block, span));

              if span == blocks {
                break;
              }
            }
          }
        }
      }

      block = self.table.next_free(block);
    }

    best.map(|(block, _)| block)
  }

  fn allocate_core(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    let blocks = blocks_for(size);

    let Some(block) = self.find_free(blocks) else {
      heap_log!(self, warn, "can't allocate {blocks} blocks for {size} bytes");
      return ptr::null_mut();
    };

    if self.table.span(block) == blocks {
      heap_log!(self, debug, "allocating {blocks} blocks starting at {block} - exact");
      self.table.mark_used(block);
    } else {
      heap_log!(self, debug, "allocating {blocks} blocks starting at {block} - split");
      self.table.split_free(block, blocks as BlockIndex);
    }

    self.table.data(block)
  }

  /// # Safety
  ///
  /// `ptr` must be a live pointer returned by this heap.
  unsafe fn free_core(
    &mut self,
    ptr: *mut u8,
  ) {
    let block = self.table.index_of(ptr);
    debug_assert!(!self.table.is_free(block), "block {block} freed twice");
    heap_log!(self, debug, "freeing block {block}");

    self.table.merge_with_next(block);

    if self.table.is_free(self.table.prev(block)) {
      heap_log!(self, debug, "assimilate block {block} down into the previous free block");
      self.table.merge_into_prev(block, true);
    } else {
      self.table.mark_free(block);
    }
  }

  /// # Safety
  ///
  /// `ptr` must be a live pointer returned by this heap.
  unsafe fn reallocate_core(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    let blocks = blocks_for(size);
    let mut block = self.table.index_of(ptr);
    let mut span = self.table.span(block);
    let payload = self.table.capacity(block);

    let next = self.table.next(block);
    let prev = self.table.prev(block);
    let next_span = if self.table.is_free(next) { self.table.span(next) } else { 0 };
    let prev_span = if self.table.is_free(prev) { self.table.span(prev) } else { 0 };

    let mut ptr = ptr;

    if span >= blocks {
      heap_log!(self, debug, "realloc block {block} to {blocks} blocks - keep it");
    } else if span + next_span >= blocks {
      heap_log!(self, debug, "realloc block {block} to {blocks} blocks - using next block");
      self.table.merge_with_next(block);
      span += next_span;
    } else if prev_span + span + next_span >= blocks {
      if prev_span + span < blocks {
        heap_log!(self, debug, "realloc block {block} to {blocks} blocks - using prev and next block");
        self.table.merge_with_next(block);
        span += next_span;
      } else {
        heap_log!(self, debug, "realloc block {block} to {blocks} blocks - using prev block");
      }

      self.table.mark_used(prev);
      block = self.table.merge_into_prev(block, false);
      span += prev_span;

      let moved = self.table.data(block);
      // SAFETY: both ranges lie inside the merged block; `copy` allows overlap.
      unsafe { ptr::copy(ptr, moved, payload) };
      ptr = moved;
    } else {
      heap_log!(self, debug, "realloc block {block} to {blocks} blocks - new block");
      let moved = self.allocate_core(size);

      if moved.is_null() {
        heap_log!(self, warn, "realloc of block {block} to {size} bytes failed, old block kept");
        return ptr::null_mut();
      }

      // SAFETY: distinct live blocks, each holding at least the copied length.
      unsafe {
        ptr::copy_nonoverlapping(ptr, moved, payload.min(size));
        self.free(ptr);
      }

      return moved;
    }

    if span > blocks {
      heap_log!(self, debug, "split and free {} blocks from {block}", span - blocks);
      let tail = self.table.split(block, blocks as BlockIndex, false);
      // SAFETY: `tail` was just cut off as a USED block of this heap.
      unsafe { self.free(self.table.data(tail)) };
    }

    ptr
  }
}


#[cfg(test)]
mod tests {
  use super::testing::*;
  use super::*;
  use crate::critical::DepthCounter;

  #[test]
  fn test_region_too_small() {
    let mut words = [0u64; 2];
    let region = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), 16) };

    let result = Heap::new(region, HeapConfig::default());

    assert!(matches!(result, Err(HeapError::RegionTooSmall { len: 16, .. })));
  }

  #[test]
  fn test_unaligned_region_is_rounded() {
    let mut words = vec![0u64; 17];
    let region = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>().add(3), 16 * 8) };

    let heap = Heap::new(region, HeapConfig::default()).unwrap();

    assert_eq!(heap.block_count(), 15);
    assert_eq!(heap.table.data(1) as usize % 4, 0);
  }

  #[test]
  fn test_allocate_zero_is_null() {
    with_heap(32, HeapConfig::default(), |heap| {
      let before = heap.table.bytes().to_vec();

      assert!(heap.allocate(0).is_null());
      assert!(heap.zero_allocate(0, 8).is_null());
      assert_eq!(heap.table.bytes(), &before[..]);
    });
  }

  #[test]
  fn test_allocate_and_free_single() {
    with_heap(32, HeapConfig::default(), |heap| {
      let ptr = heap.allocate(20);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % 4, 0);

      unsafe {
        ptr::write_bytes(ptr, 0xCD, 20);
        heap.free(ptr);
      }

      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_free_null_is_noop() {
    with_heap(16, HeapConfig::default(), |heap| {
      let before = heap.table.bytes().to_vec();
      unsafe { heap.free(ptr::null_mut()) };
      assert_eq!(heap.table.bytes(), &before[..]);
    });
  }

  #[test]
  fn test_allocations_do_not_overlap() {
    with_heap(64, HeapConfig::default(), |heap| {
      let sizes = [1usize, 4, 5, 12, 13, 40, 3];
      let ptrs: Vec<*mut u8> = sizes.iter().map(|&size| heap.allocate(size)).collect();

      for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
        assert!(!ptr.is_null());
        unsafe { ptr::write_bytes(ptr, i as u8 + 1, size) };
      }

      for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
        let bytes = unsafe { core::slice::from_raw_parts(ptr, size) };
        assert!(bytes.iter().all(|&b| b == i as u8 + 1));
      }

      assert_conserved(heap);
    });
  }

  #[test]
  fn test_free_coalesces_both_neighbors() {
    with_heap(32, HeapConfig::default(), |heap| {
      let a = heap.allocate(payload(3));
      let b = heap.allocate(payload(3));
      let c = heap.allocate(payload(3));
      let d = heap.allocate(payload(3));

      unsafe {
        heap.free(a);
        heap.free(c);
      }
      assert_eq!(free_list(heap).len(), 3);

      unsafe { heap.free(b) };
      assert_no_adjacent_free(heap);
      assert_eq!(free_list(heap), vec![(1, 9), (13, 18)]);

      unsafe { heap.free(d) };
      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_fit_strategies() {
    fn pick(strategy: FitStrategy) -> (BlockIndex, BlockIndex) {
      // [10][1][4][1][6][rest]
      with_heap(32, HeapConfig::new().strategy(strategy), |heap| {
        let a = heap.allocate(payload(10));
        let _ua = heap.allocate(payload(1));
        let b = heap.allocate(payload(4));
        let _ub = heap.allocate(payload(1));
        let c = heap.allocate(payload(6));
        let rest = heap.table.usable_blocks() - 22;
        let _uc = heap.allocate(payload(rest));

        assert!(free_list(heap).is_empty());

        unsafe {
          heap.free(c);
          heap.free(b);
          heap.free(a);
        }

        let spans: Vec<usize> = free_list(heap).iter().map(|&(_, span)| span).collect();
        assert_eq!(spans, vec![10, 4, 6]);

        let picked = heap.allocate(payload(5));
        (heap.table.index_of(picked), heap.table.index_of(c))
      })
    }

    let (picked, six) = pick(FitStrategy::BestFit);
    assert_eq!(picked, six);

    let (picked, _) = pick(FitStrategy::FirstFit);
    assert_eq!(picked, 1);
  }

  #[test]
  fn test_best_fit_tie_follows_free_ring_order() {
    // [5][1][5][1][rest]
    with_heap(32, HeapConfig::default(), |heap| {
      let low = heap.allocate(payload(5));
      let _ua = heap.allocate(payload(1));
      let high = heap.allocate(payload(5));
      let _ub = heap.allocate(payload(1));
      let _rest = heap.allocate(payload(heap.table.usable_blocks() - 12));
      assert!(free_list(heap).is_empty());

      unsafe {
        heap.free(low);
        heap.free(high);
      }

      let high_block = heap.table.index_of(high);
      assert_eq!(free_list(heap), vec![(high_block, 5), (1, 5)]);

      let picked = heap.allocate(payload(4));
      assert_eq!(picked, high);
    });
  }

  #[test]
  fn test_exhaustion_leaves_heap_untouched() {
    with_heap(32, HeapConfig::default(), |heap| {
      let a = heap.allocate(payload(10));
      let _b = heap.allocate(payload(4));
      unsafe { heap.free(a) };

      let before = heap.table.bytes().to_vec();
      assert!(heap.allocate(payload(21)).is_null());
      assert!(heap.allocate(usize::MAX).is_null());
      assert_eq!(heap.table.bytes(), &before[..]);
    });
  }

  #[test]
  fn test_zero_allocate_zeroes() {
    with_heap(32, HeapConfig::default(), |heap| {
      let dirty = heap.allocate(64);
      unsafe {
        ptr::write_bytes(dirty, 0xFF, 64);
        heap.free(dirty);
      }

      let ptr = heap.zero_allocate(16, 4);
      assert_eq!(ptr, dirty);
      let bytes = unsafe { core::slice::from_raw_parts(ptr, 64) };
      assert!(bytes.iter().all(|&b| b == 0));
    });
  }

  #[test]
  fn test_zero_allocate_overflow() {
    with_heap(16, HeapConfig::default(), |heap| {
      assert!(heap.zero_allocate(usize::MAX, 2).is_null());
      assert_eq!(free_list(heap), vec![(1, 14)]);
    });
  }

  #[test]
  fn test_reallocate_null_and_zero() {
    with_heap(32, HeapConfig::default(), |heap| {
      let ptr = unsafe { heap.reallocate(ptr::null_mut(), 10) };
      assert!(!ptr.is_null());

      let gone = unsafe { heap.reallocate(ptr, 0) };
      assert!(gone.is_null());
      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_reallocate_shrink_keeps_address() {
    with_heap(32, HeapConfig::default(), |heap| {
      let ptr = heap.allocate(payload(8));
      let _guard = heap.allocate(payload(2));
      unsafe { ptr::write_bytes(ptr, 0x42, payload(8)) };

      let same = unsafe { heap.reallocate(ptr, payload(8) - 3) };
      assert_eq!(same, ptr);

      let smaller = unsafe { heap.reallocate(ptr, payload(3)) };
      assert_eq!(smaller, ptr);
      assert_eq!(heap.table.span(heap.table.index_of(ptr)), 3);

      let bytes = unsafe { core::slice::from_raw_parts(smaller, payload(3)) };
      assert!(bytes.iter().all(|&b| b == 0x42));
      assert_no_adjacent_free(heap);
      assert_conserved(heap);
    });
  }

  #[test]
  fn test_reallocate_grows_into_next_block() {
    with_heap(32, HeapConfig::default(), |heap| {
      let ptr = heap.allocate(payload(4));
      unsafe { ptr::write_bytes(ptr, 0x17, payload(4)) };

      let grown = unsafe { heap.reallocate(ptr, payload(9)) };
      assert_eq!(grown, ptr);
      assert_eq!(heap.table.span(heap.table.index_of(grown)), 9);

      let bytes = unsafe { core::slice::from_raw_parts(grown, payload(4)) };
      assert!(bytes.iter().all(|&b| b == 0x17));
      assert_conserved(heap);
    });
  }

  #[test]
  fn test_reallocate_grows_into_prev_block() {
    with_heap(32, HeapConfig::default(), |heap| {
      let a = heap.allocate(payload(6));
      let b = heap.allocate(payload(3));
      let _c = heap.allocate(payload(2));
      unsafe {
        ptr::write_bytes(b, 0x5A, payload(3));
        heap.free(a);
      }

      let moved = unsafe { heap.reallocate(b, payload(8)) };
      assert_eq!(moved, a);

      let bytes = unsafe { core::slice::from_raw_parts(moved, payload(3)) };
      assert!(bytes.iter().all(|&b| b == 0x5A));
      assert_no_adjacent_free(heap);
      assert_conserved(heap);
    });
  }

  #[test]
  fn test_reallocate_moves_and_copies() {
    with_heap(32, HeapConfig::default(), |heap| {
      let a = heap.allocate(payload(3));
      let _b = heap.allocate(payload(2));
      unsafe { ptr::write_bytes(a, 0x33, payload(3)) };

      let moved = unsafe { heap.reallocate(a, payload(10)) };
      assert!(!moved.is_null());
      assert_ne!(moved, a);

      let bytes = unsafe { core::slice::from_raw_parts(moved, payload(3)) };
      assert!(bytes.iter().all(|&b| b == 0x33));
      assert_eq!(free_list(heap)[0], (1, 3));
    });
  }

  #[test]
  fn test_reallocate_failure_preserves_original() {
    with_heap(32, HeapConfig::default(), |heap| {
      let a = heap.allocate(payload(4));
      let _b = heap.allocate(payload(20));
      unsafe { ptr::write_bytes(a, 0x99, payload(4)) };

      let before = heap.table.bytes().to_vec();
      let failed = unsafe { heap.reallocate(a, payload(12)) };

      assert!(failed.is_null());
      assert_eq!(heap.table.bytes(), &before[..]);

      let bytes = unsafe { core::slice::from_raw_parts(a, payload(4)) };
      assert!(bytes.iter().all(|&b| b == 0x99));
      unsafe { heap.free(a) };
    });
  }

  #[test]
  fn test_protected_sections_nest() {
    init_logger();
    let mut words = vec![0u64; 32];
    let region = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), 32 * 8) };
    let counter = DepthCounter::new();
    let mut heap = Heap::with_critical_section(region, HeapConfig::default(), &counter).unwrap();

    let ptr = heap.allocate(payload(6));
    assert_eq!(counter.max_depth(), 1);

    let shrunk = unsafe { heap.reallocate(ptr, payload(2)) };
    assert_eq!(shrunk, ptr);
    assert_eq!(counter.max_depth(), 2);

    unsafe { heap.free(shrunk) };
    assert_eq!(counter.depth(), 0);
    assert_eq!(counter.acquisitions(), 3);
  }
}
