//! Guard bytes around each allocation.
//!
//! ```text
//!   ┌────────┬──────────────┬─────────────────────┬─────────────┬───────┐
//!   │ header │ len (total)  │ 0xA5 x before       │ payload ... │ 0xA5  │
//!   └────────┴──────────────┴─────────────────────┴─────────────┴───────┘
//!            ▲                                    ▲
//!            block data                           pointer handed out
//! ```
//!
//! The exact requested length is stored so that writing a single byte past
//! it is caught, even when the block has spare room at the end.

use core::ptr;

use crate::block::BlockIndex;
use crate::config::{LenWidth, PoisonConfig};
use crate::critical::CriticalSection;
use crate::error::Corruption;
use crate::heap::Heap;

/// Value of every guard byte.
pub const POISON_BYTE: u8 = 0xA5;

/// # Safety
///
/// `ptr` must be valid for writes of `width.bytes()` bytes.
unsafe fn write_len(
  ptr: *mut u8,
  width: LenWidth,
  len: usize,
) {
  unsafe {
    match width {
      LenWidth::U8 => ptr.write(len as u8),
      LenWidth::U16 => ptr.cast::<u16>().write_unaligned(len as u16),
      LenWidth::U32 => ptr.cast::<u32>().write_unaligned(len as u32),
    }
  }
}

/// # Safety
///
/// `ptr` must be valid for reads of `width.bytes()` bytes.
unsafe fn read_len(
  ptr: *const u8,
  width: LenWidth,
) -> usize {
  unsafe {
    match width {
      LenWidth::U8 => ptr.read() as usize,
      LenWidth::U16 => ptr.cast::<u16>().read_unaligned() as usize,
      LenWidth::U32 => ptr.cast::<u32>().read_unaligned() as usize,
    }
  }
}

/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes.
unsafe fn is_poisoned(
  ptr: *const u8,
  len: usize,
) -> bool {
  unsafe { core::slice::from_raw_parts(ptr, len) }
    .iter()
    .all(|&byte| byte == POISON_BYTE)
}

/// Writes the length field and both guards into a fresh block of `total`
/// bytes and returns the pointer to hand out. Null stays null.
///
/// # Safety
///
/// `raw` must be null or valid for writes of `total` bytes.
unsafe fn poisoned(
  raw: *mut u8,
  total: usize,
  poison: PoisonConfig,
) -> *mut u8 {
  if raw.is_null() {
    return raw;
  }

  unsafe {
    write_len(raw, poison.len_width, total);
    ptr::write_bytes(raw.add(poison.len_width.bytes()), POISON_BYTE, poison.before);
    ptr::write_bytes(raw.add(total - poison.after), POISON_BYTE, poison.after);
    raw.add(poison.offset())
  }
}

impl<C: CriticalSection> Heap<'_, C> {
  /// Total block payload for a poisoned request of `size` bytes.
  fn poisoned_size(
    &self,
    size: usize,
    poison: PoisonConfig,
  ) -> Option<usize> {
    let total = size.checked_add(poison.overhead())?;

    if total > poison.len_width.max() {
      heap_log!(
        self,
        warn,
        "poisoned allocation of {size} bytes does not fit a {}-byte length field",
        poison.len_width.bytes()
      );
      return None;
    }

    Some(total)
  }

  /// Validates the guards of one USED block, reporting the first problem.
  fn check_poison_block(
    &mut self,
    block: BlockIndex,
    poison: PoisonConfig,
  ) -> bool {
    let data = self.table.data(block);
    let capacity = self.table.capacity(block);
    // SAFETY: every USED block has at least 4 payload bytes.
    let len = unsafe { read_len(data, poison.len_width) };

    if len < poison.overhead() || len > capacity {
      heap_log!(self, error, "block {block} records {len} bytes but holds {capacity}");
      self.report(Corruption::PoisonLength { block, len });
      return false;
    }

    // SAFETY: `len <= capacity`, so both guards lie inside the block.
    let before = unsafe { data.add(poison.len_width.bytes()) };
    if !unsafe { is_poisoned(before, poison.before) } {
      heap_log!(self, error, "no poison before block {block} at {before:p}");
      self.report(Corruption::PoisonBefore {
        block,
        addr: before as usize,
      });
      return false;
    }

    let after = unsafe { data.add(len - poison.after) };
    if !unsafe { is_poisoned(after, poison.after) } {
      heap_log!(self, error, "no poison after block {block} at {after:p}");
      self.report(Corruption::PoisonAfter {
        block,
        addr: after as usize,
      });
      return false;
    }

    true
  }

  /// Checks the guards of every USED block, reporting each damaged one.
  fn check_all_poison(
    &mut self,
    poison: PoisonConfig,
  ) -> bool {
    let last = self.table.last();
    let mut block = self.table.next(0);
    let mut intact = true;

    while block != last {
      if !self.table.is_free(block) {
        intact &= self.check_poison_block(block, poison);
      }
      block = self.table.next(block);
    }

    if intact {
      heap_log!(self, trace, "all poison guards intact");
    }

    intact
  }

  /// Steps back from a handed-out pointer to the block data. `None` when the
  /// block is already FREE, which is reported.
  fn unpoisoned(
    &mut self,
    ptr: *mut u8,
    poison: PoisonConfig,
  ) -> Option<*mut u8> {
    let raw = ptr.wrapping_sub(poison.offset());
    let block = self.table.index_of(raw);

    if self.table.is_free(block) {
      heap_log!(self, error, "poisoned pointer {ptr:p} points into free block {block}");
      self.report(Corruption::PoisonOnFreeBlock { block });
      return None;
    }

    Some(raw)
  }

  /// [`Heap::allocate`] with guard bytes around the payload.
  ///
  /// Like every `poison_*` entry point, this first checks the guards of all
  /// live allocations and reports any damage.
  pub fn poison_allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    let Some(poison) = self.config.poison else {
      return self.allocate(size);
    };

    self.protected(|heap| {
      heap.check_all_poison(poison);

      if size == 0 {
        return heap.allocate(0);
      }

      let Some(total) = heap.poisoned_size(size, poison) else {
        return ptr::null_mut();
      };

      let raw = heap.allocate(total);
      // SAFETY: `raw` is null or a fresh block of at least `total` bytes.
      unsafe { poisoned(raw, total, poison) }
    })
  }

  /// [`Heap::zero_allocate`] with guard bytes around the payload.
  pub fn poison_zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    let Some(poison) = self.config.poison else {
      return self.zero_allocate(count, size);
    };

    self.protected(|heap| {
      heap.check_all_poison(poison);

      let Some(size) = count.checked_mul(size) else {
        heap_log!(heap, warn, "poison_zero_allocate({count}, {size}) overflows");
        return ptr::null_mut();
      };

      if size == 0 {
        return heap.allocate(0);
      }

      let Some(total) = heap.poisoned_size(size, poison) else {
        return ptr::null_mut();
      };

      let raw = heap.zero_allocate(total, 1);
      // SAFETY: see `poison_allocate`.
      unsafe { poisoned(raw, total, poison) }
    })
  }

  /// [`Heap::reallocate`] for a pointer from the poisoning entry points.
  /// Damaged guards are reported, then the resize goes ahead.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by a `poison_*` call.
  pub unsafe fn poison_reallocate(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    let Some(poison) = self.config.poison else {
      // SAFETY: forwarded from the caller.
      return unsafe { self.reallocate(ptr, size) };
    };

    if ptr.is_null() {
      return self.poison_allocate(size);
    }

    self.protected(|heap| {
      heap.check_all_poison(poison);

      let Some(raw) = heap.unpoisoned(ptr, poison) else {
        return ptr::null_mut();
      };

      if size == 0 {
        // SAFETY: `raw` is the block data behind `ptr`.
        unsafe { heap.free(raw) };
        return ptr::null_mut();
      }

      let Some(total) = heap.poisoned_size(size, poison) else {
        return ptr::null_mut();
      };

      // SAFETY: `raw` is the block data behind `ptr`.
      unsafe {
        let moved = heap.reallocate(raw, total);
        poisoned(moved, total, poison)
      }
    })
  }

  /// [`Heap::free`] for a pointer from the poisoning entry points. A damaged
  /// guard is reported, then the block is freed anyway.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by a `poison_*` call.
  pub unsafe fn poison_free(
    &mut self,
    ptr: *mut u8,
  ) {
    let Some(poison) = self.config.poison else {
      // SAFETY: forwarded from the caller.
      return unsafe { self.free(ptr) };
    };

    if ptr.is_null() {
      return;
    }

    self.protected(|heap| {
      heap.check_all_poison(poison);

      if let Some(raw) = heap.unpoisoned(ptr, poison) {
        // SAFETY: `raw` is the block data behind `ptr`.
        unsafe { heap.free(raw) };
      }
    });
  }

  /// Checks the guards of every USED block and reports each damaged one.
  ///
  /// Only meaningful when every allocation went through the poisoning entry
  /// points.
  pub fn poison_check(&mut self) -> bool {
    let Some(poison) = self.config.poison else {
      return true;
    };

    self.protected(|heap| heap.check_all_poison(poison))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::BLOCK_SIZE;
  use crate::config::HeapConfig;
  use crate::heap::testing::*;

  fn silent(_: &Corruption) {}

  fn poisoned_config() -> HeapConfig {
    HeapConfig::new().poison(Some(PoisonConfig::new())).on_corruption(silent)
  }

  #[test]
  fn test_layout_around_payload() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(10);
      assert!(!ptr.is_null());

      let data = ptr.wrapping_sub(8);
      assert_eq!(heap.table.data(heap.table.index_of(data)), data);
      assert_eq!(unsafe { read_len(data, LenWidth::U16) }, 24);

      let before = unsafe { core::slice::from_raw_parts(data.add(2), 6) };
      let after = unsafe { core::slice::from_raw_parts(ptr.add(10), 6) };
      assert!(before.iter().all(|&b| b == POISON_BYTE));
      assert!(after.iter().all(|&b| b == POISON_BYTE));
      assert!(heap.poison_check());
    });
  }

  #[test]
  fn test_clean_free_reports_nothing() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(17);
      unsafe {
        ptr::write_bytes(ptr, 0x11, 17);
        heap.poison_free(ptr);
      }

      assert_eq!(heap.corruption_count(), 0);
      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_one_byte_overrun_is_reported_once() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(17);
      unsafe {
        ptr::write_bytes(ptr, 0x11, 18);
        heap.poison_free(ptr);
      }

      assert_eq!(heap.corruption_count(), 1);
      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_damage_elsewhere_is_reported_by_any_operation() {
    with_heap(64, poisoned_config(), |heap| {
      let a = heap.poison_allocate(10);
      let b = heap.poison_allocate(8);
      unsafe { a.add(10).write(0) };

      unsafe { heap.poison_free(b) };
      assert_eq!(heap.corruption_count(), 1);

      let c = heap.poison_allocate(4);
      assert!(!c.is_null());
      assert_eq!(heap.corruption_count(), 2);

      let moved = unsafe { heap.poison_reallocate(c, 40) };
      assert!(!moved.is_null());
      assert_eq!(heap.corruption_count(), 3);
    });
  }

  #[test]
  fn test_free_of_free_block_is_refused() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(12);
      unsafe {
        heap.poison_free(ptr);
        heap.poison_free(ptr);
      }

      assert_eq!(heap.corruption_count(), 1);
      assert_eq!(free_list(heap), vec![(1, 30)]);
    });
  }

  #[test]
  fn test_underrun_is_reported() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(8);
      unsafe { ptr.sub(1).write(0) };

      assert!(!heap.poison_check());
      assert_eq!(heap.corruption_count(), 1);
    });
  }

  #[test]
  fn test_poison_zero_allocate() {
    with_heap(32, poisoned_config(), |heap| {
      let ptr = heap.poison_zero_allocate(4, 5);
      assert!(!ptr.is_null());

      let bytes = unsafe { core::slice::from_raw_parts(ptr, 20) };
      assert!(bytes.iter().all(|&b| b == 0));
      assert!(heap.poison_check());
      assert!(heap.poison_zero_allocate(usize::MAX, 3).is_null());
    });
  }

  #[test]
  fn test_poison_reallocate_keeps_data_and_guards() {
    with_heap(64, poisoned_config(), |heap| {
      let ptr = heap.poison_allocate(10);
      let _pin = heap.poison_allocate(4);
      unsafe { ptr::write_bytes(ptr, 0x77, 10) };

      let grown = unsafe { heap.poison_reallocate(ptr, 60) };
      assert!(!grown.is_null());
      let bytes = unsafe { core::slice::from_raw_parts(grown, 10) };
      assert!(bytes.iter().all(|&b| b == 0x77));
      assert!(heap.poison_check());

      let shrunk = unsafe { heap.poison_reallocate(grown, 3) };
      assert_eq!(shrunk, grown);
      assert!(heap.poison_check());
      assert_eq!(heap.corruption_count(), 0);

      assert!(unsafe { heap.poison_reallocate(shrunk, 0) }.is_null());
    });
  }

  #[test]
  fn test_length_field_bounds_allocation() {
    let config = HeapConfig::new()
      .poison(Some(PoisonConfig {
        before: 4,
        after: 4,
        len_width: LenWidth::U8,
      }))
      .on_corruption(silent);

    with_heap(128, config, |heap| {
      assert!(!heap.poison_allocate(255 - 9).is_null());
      assert!(heap.poison_allocate(255 - 8).is_null());
    });
  }

  #[test]
  fn test_disabled_poison_delegates() {
    with_heap(32, HeapConfig::default(), |heap| {
      let ptr = heap.poison_allocate(12);
      assert_eq!(heap.table.data(heap.table.index_of(ptr)), ptr);
      assert!(heap.poison_check());
      unsafe { heap.poison_free(ptr) };
      assert_eq!(free_list(heap), vec![(1, 30)]);
      assert_eq!(heap.table.capacity(1), 30 * BLOCK_SIZE - 4);
    });
  }
}
