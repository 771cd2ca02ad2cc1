//! A spin-locked heap usable as the `#[global_allocator]`.
//!
//! ```rust,ignore
//! use umheap::{HeapConfig, HeapRegion, LockedHeap};
//!
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! static mut REGION: HeapRegion<65536> = HeapRegion::new();
//!
//! fn main() {
//!   let region = unsafe { (*core::ptr::addr_of_mut!(REGION)).as_mut_slice() };
//!   HEAP.init(region, HeapConfig::default()).unwrap();
//! }
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use crate::align_to;
use crate::block::HEADER_SIZE;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::heap::Heap;

/// Alignment every payload has without padding.
pub const MIN_ALIGN: usize = HEADER_SIZE;

/// Bytes in front of an over-aligned pointer recording its distance from the
/// block payload.
const SHIFT_SIZE: usize = 2;

pub struct LockedHeap {
  inner: Mutex<Option<Heap<'static>>>,
}

impl LockedHeap {
  pub const fn empty() -> Self {
    Self {
      inner: Mutex::new(None),
    }
  }

  /// Hands `region` to the heap. Fails if it is too small or if the heap
  /// already owns a region.
  ///
  /// Logging is switched off: every operation runs under the lock, and a
  /// logger that allocates would come back into this heap and spin forever.
  /// For the same reason `config.on_corruption` must not allocate.
  pub fn init(
    &self,
    region: &'static mut [u8],
    config: HeapConfig,
  ) -> Result<(), HeapError> {
    let mut inner = self.inner.lock();

    if inner.is_some() {
      return Err(HeapError::AlreadyInitialized);
    }

    *inner = Some(Heap::new(region, config.logging(false))?);
    Ok(())
  }

  /// Runs `f` on the heap under the lock; `None` before `init`.
  pub fn with<R>(
    &self,
    f: impl FnOnce(&mut Heap<'static>) -> R,
  ) -> Option<R> {
    self.inner.lock().as_mut().map(f)
  }
}

impl Default for LockedHeap {
  fn default() -> Self {
    Self::empty()
  }
}

/// Allocates with room to move the pointer up to `layout.align()`.
fn allocate_aligned(
  heap: &mut Heap<'static>,
  layout: Layout,
  zeroed: bool,
) -> *mut u8 {
  let align = layout.align();

  if align <= MIN_ALIGN {
    return if zeroed {
      heap.zero_allocate(1, layout.size())
    } else {
      heap.allocate(layout.size())
    };
  }

  if align > u16::MAX as usize {
    heap_log!(heap, warn, "alignment {align} is not supported");
    return ptr::null_mut();
  }

  let Some(size) = layout.size().checked_add(align + SHIFT_SIZE) else {
    return ptr::null_mut();
  };

  let raw = if zeroed { heap.zero_allocate(1, size) } else { heap.allocate(size) };

  if raw.is_null() {
    return raw;
  }

  let shift = align_to!(raw as usize + SHIFT_SIZE, align) - raw as usize;
  heap_log!(heap, debug, "aligned {raw:p} by {shift} for {layout:?}");

  // SAFETY: `shift <= align`, so the shift field and the payload fit in the
  // `size` bytes just allocated.
  unsafe {
    let ptr = raw.add(shift);
    ptr.sub(SHIFT_SIZE).cast::<u16>().write_unaligned(shift as u16);
    ptr
  }
}

/// Undoes the shift applied by `allocate_aligned`.
///
/// # Safety
///
/// `ptr` must come from `allocate_aligned` with the same `layout`.
unsafe fn block_pointer(
  ptr: *mut u8,
  layout: Layout,
) -> *mut u8 {
  if layout.align() <= MIN_ALIGN {
    return ptr;
  }

  unsafe {
    let shift = ptr.sub(SHIFT_SIZE).cast::<u16>().read_unaligned();
    ptr.sub(shift as usize)
  }
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    self
      .with(|heap| allocate_aligned(heap, layout, false))
      .unwrap_or(ptr::null_mut())
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    self
      .with(|heap| allocate_aligned(heap, layout, true))
      .unwrap_or(ptr::null_mut())
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    self.with(|heap| unsafe { heap.free(block_pointer(ptr, layout)) });
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    self
      .with(|heap| {
        if layout.align() <= MIN_ALIGN {
          return unsafe { heap.reallocate(ptr, new_size) };
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
          return ptr::null_mut();
        };

        let moved = allocate_aligned(heap, new_layout, false);

        if !moved.is_null() {
          // SAFETY: distinct live allocations, each at least as long as the
          // copied length.
          unsafe {
            ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
            heap.free(block_pointer(ptr, layout));
          }
        }

        moved
      })
      .unwrap_or(ptr::null_mut())
  }
}
