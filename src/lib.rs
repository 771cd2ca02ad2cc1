//! # umheap - A Fixed-Region Heap for Small Systems
//!
//! This crate provides a general purpose heap that lives entirely inside one
//! caller-supplied region of memory. It never asks the operating system for
//! more, which makes it fit for firmware, RTOS tasks and anywhere `sbrk` is
//! not an option.
//!
//! ## Overview
//!
//! The region is cut into 8-byte cells. Allocations are whole runs of cells,
//! addressed by 15-bit indices:
//!
//! ```text
//!   Heap Region:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │ cell 0 │ cell 1 ... 3 │ cell 4 ... 9 │ cell 10 ..... 30 │ cell 31    │
//!   │sentinel│    USED      │    FREE      │      USED        │ terminator │
//!   └──────────────────────────────────────────────────────────────────────┘
//!       │          ▲  │          ▲  │            ▲  │               ▲
//!       └──────────┘  └──────────┘  └────────────┘  └───────────────┘
//!                      next / prev links, in address order
//!
//!   FREE blocks are also chained on a second ring headed by the sentinel.
//!   Freeing merges a block with FREE neighbors, so no two FREE blocks touch.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   umheap
//!   ├── align      - Alignment macro (align_to!)
//!   ├── block      - Cell layout and link surgery (internal)
//!   ├── config     - HeapConfig, fit strategy, poison geometry
//!   ├── critical   - Nestable protected sections
//!   ├── error      - HeapError and Corruption
//!   ├── global     - LockedHeap, a GlobalAlloc adapter
//!   ├── heap       - Heap: allocate, free, reallocate
//!   ├── info       - Heap walk and health metrics
//!   ├── integrity  - Consistency checker
//!   ├── logging    - heap_log!, gated on HeapConfig::logging (internal)
//!   └── poison     - Guard bytes around allocations
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use umheap::{FitStrategy, Heap, HeapConfig, HeapRegion};
//!
//! let mut region = HeapRegion::<4096>::new();
//! let config = HeapConfig::new().strategy(FitStrategy::FirstFit).info(true);
//! let mut heap = Heap::new(region.as_mut_slice(), config).unwrap();
//!
//! let ptr = heap.allocate(100);
//! assert!(!ptr.is_null());
//!
//! unsafe {
//!   ptr.write_bytes(0x2A, 100);
//!   let ptr = heap.reallocate(ptr, 200);
//!   assert_eq!(ptr.read(), 0x2A);
//!   heap.free(ptr);
//! }
//!
//! assert_eq!(heap.fragmentation_metric(), 0);
//! ```
//!
//! ## How Requests Map to Cells
//!
//! ```text
//!   Allocated block of 3 cells (20 usable bytes):
//!   ┌───────────────────────┬────────────────────────────────────────┐
//!   │    Header (4 bytes)   │            User Data                   │
//!   │  ┌─────────────────┐  │                                        │
//!   │  │ next: u16       │  │  ┌──────────────────────────────────┐  │
//!   │  │ prev: u16       │  │  │  4 bytes in the first cell       │  │
//!   │  └─────────────────┘  │  │  + 8 bytes per following cell    │  │
//!   │                       │  └──────────────────────────────────┘  │
//!   └───────────────────────┴────────────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user
//! ```
//!
//! ## Features
//!
//! - **Best-fit or first-fit** search over the free ring
//! - **In-place reallocation** into neighboring free blocks
//! - **Integrity checking** before and after every mutation
//! - **Poisoning** to catch buffer overruns on free
//! - **Metrics**: free size, largest block, usage and fragmentation
//! - **Protected sections** pluggable through [`CriticalSection`]
//!
//! ## Limitations
//!
//! - At most 32768 cells (256 KiB) per heap
//! - Payloads are 4-byte aligned; [`LockedHeap`] pads for larger alignments
//!
//! ## Safety
//!
//! Freeing or resizing takes raw pointers and trusts that they came from the
//! same heap. Those operations are `unsafe`.

#[macro_use]
mod logging;

pub mod align;
mod block;
mod config;
mod critical;
mod error;
mod global;
mod heap;
mod info;
mod integrity;
mod poison;

pub use block::{BLOCK_SIZE, BlockIndex, HEADER_SIZE, MAX_BLOCKS, MIN_BLOCKS, blocks_for};
pub use config::{CorruptionHandler, FitStrategy, HeapConfig, LenWidth, PoisonConfig, log_corruption};
pub use critical::{CriticalSection, DepthCounter, NoopSection};
pub use error::{Corruption, HeapError};
pub use global::{LockedHeap, MIN_ALIGN};
pub use heap::{Heap, HeapRegion};
pub use info::HeapInfo;
pub use poison::POISON_BYTE;
