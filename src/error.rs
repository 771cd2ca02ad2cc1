use thiserror::Error;

use crate::block::BlockIndex;

/// Errors raised while setting a heap up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
  /// The region cannot hold the sentinel, one free block and the terminator.
  #[error("heap region of {len} bytes is too small, at least {min} bytes are needed")]
  RegionTooSmall { len: usize, min: usize },

  /// `LockedHeap::init` was called on a heap that already owns a region.
  #[error("heap is already initialized")]
  AlreadyInitialized,
}

/// A structural or guard-byte inconsistency found by the integrity checker
/// or the poisoning layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
  #[error("next free index {next} out of range in block {block}")]
  FreeIndexOutOfRange { block: BlockIndex, next: BlockIndex },

  #[error("free links don't match: {prev} -> {block}, but {block} -> {back}")]
  FreeLinkMismatch {
    prev: BlockIndex,
    block: BlockIndex,
    back: BlockIndex,
  },

  #[error("free list does not terminate after {steps} steps")]
  FreeListCycle { steps: usize },

  #[error("free list head points back to {back}, last free block is {last}")]
  FreeRingOpen { last: BlockIndex, back: BlockIndex },

  #[error("next block index {next} out of range in block {block}")]
  BlockIndexOutOfRange { block: BlockIndex, next: BlockIndex },

  #[error("next block {next} is not after block {block}")]
  BlockOrder { block: BlockIndex, next: BlockIndex },

  #[error("block links don't match: {prev} -> {block}, but {block} -> {back}")]
  BlockLinkMismatch {
    prev: BlockIndex,
    block: BlockIndex,
    back: BlockIndex,
  },

  #[error("free mark of block {block} disagrees with free list membership")]
  FreeMarkMismatch { block: BlockIndex },

  #[error("adjacent free blocks {block} and {next}")]
  AdjacentFree { block: BlockIndex, next: BlockIndex },

  #[error("sentinel points back to {back}, last block is {last}")]
  SentinelLink { last: BlockIndex, back: BlockIndex },

  #[error("no poison before block {block} at {addr:#x}")]
  PoisonBefore { block: BlockIndex, addr: usize },

  #[error("no poison after block {block} at {addr:#x}")]
  PoisonAfter { block: BlockIndex, addr: usize },

  #[error("stored length {len} of block {block} exceeds its capacity")]
  PoisonLength { block: BlockIndex, len: usize },

  #[error("poison check on free block {block}")]
  PoisonOnFreeBlock { block: BlockIndex },
}
