//! Structural validation of the block table.
//!
//! The free ring is walked first and every member gets the spare high bit of
//! its `prev` link set. The all-blocks ring is then walked in address order;
//! a block must carry that mark exactly when it is tagged FREE. Marks are
//! cleared again before returning, so the check needs no memory of its own.

use crate::block::{BLOCKNO_MASK, BlockIndex, BlockTable, FREELIST_MASK};
use crate::critical::CriticalSection;
use crate::error::Corruption;
use crate::heap::Heap;

impl BlockTable<'_> {
  pub(crate) fn verify(&mut self) -> Result<(), Corruption> {
    let (marked, result) = self.mark_free_ring();
    let result = result.and_then(|()| self.verify_blocks());
    self.unmark_free_ring(marked);
    result
  }

  fn mark_free_ring(&mut self) -> (usize, Result<(), Corruption>) {
    let mut marked = 0;
    let mut prev: BlockIndex = 0;

    loop {
      let block = self.next_free(prev);

      if block as usize >= self.count() {
        return (marked, Err(Corruption::FreeIndexOutOfRange { block: prev, next: block }));
      }

      if block == 0 {
        break;
      }

      if self.raw_prev(block) & FREELIST_MASK != 0 {
        return (marked, Err(Corruption::FreeListCycle { steps: marked }));
      }

      let back = self.prev_free(block);
      if back != prev {
        return (
          marked,
          Err(Corruption::FreeLinkMismatch {
            prev,
            block,
            back,
          }),
        );
      }

      self.set_raw_prev(block, self.raw_prev(block) | FREELIST_MASK);
      marked += 1;
      prev = block;
    }

    let back = self.prev_free(0);
    if back != prev {
      return (marked, Err(Corruption::FreeRingOpen { last: prev, back }));
    }

    (marked, Ok(()))
  }

  fn unmark_free_ring(
    &mut self,
    marked: usize,
  ) {
    let mut block = self.next_free(0);

    for _ in 0..marked {
      self.set_raw_prev(block, self.raw_prev(block) & BLOCKNO_MASK);
      block = self.next_free(block);
    }
  }

  fn verify_blocks(&self) -> Result<(), Corruption> {
    if self.is_free(0) {
      return Err(Corruption::FreeMarkMismatch { block: 0 });
    }

    let mut prev: BlockIndex = 0;
    let mut prev_free = false;

    loop {
      let block = self.next(prev);

      if block as usize >= self.count() {
        return Err(Corruption::BlockIndexOutOfRange { block: prev, next: block });
      }

      if block == 0 {
        break;
      }

      if block <= prev {
        return Err(Corruption::BlockOrder { block: prev, next: block });
      }

      let raw_prev = self.raw_prev(block);
      let free = self.is_free(block);

      if free != (raw_prev & FREELIST_MASK != 0) {
        return Err(Corruption::FreeMarkMismatch { block });
      }

      let back = raw_prev & BLOCKNO_MASK;
      if back != prev {
        return Err(Corruption::BlockLinkMismatch { prev, block, back });
      }

      if free && prev_free {
        return Err(Corruption::AdjacentFree { block: prev, next: block });
      }

      prev_free = free;
      prev = block;
    }

    let back = self.prev(0);
    if prev != self.last() || back != prev {
      return Err(Corruption::SentinelLink { last: prev, back });
    }

    Ok(())
  }
}

impl<C: CriticalSection> Heap<'_, C> {
  /// Checks both rings for consistency. The first problem found is reported
  /// through the corruption handler and `false` is returned; nothing is
  /// repaired.
  pub fn integrity_check(&mut self) -> bool {
    self.protected(|heap| match heap.table.verify() {
      Ok(()) => {
        heap_log!(heap, debug, "heap integrity ok");
        true
      }
      Err(corruption) => {
        heap_log!(heap, error, "heap integrity broken: {corruption}");
        heap.report(corruption);
        false
      }
    })
  }
}
