use std::ptr;

use umheap::{Heap, HeapConfig, HeapRegion, PoisonConfig};

/// Prints the heap's health numbers and dumps the block table at `info`
/// level. Run with `RUST_LOG=info` to see the dump.
fn print_health(
  label: &str,
  heap: &mut Heap<'_>,
) {
  heap.info(ptr::null(), true);

  println!(
    "[{label}] free = {} bytes, largest free = {} bytes, usage = {:?}, fragmentation = {}",
    heap.free_heap_size(),
    heap.max_free_block_size(),
    heap.usage_metric(),
    heap.fragmentation_metric(),
  );
}

fn main() {
  env_logger::init();

  // 4 KiB of 8-byte aligned storage: 512 cells, of which 510 can be handed
  // out. The sentinel and the terminator take the other two.
  let mut region = HeapRegion::<4096>::new();
  let config = HeapConfig::new().inline_metrics(true).integrity_check(true);

  let mut heap = match Heap::new(region.as_mut_slice(), config) {
    Ok(heap) => heap,
    Err(error) => {
      eprintln!("can't set up the heap: {error}");
      return;
    }
  };

  print_health("start", &mut heap);

  unsafe {
    // --------------------------------------------------------------------
    // 1) Allocate a u32. Four bytes fit in the first cell of a block.
    // --------------------------------------------------------------------
    let first = heap.allocate(4);
    println!("\n[1] Allocate 4 bytes at {first:?}");

    let first_ptr = first as *mut u32;
    first_ptr.write(0xDEADBEEF);
    println!("[1] Value written = 0x{:X}", first_ptr.read());

    // --------------------------------------------------------------------
    // 2) Allocate 100 bytes and a small neighbor behind it.
    // --------------------------------------------------------------------
    let second = heap.allocate(100);
    let third = heap.allocate(12);
    ptr::write_bytes(second, 0xAB, 100);
    println!("\n[2] Allocate 100 bytes at {second:?} and 12 bytes at {third:?}");
    print_health("2", &mut heap);

    // --------------------------------------------------------------------
    // 3) Free the first block; the next small request reuses it.
    // --------------------------------------------------------------------
    heap.free(first);
    let reused = heap.allocate(2);
    println!(
      "\n[3] freed {first:?}, new 2-byte block at {reused:?}: {}",
      if reused == first { "reused" } else { "somewhere else" }
    );

    // --------------------------------------------------------------------
    // 4) Grow the 100-byte block. Its neighbor is in use, so it moves.
    // --------------------------------------------------------------------
    let grown = heap.reallocate(second, 300);
    println!("\n[4] Reallocate 100 -> 300 bytes: {second:?} -> {grown:?}");
    println!("[4] First byte still 0x{:X}", grown.read());
    print_health("4", &mut heap);

    // --------------------------------------------------------------------
    // 5) Overrun a poisoned allocation by one byte and free it. Poisoned
    //    heaps expect every block to carry guards, so this one gets its own
    //    region.
    // --------------------------------------------------------------------
    let mut guarded_region = HeapRegion::<512>::new();
    let guarded_config = HeapConfig::new().poison(Some(PoisonConfig::new()));

    if let Ok(mut guarded_heap) = Heap::new(guarded_region.as_mut_slice(), guarded_config) {
      let guarded = guarded_heap.poison_allocate(16);
      ptr::write_bytes(guarded, 0x00, 17);
      guarded_heap.poison_free(guarded);
      println!(
        "\n[5] Overran a poisoned block, corruptions seen = {}",
        guarded_heap.corruption_count()
      );
    }

    // --------------------------------------------------------------------
    // 6) Release everything. The heap collapses back to one free block.
    // --------------------------------------------------------------------
    heap.free(reused);
    heap.free(third);
    heap.free(grown);
    println!("\n[6] Integrity check: {}", heap.integrity_check());
    print_health("end", &mut heap);
  }
}
