use std::{io::Read, ptr};

use segalloc::{Heap, align_small, class_index};

/// Waits for ENTER when the demo runs with `--step`, so the mappings can be
/// inspected with `pmap` or `/proc/<pid>/maps` between steps.
fn block_until_enter_pressed(step: bool) {
  if !step {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn print_arena(
  heap: &Heap,
  size: usize,
) {
  let class = class_index(align_small(size)).unwrap();
  match heap.arena_info(class) {
    Some(info) => println!(
      "    arena {class}: base = {:#x}, region = {} bytes, segment = {} bytes, free = {}",
      info.base, info.region_size, info.segment_size, info.free_segments
    ),
    None => println!("    arena {class}: not mapped"),
  }
}

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

  let step = std::env::args().any(|arg| arg == "--step");
  let mut heap = Heap::new();
  let page = heap.config().page_size();

  println!(
    "PID = {}, page size = {}, small threshold = {}",
    std::process::id(),
    page,
    heap.config().threshold()
  );
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 1) A 10 byte request lands in the 16 byte class and maps its arena.
  // --------------------------------------------------------------------
  let first = heap.allocate(10);
  println!("\n[1] allocate(10) = {:?}", first);
  print_arena(&heap, 10);
  unsafe { first.write_bytes(0xAB, 10) };
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 2) Freeing and allocating again hands back the same segment.
  // --------------------------------------------------------------------
  unsafe { heap.free(first) };
  let again = heap.allocate(12);
  println!(
    "\n[2] free + allocate(12) = {:?} (reused: {})",
    again,
    again == first
  );
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 3) Exhaust the first page to watch the arena grow in place.
  // --------------------------------------------------------------------
  let mut held = vec![again];
  loop {
    let before = heap.arena_info(class_index(16).unwrap()).unwrap().region_size;
    held.push(heap.allocate(10));
    let after = heap.arena_info(class_index(16).unwrap()).unwrap().region_size;
    if after != before {
      println!("\n[3] allocation #{} grew the arena from {before} to {after} bytes", held.len());
      break;
    }
  }
  print_arena(&heap, 10);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 4) zero_allocate on a reused segment still returns zeroes.
  // --------------------------------------------------------------------
  let last = held.pop().unwrap();
  unsafe {
    last.write_bytes(0xFF, 16);
    heap.free(last);
  }
  let zeroed = heap.zero_allocate(2, 8);
  let first_byte = unsafe { zeroed.read() };
  println!("\n[4] zero_allocate(2, 8) = {:?}, first byte = {first_byte}", zeroed);
  held.push(zeroed);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 5) Large requests get their own mapping and give it back on free.
  // --------------------------------------------------------------------
  let large_size = page.max(4000);
  let large = heap.allocate(large_size);
  println!("\n[5] allocate({large_size}) = {:?}", large);
  unsafe {
    ptr::write_bytes(large, 0x5A, large_size);
    println!("    usable size = {}", heap.usable_size(large));
    heap.free(large);
  }
  println!("    freed, region unmapped");
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 6) resize always moves to a fresh block.
  // --------------------------------------------------------------------
  let moved = unsafe { heap.resize(held[0], 100) };
  println!("\n[6] resize({:?}, 100) = {:?}", held[0], moved);
  print_arena(&heap, 100);

  println!("\n[7] dropping the heap releases every arena.");
  drop(heap);
}
