//! Process-wide heap.
//!
//! The free functions here operate on one shared [`LockedHeap`] backed by
//! [`Mmap`]. The first allocation registers an exit handler that unmaps every
//! small arena when the process terminates.

use std::sync::Once;

use log::warn;

use crate::{locked::LockedHeap, os::Mmap};

static HEAP: LockedHeap<Mmap> = LockedHeap::new(Mmap::new());
static EXIT_HOOK: Once = Once::new();

extern "C" fn release_at_exit() {
  unsafe { HEAP.release_arenas() };
}

/// Registers the arena teardown with `atexit(3)`. Runs at most once.
pub fn install_exit_hook() {
  EXIT_HOOK.call_once(|| {
    if unsafe { libc::atexit(release_at_exit) } != 0 {
      warn!("atexit registration failed; arenas stay mapped until exit");
    }
  });
}

/// The shared heap behind the free functions of this module.
pub fn heap() -> &'static LockedHeap<Mmap> {
  &HEAP
}

pub fn allocate(size: usize) -> *mut u8 {
  install_exit_hook();
  HEAP.allocate(size)
}

pub fn zero_allocate(
  count: usize,
  size: usize,
) -> *mut u8 {
  install_exit_hook();
  HEAP.zero_allocate(count, size)
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn resize(
  ptr: *mut u8,
  size: usize,
) -> *mut u8 {
  install_exit_hook();
  unsafe { HEAP.resize(ptr, size) }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn free(ptr: *mut u8) {
  unsafe { HEAP.free(ptr) }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  unsafe { HEAP.usable_size(ptr) }
}
