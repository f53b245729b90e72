//! Thread-safe front end with one lock per size class.
//!
//! Each class arena sits behind its own `parking_lot::Mutex`, which guards
//! both its free list and its growth. Large requests take no lock at all.
//! Logging happens only after the class lock is dropped.

use std::{
  alloc::{GlobalAlloc, Layout, System},
  ptr::NonNull,
  sync::{
    OnceLock,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
};

use log::{debug, warn};
use parking_lot::{Mutex, const_mutex};

use crate::{
  align::{MIN_ALIGN, NUM_CLASSES},
  config::Config,
  error::AllocError,
  heap::{self, Arenas},
  os::{Mmap, PageSource},
  region::Segment,
  small::{ArenaEvent, ArenaInfo, SizeClassArena},
};

/// Segregated heap usable from many threads and as a `#[global_allocator]`.
///
/// ```rust,ignore
/// use segalloc::{LockedHeap, Mmap};
///
/// #[global_allocator]
/// static HEAP: LockedHeap<Mmap> = LockedHeap::new(Mmap::new());
/// ```
pub struct LockedHeap<P: PageSource = Mmap> {
  source: P,
  config: OnceLock<Config>,
  arenas: [Mutex<SizeClassArena>; NUM_CLASSES],
  released: AtomicBool,
  // Base of each arena unmapped by `release_arenas`, 0 when none.
  retired: [AtomicUsize; NUM_CLASSES],
}

impl<P: PageSource> LockedHeap<P> {
  pub const fn new(source: P) -> Self {
    Self {
      source,
      config: OnceLock::new(),
      arenas: [const { const_mutex(SizeClassArena::new()) }; NUM_CLASSES],
      released: AtomicBool::new(false),
      retired: [const { AtomicUsize::new(0) }; NUM_CLASSES],
    }
  }

  pub fn with_config(
    source: P,
    config: Config,
  ) -> Self {
    let heap = Self::new(source);
    let _ = heap.config.set(config);
    heap
  }

  pub fn config(&self) -> &Config {
    self.config.get_or_init(|| Config::detect(&self.source))
  }

  pub fn try_allocate(
    &self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    heap::try_allocate(&mut &*self, size)
  }

  pub fn allocate(
    &self,
    size: usize,
  ) -> *mut u8 {
    heap::allocate(&mut &*self, size)
  }

  pub fn try_zero_allocate(
    &self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    heap::try_zero_allocate(&mut &*self, count, size)
  }

  pub fn zero_allocate(
    &self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    heap::zero_allocate(&mut &*self, count, size)
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn resize(
    &self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe { heap::resize(&mut &*self, ptr, size) }
  }

  /// Frees `ptr`. Small blocks whose arena was unmapped by
  /// [`LockedHeap::release_arenas`] are ignored, large ones are still unmapped.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn free(
    &self,
    ptr: *mut u8,
  ) {
    if self.released.load(Ordering::Acquire) && self.is_retired(ptr as usize) {
      return;
    }

    unsafe { heap::free(&mut &*self, ptr) }
  }

  // The header of a retired arena is gone, so the address is all there is.
  fn is_retired(
    &self,
    addr: usize,
  ) -> bool {
    let reserve = self.config().arena_reserve();
    self.retired.iter().any(|base| {
      let base = base.load(Ordering::Acquire);
      base != 0 && addr.wrapping_sub(base) < reserve
    })
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    unsafe { heap::usable_size(ptr) }
  }

  pub fn arena_info(
    &self,
    class: usize,
  ) -> Option<ArenaInfo> {
    self.arenas.get(class)?.lock().info()
  }

  /// Unmaps every small arena. Later frees of small blocks become no-ops.
  ///
  /// # Safety
  ///
  /// No small allocation from this heap may be used afterwards.
  pub unsafe fn release_arenas(&self) {
    let config = *self.config();

    for (class, arena) in self.arenas.iter().enumerate() {
      let result = {
        let mut arena = arena.lock();
        let Some(info) = arena.info() else {
          continue;
        };
        self.retired[class].store(info.base, Ordering::Release);
        self.released.store(true, Ordering::Release);
        unsafe { arena.release(&self.source, &config) }
      };

      log_release(class, result);
    }
  }
}

fn log_release(
  class: usize,
  result: Result<(), AllocError>,
) {
  match result {
    Ok(()) => debug!("arena {class}: released"),
    Err(err) => warn!("arena {class}: {err}"),
  }
}

impl<P: PageSource> Drop for LockedHeap<P> {
  fn drop(&mut self) {
    // No arena exists before the geometry is settled.
    let Some(config) = self.config.get().copied() else {
      return;
    };

    for (class, arena) in self.arenas.iter_mut().map(Mutex::get_mut).enumerate() {
      if arena.is_active() {
        log_release(class, unsafe { arena.release(&self.source, &config) });
      }
    }
  }
}

impl<P: PageSource> Arenas for &LockedHeap<P> {
  type Source = P;

  fn page_source(&self) -> &P {
    &self.source
  }

  fn geometry(&self) -> Config {
    *LockedHeap::config(self)
  }

  fn allocate_small(
    &mut self,
    class: usize,
    class_size: usize,
  ) -> Result<(NonNull<u8>, ArenaEvent), AllocError> {
    let config = self.geometry();
    self.arenas[class]
      .lock()
      .allocate(class, class_size, &self.source, &config)
  }

  unsafe fn free_small(
    &mut self,
    class: usize,
    segment: Segment,
  ) {
    unsafe { self.arenas[class].lock().free(segment) }
  }
}

unsafe impl<P: PageSource> GlobalAlloc for LockedHeap<P> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > MIN_ALIGN {
      return unsafe { System.alloc(layout) };
    }
    self.allocate(layout.size().max(1))
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    if layout.align() > MIN_ALIGN {
      return unsafe { System.dealloc(ptr, layout) };
    }
    unsafe { self.free(ptr) }
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > MIN_ALIGN {
      return unsafe { System.alloc_zeroed(layout) };
    }
    self.zero_allocate(1, layout.size().max(1))
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() > MIN_ALIGN {
      return unsafe { System.realloc(ptr, layout, new_size) };
    }
    unsafe { self.resize(ptr, new_size.max(1)) }
  }
}
