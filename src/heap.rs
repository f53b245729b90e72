//! The allocation facade.
//!
//! [`Heap`] is the single-threaded allocator context: one [`SizeClassArena`]
//! per size class plus the page source that backs them. The dispatch below is
//! shared with [`LockedHeap`](crate::LockedHeap), which only differs in how
//! it reaches a class arena.

use std::ptr::{self, NonNull};

use log::{debug, warn};

use crate::{
  align::{NUM_CLASSES, align_small, align_word, class_index},
  config::Config,
  error::AllocError,
  large,
  os::{Mmap, PageSource},
  region::Segment,
  small::{ArenaEvent, ArenaInfo, SizeClassArena},
};

/// Access to the per-class arenas of a heap front end.
pub(crate) trait Arenas {
  type Source: PageSource;

  fn page_source(&self) -> &Self::Source;

  fn geometry(&self) -> Config;

  fn allocate_small(
    &mut self,
    class: usize,
    class_size: usize,
  ) -> Result<(NonNull<u8>, ArenaEvent), AllocError>;

  /// # Safety
  ///
  /// `segment` must be a live allocation of class `class` from this table.
  unsafe fn free_small(
    &mut self,
    class: usize,
    segment: Segment,
  );
}

pub(crate) fn try_allocate<A: Arenas>(
  arenas: &mut A,
  size: usize,
) -> Result<NonNull<u8>, AllocError> {
  if size == 0 {
    return Err(AllocError::ZeroSize);
  }

  let config = arenas.geometry();

  if !config.is_small(size) {
    return large::allocate(size, arenas.page_source(), &config);
  }

  let class_size = align_small(size);
  let class = class_index(class_size)?;
  let (payload, event) = arenas.allocate_small(class, class_size)?;

  match event {
    ArenaEvent::Reused => {}
    ArenaEvent::Created { base, region_size } => {
      debug!("arena {class}: mapped {region_size} bytes at {base:#x} for {class_size} byte segments")
    }
    ArenaEvent::Grew { from, to } => debug!("arena {class}: grew from {from} to {to} bytes"),
  }

  Ok(payload)
}

pub(crate) fn try_zero_allocate<A: Arenas>(
  arenas: &mut A,
  count: usize,
  size: usize,
) -> Result<NonNull<u8>, AllocError> {
  if count == 0 || size == 0 {
    return Err(AllocError::ZeroSize);
  }

  let total = count
    .checked_mul(size)
    .ok_or(AllocError::Overflow { count, size })?;
  let payload = try_allocate(arenas, total)?;

  // Large regions come straight from fresh zeroed pages.
  if arenas.geometry().is_small(total) {
    unsafe { payload.as_ptr().write_bytes(0, total) };
  }

  Ok(payload)
}

pub(crate) fn allocate<A: Arenas>(
  arenas: &mut A,
  size: usize,
) -> *mut u8 {
  into_raw(try_allocate(arenas, size), "allocate", size)
}

pub(crate) fn zero_allocate<A: Arenas>(
  arenas: &mut A,
  count: usize,
  size: usize,
) -> *mut u8 {
  into_raw(
    try_zero_allocate(arenas, count, size),
    "zero_allocate",
    size.wrapping_mul(count),
  )
}

/// # Safety
///
/// `ptr` must be null or a live allocation from the same front end.
pub(crate) unsafe fn resize<A: Arenas>(
  arenas: &mut A,
  ptr: *mut u8,
  size: usize,
) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return allocate(arenas, size);
  };

  if size == 0 {
    unsafe { free(arenas, ptr) };
    return ptr::null_mut();
  }

  let new = match try_allocate(arenas, size) {
    Ok(new) => new,
    Err(err) => {
      warn!("resize({old:p}, {size}) failed: {err}");
      return ptr::null_mut();
    }
  };

  let old_size = unsafe { Segment::from_payload(old).region().segment_size() };
  let len = old_size.min(align_word(size));

  unsafe {
    ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), len);
    free(arenas, ptr);
  }

  new.as_ptr()
}

/// # Safety
///
/// `ptr` must be null or a live allocation from the same front end.
pub(crate) unsafe fn free<A: Arenas>(
  arenas: &mut A,
  ptr: *mut u8,
) {
  let Some(payload) = NonNull::new(ptr) else {
    return;
  };

  let segment = unsafe { Segment::from_payload(payload) };
  let region = segment.region();
  let segment_size = region.segment_size();

  if !arenas.geometry().is_small(segment_size) {
    if let Err(err) = unsafe { large::release(region, arenas.page_source()) } {
      warn!("free({payload:p}): {err}");
    }
    return;
  }

  match class_index(segment_size) {
    Ok(class) => unsafe { arenas.free_small(class, segment) },
    Err(err) => warn!("free({payload:p}): {err}"),
  }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from the same front end.
pub(crate) unsafe fn usable_size(ptr: *mut u8) -> usize {
  match NonNull::new(ptr) {
    Some(payload) => unsafe { Segment::from_payload(payload).region().segment_size() },
    None => 0,
  }
}

fn into_raw(
  result: Result<NonNull<u8>, AllocError>,
  op: &str,
  size: usize,
) -> *mut u8 {
  match result {
    Ok(payload) => payload.as_ptr(),
    Err(AllocError::ZeroSize) => ptr::null_mut(),
    Err(err) => {
      warn!("{op}({size}) failed: {err}");
      ptr::null_mut()
    }
  }
}

/// Single-threaded segregated heap.
///
/// Small requests (up to half a page) are served from per-class arenas,
/// larger ones get a private mapping each. Arenas live until
/// [`Heap::release_arenas`] or until the heap is dropped.
pub struct Heap<P: PageSource = Mmap> {
  source: P,
  config: Config,
  arenas: [SizeClassArena; NUM_CLASSES],
}

impl Heap<Mmap> {
  pub fn new() -> Self {
    Self::with_source(Mmap::new())
  }
}

impl Default for Heap<Mmap> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: PageSource> Heap<P> {
  pub fn with_source(source: P) -> Self {
    let config = Config::detect(&source);
    Self::with_config(source, config)
  }

  pub fn with_config(
    source: P,
    config: Config,
  ) -> Self {
    Self {
      source,
      config,
      arenas: [const { SizeClassArena::new() }; NUM_CLASSES],
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn try_allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    try_allocate(self, size)
  }

  /// Returns at least `size` writable bytes, or null when `size` is zero or
  /// the pages cannot be mapped.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    allocate(self, size)
  }

  pub fn try_zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    try_zero_allocate(self, count, size)
  }

  /// Returns `count * size` zeroed bytes, or null on zero input, overflow or
  /// mapping failure.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    zero_allocate(self, count, size)
  }

  /// Moves an allocation to a fresh block of `size` bytes.
  ///
  /// A null `ptr` behaves like [`Heap::allocate`]; a zero `size` frees `ptr`
  /// and returns null. On failure `ptr` is left untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn resize(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe { resize(self, ptr, size) }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap. It is not
  /// validated.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    unsafe { free(self, ptr) }
  }

  /// Bytes usable behind `ptr`: its size class, or the word-aligned size of a
  /// large request.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    unsafe { usable_size(ptr) }
  }

  pub fn arena_info(
    &self,
    class: usize,
  ) -> Option<ArenaInfo> {
    self.arenas.get(class)?.info()
  }

  /// Unmaps every small arena.
  ///
  /// # Safety
  ///
  /// No small allocation from this heap may be used afterwards.
  pub unsafe fn release_arenas(&mut self) {
    for (class, arena) in self.arenas.iter_mut().enumerate() {
      if !arena.is_active() {
        continue;
      }

      match unsafe { arena.release(&self.source, &self.config) } {
        Ok(()) => debug!("arena {class}: released"),
        Err(err) => warn!("arena {class}: {err}"),
      }
    }
  }
}

impl<P: PageSource> Arenas for Heap<P> {
  type Source = P;

  fn page_source(&self) -> &P {
    &self.source
  }

  fn geometry(&self) -> Config {
    self.config
  }

  fn allocate_small(
    &mut self,
    class: usize,
    class_size: usize,
  ) -> Result<(NonNull<u8>, ArenaEvent), AllocError> {
    self.arenas[class].allocate(class, class_size, &self.source, &self.config)
  }

  unsafe fn free_small(
    &mut self,
    class: usize,
    segment: Segment,
  ) {
    unsafe { self.arenas[class].free(segment) }
  }
}

impl<P: PageSource> Drop for Heap<P> {
  fn drop(&mut self) {
    unsafe { self.release_arenas() };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    align::align_page,
    region::{HEADER_SIZE, NODE_SIZE},
    small::segments_per_page,
  };
  use std::{cell::Cell, slice};

  /// Page source that stops mapping after a fixed number of calls.
  struct Budget {
    maps_left: Cell<usize>,
    unmapped: Cell<usize>,
  }

  impl Budget {
    fn new(maps: usize) -> Self {
      Self {
        maps_left: Cell::new(maps),
        unmapped: Cell::new(0),
      }
    }

    fn take(
      &self,
      len: usize,
    ) -> Result<(), AllocError> {
      match self.maps_left.get() {
        0 => Err(AllocError::MapFailed {
          len,
          errno: libc::ENOMEM,
        }),
        left => {
          self.maps_left.set(left - 1);
          Ok(())
        }
      }
    }
  }

  unsafe impl PageSource for Budget {
    fn page_size(&self) -> usize {
      Mmap.page_size()
    }

    fn map(
      &self,
      len: usize,
    ) -> Result<NonNull<u8>, AllocError> {
      self.take(len)?;
      Mmap.map(len)
    }

    fn map_growable(
      &self,
      len: usize,
      limit: usize,
    ) -> Result<NonNull<u8>, AllocError> {
      self.take(len)?;
      Mmap.map_growable(len, limit)
    }

    unsafe fn remap(
      &self,
      base: NonNull<u8>,
      old_len: usize,
      new_len: usize,
    ) -> Result<(), AllocError> {
      self.take(new_len)?;
      unsafe { Mmap.remap(base, old_len, new_len) }
    }

    unsafe fn unmap(
      &self,
      base: NonNull<u8>,
      len: usize,
    ) -> Result<(), AllocError> {
      self.unmapped.set(self.unmapped.get() + len);
      unsafe { Mmap.unmap(base, len) }
    }
  }

  #[test]
  fn test_degenerate_input() {
    let mut heap = Heap::new();

    assert!(heap.allocate(0).is_null());
    assert_eq!(heap.try_allocate(0), Err(AllocError::ZeroSize));
    assert!(heap.zero_allocate(0, 8).is_null());
    assert!(heap.zero_allocate(8, 0).is_null());

    unsafe {
      heap.free(ptr::null_mut());
      assert_eq!(heap.usable_size(ptr::null_mut()), 0);
    }

    for class in 0..NUM_CLASSES {
      assert_eq!(heap.arena_info(class), None);
    }
  }

  #[test]
  fn test_small_allocations_are_writable() {
    let mut heap = Heap::new();
    let threshold = heap.config().threshold();

    let mut blocks = Vec::new();
    for size in [1, 2, 3, 7, 10, 16, 17, 100, 512, threshold - 1, threshold] {
      let ptr = heap.allocate(size);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % crate::MIN_ALIGN, 0);

      let usable = unsafe { heap.usable_size(ptr) };
      assert_eq!(usable, align_small(size));

      unsafe { ptr.write_bytes(size as u8, usable) };
      blocks.push((ptr, size, usable));
    }

    for (ptr, size, usable) in blocks {
      let bytes = unsafe { slice::from_raw_parts(ptr, usable) };
      assert!(bytes.iter().all(|&b| b == size as u8));
      unsafe { heap.free(ptr) };
    }
  }

  #[test]
  fn test_free_then_allocate_reuses_address() {
    let mut heap = Heap::new();

    let first = heap.allocate(24);
    let second = heap.allocate(24);
    assert_ne!(first, second);

    unsafe { heap.free(first) };
    assert_eq!(heap.allocate(24), first);

    // Same class, different request size.
    unsafe { heap.free(second) };
    assert_eq!(heap.allocate(30), second);
  }

  #[test]
  fn test_class_arena_scenario() {
    let mut heap = Heap::new();
    let page = heap.config().page_size();
    let class = class_index(16).unwrap();
    let per_page = segments_per_page(page, 16);

    let mut seen = Vec::new();
    for i in 0..per_page {
      let ptr = heap.allocate(10);
      assert!(!seen.contains(&ptr));
      unsafe { ptr.write_bytes(i as u8, 10) };
      seen.push(ptr);
    }

    let info = heap.arena_info(class).unwrap();
    assert_eq!(info.region_size, page);
    assert_eq!(info.segment_size, 16);
    assert_eq!(info.free_segments, 0);

    let grown = heap.allocate(10);
    assert!(!grown.is_null());
    assert!(!seen.contains(&grown));
    unsafe { grown.write_bytes(0xEE, 16) };

    let info = heap.arena_info(class).unwrap();
    assert_eq!(info.region_size, 2 * page);

    for (i, ptr) in seen.iter().enumerate() {
      let bytes = unsafe { slice::from_raw_parts(*ptr, 10) };
      assert!(bytes.iter().all(|&b| b == i as u8));
    }
  }

  #[test]
  fn test_large_allocation_maps_own_region() {
    let mut heap = Heap::with_source(Budget::new(usize::MAX));
    let page = heap.config().page_size();
    let size = heap.config().threshold() + page - 96;
    let expected = align_page(align_word(size) + HEADER_SIZE + NODE_SIZE, page);

    let small = heap.allocate(64);
    let ptr = heap.allocate(size);
    assert!(!ptr.is_null());
    assert_eq!(unsafe { heap.usable_size(ptr) }, align_word(size));

    unsafe {
      let bytes = slice::from_raw_parts_mut(ptr, size);
      assert!(bytes.iter().all(|&b| b == 0));
      bytes.fill(0x11);
      small.write_bytes(0x22, 64);

      heap.free(ptr);
    }

    assert_eq!(heap.page_source().unmapped.get(), expected);
    let bytes = unsafe { slice::from_raw_parts(small, 64) };
    assert!(bytes.iter().all(|&b| b == 0x22));
  }

  #[test]
  fn test_zero_allocate_fresh_and_reused() {
    let mut heap = Heap::new();

    let fresh = heap.zero_allocate(4, 8);
    let bytes = unsafe { slice::from_raw_parts_mut(fresh, 32) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes.fill(0xAB);
    unsafe { heap.free(fresh) };

    let reused = heap.zero_allocate(8, 4);
    assert_eq!(reused, fresh);
    let bytes = unsafe { slice::from_raw_parts(reused, 32) };
    assert!(bytes.iter().all(|&b| b == 0));

    let page = heap.config().page_size();
    let large = heap.zero_allocate(2, page);
    let bytes = unsafe { slice::from_raw_parts(large, 2 * page) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { heap.free(large) };
  }

  #[test]
  fn test_zero_allocate_overflow() {
    let mut heap = Heap::new();

    assert_eq!(
      heap.try_zero_allocate(usize::MAX, 2),
      Err(AllocError::Overflow {
        count: usize::MAX,
        size: 2,
      })
    );
    assert!(heap.zero_allocate(usize::MAX / 2, 3).is_null());

    assert_eq!(
      heap.try_allocate(usize::MAX),
      Err(AllocError::TooLarge { size: usize::MAX })
    );
    assert!(heap.allocate(usize::MAX - 1).is_null());
  }

  #[test]
  fn test_resize_preserves_contents() {
    let mut heap = Heap::new();
    let page = heap.config().page_size();

    unsafe {
      let ptr = heap.allocate(40);
      for i in 0..40 {
        ptr.add(i).write(i as u8);
      }

      let grown = heap.resize(ptr, 3 * page);
      assert!(!grown.is_null());
      assert_ne!(grown, ptr);
      for i in 0..40 {
        assert_eq!(grown.add(i).read(), i as u8);
      }

      let shrunk = heap.resize(grown, 20);
      assert!(!shrunk.is_null());
      assert_eq!(heap.usable_size(shrunk), 32);
      for i in 0..20 {
        assert_eq!(shrunk.add(i).read(), i as u8);
      }

      // The old small block went back to its class.
      assert_eq!(heap.allocate(40), ptr);
    }
  }

  #[test]
  fn test_resize_edge_cases() {
    let mut heap = Heap::new();

    unsafe {
      let ptr = heap.resize(ptr::null_mut(), 48);
      assert!(!ptr.is_null());
      assert_eq!(heap.usable_size(ptr), 64);

      assert!(heap.resize(ptr, 0).is_null());
      assert_eq!(heap.allocate(48), ptr);
    }
  }

  #[test]
  fn test_mapping_failure_returns_null() {
    let mut heap = Heap::with_source(Budget::new(1));
    let page = heap.config().page_size();

    let first = heap.allocate(8);
    assert!(!first.is_null());

    assert!(heap.allocate(page).is_null());
    assert!(heap.allocate(100).is_null());
    assert!(heap.zero_allocate(1, 100).is_null());

    unsafe {
      first.write(1);
      assert!(heap.resize(first, page * 4).is_null());
      assert_eq!(first.read(), 1);
    }

    assert!(matches!(
      heap.try_allocate(page),
      Err(AllocError::MapFailed { .. })
    ));
  }

  #[test]
  fn test_growth_failure_returns_null() {
    let mut heap = Heap::with_source(Budget::new(1));
    let page = heap.config().page_size();
    let per_page = segments_per_page(page, 64);

    for _ in 0..per_page {
      assert!(!heap.allocate(64).is_null());
    }
    assert!(heap.allocate(64).is_null());
    assert_eq!(
      heap.arena_info(class_index(64).unwrap()).unwrap().region_size,
      page
    );
  }

  #[test]
  fn test_release_arenas() {
    let mut heap = Heap::with_source(Budget::new(usize::MAX));
    let reserve = heap.config().arena_reserve();

    heap.allocate(8);
    heap.allocate(200);
    assert!(heap.arena_info(class_index(256).unwrap()).is_some());

    unsafe { heap.release_arenas() };
    assert_eq!(heap.page_source().unmapped.get(), 2 * reserve);
    for class in 0..NUM_CLASSES {
      assert_eq!(heap.arena_info(class), None);
    }

    let again = heap.allocate(8);
    assert!(!again.is_null());
  }
}
