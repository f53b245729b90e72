//! Heap geometry.
//!
//! Everything the allocator derives from the environment: the page size, the
//! small/large threshold (half a page) and how much address space each size
//! class arena may grow into.

use crate::{
  align::{NUM_CLASSES, align_page, class_size},
  error::AllocError,
  os::PageSource,
};

/// Address space reserved per size-class arena.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_ARENA_RESERVE: usize = 1 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_ARENA_RESERVE: usize = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  page_size: usize,
  threshold: usize,
  arena_reserve: usize,
}

impl Config {
  /// Geometry of the system pages handed out by `source`.
  pub fn detect<P: PageSource>(source: &P) -> Self {
    Self::from_page_size(source.page_size())
  }

  /// Uses a logical page size larger than the system one.
  pub fn with_page_size<P: PageSource>(
    source: &P,
    page_size: usize,
  ) -> Result<Self, AllocError> {
    let system = source.page_size();

    if !page_size.is_power_of_two() || page_size < system {
      return Err(AllocError::InvalidPageSize {
        requested: page_size,
        system,
      });
    }

    Ok(Self::from_page_size(page_size))
  }

  /// Caps how far each small arena may grow, rounded to whole pages and
  /// clamped to the largest page multiple.
  pub fn with_arena_reserve(
    mut self,
    bytes: usize,
  ) -> Self {
    let largest = usize::MAX & !(self.page_size - 1);
    self.arena_reserve = align_page(bytes.clamp(self.page_size, largest), self.page_size);
    self
  }

  fn from_page_size(page_size: usize) -> Self {
    Self {
      page_size,
      threshold: (page_size / 2).min(class_size(NUM_CLASSES - 1)),
      arena_reserve: align_page(DEFAULT_ARENA_RESERVE.max(page_size), page_size),
    }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Largest request served by the small path.
  pub fn threshold(&self) -> usize {
    self.threshold
  }

  pub fn arena_reserve(&self) -> usize {
    self.arena_reserve
  }

  #[inline]
  pub fn is_small(
    &self,
    size: usize,
  ) -> bool {
    size <= self.threshold
  }
}
