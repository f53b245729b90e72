//! Small-object arenas.
//!
//! One growable region per size class, carved into fixed-size segments that
//! are threaded onto a LIFO free list:
//!
//! ```text
//!   base                                             region_size   reserve
//!   ┌────────┬───────────┬───────────┬─────┬───────────┬────┬ ─ ─ ─ ─ ─ ─┐
//!   │ Header │ Node│class│ Node│class│ ... │ Node│class│tail│  not mapped
//!   └────────┴───────────┴───────────┴─────┴───────────┴────┴ ─ ─ ─ ─ ─ ─┘
//!            ◄─segment──►
//! ```
//!
//! Growth commits one more page after `region_size` and carves it starting at
//! the end of the last full segment, so the tail of the previous page is
//! reused and no handed-out segment is ever touched.

use std::ptr::NonNull;

use crate::{
  config::Config,
  error::AllocError,
  os::PageSource,
  region::{FreeList, HEADER_SIZE, Header, NODE_SIZE, Region, Segment},
};

/// What an allocation had to do to the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaEvent {
  /// Served from the existing free list.
  Reused,
  /// First use of the class mapped its first page.
  Created { base: usize, region_size: usize },
  /// The free list ran dry and the region grew.
  Grew { from: usize, to: usize },
}

/// Snapshot of one class arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaInfo {
  pub base: usize,
  pub region_size: usize,
  pub segment_size: usize,
  pub free_segments: usize,
}

/// Per-class state: the arena region and its free list.
#[derive(Debug)]
pub struct SizeClassArena {
  region: Option<Region>,
  region_size: usize,
  free: FreeList,
}

// The arena owns its region exclusively; handles are only raw addresses.
unsafe impl Send for SizeClassArena {}

impl SizeClassArena {
  pub const fn new() -> Self {
    Self {
      region: None,
      region_size: 0,
      free: FreeList::new(),
    }
  }

  pub fn is_active(&self) -> bool {
    self.region.is_some()
  }

  pub fn info(&self) -> Option<ArenaInfo> {
    let region = self.region?;
    Some(ArenaInfo {
      base: region.base().as_ptr() as usize,
      region_size: self.region_size,
      segment_size: region.segment_size(),
      free_segments: self.free.len(),
    })
  }

  /// Pops a segment of `class_size` bytes, mapping or growing the arena first
  /// when needed.
  pub fn allocate<P: PageSource>(
    &mut self,
    class: usize,
    class_size: usize,
    source: &P,
    config: &Config,
  ) -> Result<(NonNull<u8>, ArenaEvent), AllocError> {
    let mut event = ArenaEvent::Reused;

    let region = match self.region {
      Some(region) => region,
      None => {
        let region = self.create(class_size, source, config)?;
        event = ArenaEvent::Created {
          base: region.base().as_ptr() as usize,
          region_size: self.region_size,
        };
        region
      }
    };

    loop {
      if let Some(segment) = self.free.pop() {
        return Ok((segment.payload(), event));
      }

      let from = self.region_size;
      self.grow(region, class, source, config)?;
      event = ArenaEvent::Grew {
        from,
        to: self.region_size,
      };
    }
  }

  /// Returns a segment to the front of the free list.
  ///
  /// # Safety
  ///
  /// `segment` must belong to this arena and be owned by the caller.
  pub unsafe fn free(
    &mut self,
    segment: Segment,
  ) {
    let offset = segment.offset();
    unsafe { self.free.push(segment, offset) };
  }

  /// Unmaps the arena's whole reservation and returns to the unborn state.
  ///
  /// # Safety
  ///
  /// No segment of this arena may be accessed afterwards.
  pub unsafe fn release<P: PageSource>(
    &mut self,
    source: &P,
    config: &Config,
  ) -> Result<(), AllocError> {
    let Some(region) = self.region.take() else {
      return Ok(());
    };

    self.region_size = 0;
    self.free.clear();

    unsafe { source.unmap(region.base(), config.arena_reserve()) }
  }

  fn create<P: PageSource>(
    &mut self,
    class_size: usize,
    source: &P,
    config: &Config,
  ) -> Result<Region, AllocError> {
    let page_size = config.page_size();
    let base = source.map_growable(page_size, config.arena_reserve())?;

    let region = unsafe {
      Region::init(
        base,
        Header {
          region_size: page_size,
          segment_size: class_size,
        },
      )
    };

    self.region = Some(region);
    self.region_size = page_size;
    self.carve(region, HEADER_SIZE, page_size, class_size);

    Ok(region)
  }

  fn grow<P: PageSource>(
    &mut self,
    region: Region,
    class: usize,
    source: &P,
    config: &Config,
  ) -> Result<(), AllocError> {
    let old_size = self.region_size;
    let new_size = old_size + config.page_size();

    if new_size > config.arena_reserve() {
      return Err(AllocError::ReservationExhausted {
        class,
        limit: config.arena_reserve(),
      });
    }

    unsafe { source.remap(region.base(), old_size, new_size)? };

    region.set_region_size(new_size);
    self.region_size = new_size;

    let segment_size = region.segment_size();
    let carved_end = segments_end(old_size, segment_size);
    self.carve(region, carved_end, new_size, segment_size);

    Ok(())
  }

  /// Threads every whole segment in `from..to` onto the free list, newest
  /// first.
  fn carve(
    &mut self,
    region: Region,
    from: usize,
    to: usize,
    class_size: usize,
  ) {
    let stride = class_size + NODE_SIZE;
    let mut offset = from;

    while offset + stride <= to {
      unsafe { self.free.push(region.segment_at(offset), offset) };
      offset += stride;
    }
  }
}

impl Default for SizeClassArena {
  fn default() -> Self {
    Self::new()
  }
}

/// Offset just past the last whole segment of a region of `region_size`.
pub fn segments_end(
  region_size: usize,
  class_size: usize,
) -> usize {
  let stride = class_size + NODE_SIZE;
  HEADER_SIZE + (region_size - HEADER_SIZE) / stride * stride
}

/// Number of segments a fresh arena of one page holds.
#[cfg(test)]
pub fn segments_per_page(
  page_size: usize,
  class_size: usize,
) -> usize {
  (page_size - HEADER_SIZE) / (class_size + NODE_SIZE)
}
