//! Large objects: one private mapping per request.
//!
//! ```text
//!   ┌────────┬──────────────┬──────────────────────────────┬─────────┐
//!   │ Header │ Node         │ payload (align_word(size))   │ padding │
//!   │        │ offset = H   │                              │         │
//!   └────────┴──────────────┴──────────────────────────────┴─────────┘
//!   ◄──────────────────────── region_size (whole pages) ─────────────►
//! ```

use std::ptr::NonNull;

use log::trace;

use crate::{
  align::{align_page, align_word},
  config::Config,
  error::AllocError,
  os::PageSource,
  region::{HEADER_SIZE, Header, NODE_SIZE, Region},
};

/// Bytes mapped for a large request of `size` bytes.
pub fn region_size(
  size: usize,
  config: &Config,
) -> Result<usize, AllocError> {
  let limit = usize::MAX - HEADER_SIZE - NODE_SIZE - 2 * config.page_size();
  if size > limit {
    return Err(AllocError::TooLarge { size });
  }

  Ok(align_page(align_word(size) + HEADER_SIZE + NODE_SIZE, config.page_size()))
}

pub fn allocate<P: PageSource>(
  size: usize,
  source: &P,
  config: &Config,
) -> Result<NonNull<u8>, AllocError> {
  let region_size = region_size(size, config)?;
  let segment_size = align_word(size);
  let base = source.map(region_size)?;

  let region = unsafe {
    Region::init(
      base,
      Header {
        region_size,
        segment_size,
      },
    )
  };

  // The single node is consumed at once and never linked.
  let segment = unsafe { region.detached_segment(HEADER_SIZE) };

  trace!(
    "large: mapped {} bytes at {:p} for {} bytes",
    region_size,
    base.as_ptr(),
    size
  );

  Ok(segment.payload())
}

/// Unmaps the whole region behind a large allocation.
///
/// # Safety
///
/// `region` must be the header of a live large allocation.
pub unsafe fn release<P: PageSource>(
  region: Region,
  source: &P,
) -> Result<(), AllocError> {
  let header = region.header();

  trace!(
    "large: unmapping {} bytes at {:p}",
    header.region_size,
    region.base().as_ptr()
  );

  unsafe { source.unmap(region.base(), header.region_size) }
}
