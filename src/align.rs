use crate::error::AllocError;
use crate::region::NODE_SIZE;

/// Number of power-of-two size classes tracked per heap.
///
/// Class `i` serves segments of `2^(i + 1)` bytes, so the table covers
/// thresholds up to 64 KiB (page sizes up to 128 KiB).
pub const NUM_CLASSES: usize = 16;

/// Smallest size class handed out by the small path.
///
/// Keeping every class a multiple of the node size keeps every segment, and
/// therefore every payload, aligned to [`MIN_ALIGN`].
pub const MIN_CLASS_SIZE: usize = NODE_SIZE;

/// Alignment guaranteed for every pointer returned by the allocator.
pub const MIN_ALIGN: usize = NODE_SIZE;

/// Calculates the machine word alignment for the given size.
///
/// # Examples
///
/// ```rust
/// use segalloc::align;
///
/// match core::mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, ::core::mem::size_of::<usize>())
  };
}

/// Rounds `value` up to the next multiple of `to`, which must be a power of two.
///
/// ```rust
/// use segalloc::align_to;
///
/// assert_eq!(align_to!(4097, 4096), 8192);
/// assert_eq!(align_to!(4096, 4096), 4096);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $to:expr) => {
    ($value + $to - 1) & !($to - 1)
  };
}

/// Rounds a small request up to its power-of-two size class.
///
/// Requests below [`MIN_CLASS_SIZE`] share the smallest class.
#[inline]
pub const fn align_small(size: usize) -> usize {
  if size <= MIN_CLASS_SIZE {
    MIN_CLASS_SIZE
  } else {
    size.next_power_of_two()
  }
}

#[inline]
pub const fn align_word(size: usize) -> usize {
  align!(size)
}

#[inline]
pub const fn align_page(
  size: usize,
  page_size: usize,
) -> usize {
  align_to!(size, page_size)
}

/// Maps an aligned class size to its slot in the per-class tables
/// (`log2(size) - 1`).
pub fn class_index(aligned_size: usize) -> Result<usize, AllocError> {
  if aligned_size < MIN_CLASS_SIZE || !aligned_size.is_power_of_two() {
    return Err(AllocError::ClassOutOfRange { size: aligned_size });
  }

  let index = aligned_size.trailing_zeros() as usize - 1;

  if index >= NUM_CLASSES {
    return Err(AllocError::ClassOutOfRange { size: aligned_size });
  }

  Ok(index)
}

/// Inverse of [`class_index`].
#[inline]
pub const fn class_size(index: usize) -> usize {
  1 << (index + 1)
}
