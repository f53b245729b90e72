use thiserror::Error;

/// Reasons an allocation-family call produced no memory.
///
/// The C-shaped entry points collapse all of these into a null return;
/// the `try_*` variants hand them to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("zero-sized request")]
  ZeroSize,
  #[error("{count} * {size} overflows usize")]
  Overflow { count: usize, size: usize },
  #[error("request of {size} bytes exceeds the address space")]
  TooLarge { size: usize },
  #[error("mapping {len} bytes failed (errno {errno})")]
  MapFailed { len: usize, errno: i32 },
  #[error("growing region {base:#x} from {old_len} to {new_len} bytes failed (errno {errno})")]
  RemapFailed {
    base: usize,
    old_len: usize,
    new_len: usize,
    errno: i32,
  },
  #[error("unmapping {len} bytes at {base:#x} failed (errno {errno})")]
  UnmapFailed { base: usize, len: usize, errno: i32 },
  #[error("arena for class {class} exhausted its {limit} byte reservation")]
  ReservationExhausted { class: usize, limit: usize },
  #[error("size {size} has no size class")]
  ClassOutOfRange { size: usize },
  #[error("page size {requested} is not a power-of-two multiple of the system page size {system}")]
  InvalidPageSize { requested: usize, system: usize },
}

/// `errno` of the last failed libc call.
pub(crate) fn last_errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
