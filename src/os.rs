use std::{
  ptr::{self, NonNull},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::{AllocError, last_errno};

/// Page-granular anonymous memory, as provided by the environment.
///
/// # Safety
///
/// Implementations must return fresh, zero-filled, private, readable and
/// writable memory aligned to `page_size()`, and `remap` must never move a
/// mapping.
pub unsafe trait PageSource {
  fn page_size(&self) -> usize;

  /// Maps `len` bytes.
  fn map(
    &self,
    len: usize,
  ) -> Result<NonNull<u8>, AllocError>;

  /// Reserves `limit` bytes of address space of which the first `len` bytes
  /// are usable. The mapping can later be extended in place with `remap`.
  fn map_growable(
    &self,
    len: usize,
    limit: usize,
  ) -> Result<NonNull<u8>, AllocError>;

  /// Extends a growable mapping from `old_len` to `new_len` usable bytes at
  /// the same base.
  ///
  /// # Safety
  ///
  /// `base` must come from `map_growable` and `new_len` must not exceed the
  /// reserved limit.
  unsafe fn remap(
    &self,
    base: NonNull<u8>,
    old_len: usize,
    new_len: usize,
  ) -> Result<(), AllocError>;

  /// # Safety
  ///
  /// `base..base + len` must be a mapping obtained from this source that no
  /// one accesses afterwards.
  unsafe fn unmap(
    &self,
    base: NonNull<u8>,
    len: usize,
  ) -> Result<(), AllocError>;
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// `mmap(2)`-backed page source.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmap;

impl Mmap {
  pub const fn new() -> Self {
    Self
  }

  /// Page size reported by `sysconf(_SC_PAGESIZE)`, queried once.
  pub fn system_page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
      return cached;
    }

    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if queried > 0 { queried as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
  }

  fn mmap(
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
  ) -> Result<NonNull<u8>, AllocError> {
    let addr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
        -1,
        0,
      )
    };

    if addr == libc::MAP_FAILED {
      return Err(AllocError::MapFailed {
        len,
        errno: last_errno(),
      });
    }

    NonNull::new(addr.cast::<u8>()).ok_or(AllocError::MapFailed { len, errno: 0 })
  }
}

unsafe impl PageSource for Mmap {
  fn page_size(&self) -> usize {
    Self::system_page_size()
  }

  fn map(
    &self,
    len: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    Self::mmap(len, libc::PROT_READ | libc::PROT_WRITE, 0)
  }

  fn map_growable(
    &self,
    len: usize,
    limit: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let base = Self::mmap(limit, libc::PROT_NONE, libc::MAP_NORESERVE)?;

    if let Err(err) = unsafe { self.remap(base, 0, len) } {
      let _ = unsafe { self.unmap(base, limit) };
      return Err(err);
    }

    Ok(base)
  }

  unsafe fn remap(
    &self,
    base: NonNull<u8>,
    old_len: usize,
    new_len: usize,
  ) -> Result<(), AllocError> {
    let start = unsafe { base.add(old_len) };
    let rc = unsafe {
      libc::mprotect(
        start.as_ptr().cast::<libc::c_void>(),
        new_len - old_len,
        libc::PROT_READ | libc::PROT_WRITE,
      )
    };

    if rc != 0 {
      return Err(AllocError::RemapFailed {
        base: base.as_ptr() as usize,
        old_len,
        new_len,
        errno: last_errno(),
      });
    }

    Ok(())
  }

  unsafe fn unmap(
    &self,
    base: NonNull<u8>,
    len: usize,
  ) -> Result<(), AllocError> {
    let rc = unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), len) };

    if rc != 0 {
      return Err(AllocError::UnmapFailed {
        base: base.as_ptr() as usize,
        len,
        errno: last_errno(),
      });
    }

    Ok(())
  }
}
