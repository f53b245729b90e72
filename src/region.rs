//! In-place metadata shared by small arenas and large regions.
//!
//! ```text
//!   Region:
//!   ┌──────────────┬──────────┬────────────────┬──────────┬────────────────┬───
//!   │    Header    │   Node   │    payload     │   Node   │    payload     │ ...
//!   │ region_size  │ offset ──┼─┐              │ offset   │                │
//!   │ segment_size │ next     │ │              │ next     │                │
//!   └──────────────┴──────────┴─┼──────────────┴──────────┴────────────────┴───
//!   ▲                           │
//!   └───────────────────────────┘  node address - offset == header address
//! ```
//!
//! Everything that reinterprets raw bytes as a [`Header`] or a [`Node`] lives
//! in this module. The rest of the crate only sees [`Region`], [`Segment`] and
//! [`FreeList`] handles.

use std::{mem, ptr, ptr::NonNull};

/// Record at the base of every mapped region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
  /// Bytes currently usable in the mapping, header included.
  pub region_size: usize,
  /// Size class (small arenas) or word-aligned payload size (large regions).
  pub segment_size: usize,
}

/// Record in front of every segment. Owned by the allocator only while the
/// segment is free; `offset` survives while the caller owns the payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Node {
  pub offset: usize,
  pub next: *mut Node,
}

pub const HEADER_SIZE: usize = mem::size_of::<Header>();
pub const NODE_SIZE: usize = mem::size_of::<Node>();

/// Handle on a mapped region whose base holds a live [`Header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  base: NonNull<u8>,
}

impl Region {
  /// Writes `header` at `base`.
  ///
  /// # Safety
  ///
  /// `base` must be word-aligned and point to at least `header.region_size`
  /// writable bytes owned by the allocator.
  pub unsafe fn init(
    base: NonNull<u8>,
    header: Header,
  ) -> Self {
    unsafe { base.cast::<Header>().write(header) };
    Self { base }
  }

  pub fn base(self) -> NonNull<u8> {
    self.base
  }

  pub fn header(self) -> Header {
    unsafe { self.base.cast::<Header>().read() }
  }

  /// Rewrites only the size field so concurrent readers of `segment_size`
  /// never observe a write.
  pub fn set_region_size(
    self,
    region_size: usize,
  ) {
    unsafe {
      let header = self.base.cast::<Header>().as_ptr();
      ptr::addr_of_mut!((*header).region_size).write(region_size);
    }
  }

  pub fn segment_size(self) -> usize {
    unsafe {
      let header = self.base.cast::<Header>().as_ptr();
      ptr::addr_of!((*header).segment_size).read()
    }
  }

  /// Segment slot whose node sits `offset` bytes past the header.
  ///
  /// # Safety
  ///
  /// `offset + NODE_SIZE` must lie inside the region and `offset` must be a
  /// multiple of the word size.
  pub unsafe fn segment_at(
    self,
    offset: usize,
  ) -> Segment {
    let node = unsafe { self.base.add(offset) };
    Segment {
      node: node.cast::<Node>(),
    }
  }

  /// Writes an unlinked node at `offset` and returns its segment.
  ///
  /// # Safety
  ///
  /// Same as [`Region::segment_at`].
  pub unsafe fn detached_segment(
    self,
    offset: usize,
  ) -> Segment {
    let segment = unsafe { self.segment_at(offset) };
    segment.write(Node {
      offset,
      next: ptr::null_mut(),
    });
    segment
  }
}

/// One segment slot, addressed through its leading node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
  node: NonNull<Node>,
}

impl Segment {
  /// Recovers the segment owning a payload pointer handed out earlier.
  ///
  /// # Safety
  ///
  /// `payload` must have been returned by this allocator and not freed since.
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    let node = unsafe { payload.sub(NODE_SIZE) };
    Self {
      node: node.cast::<Node>(),
    }
  }

  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.node.cast::<u8>().add(NODE_SIZE) }
  }

  pub fn offset(self) -> usize {
    unsafe {
      let node = self.node.as_ptr();
      ptr::addr_of!((*node).offset).read()
    }
  }

  /// Region whose header the node points back to.
  pub fn region(self) -> Region {
    let base = unsafe { self.node.cast::<u8>().sub(self.offset()) };
    Region { base }
  }

  fn write(
    self,
    node: Node,
  ) {
    unsafe { self.node.write(node) };
  }

  fn next(self) -> Option<Segment> {
    let next = unsafe {
      let node = self.node.as_ptr();
      ptr::addr_of!((*node).next).read()
    };
    NonNull::new(next).map(|node| Segment { node })
  }
}

/// Intrusive LIFO stack of free segments.
#[derive(Debug, Default)]
pub struct FreeList {
  head: Option<Segment>,
  len: usize,
}

impl FreeList {
  pub const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  /// Links `segment` in front of the current head, recording `offset` as its
  /// distance back to the region header.
  ///
  /// # Safety
  ///
  /// The segment must not be in use by a caller nor already on a list.
  pub unsafe fn push(
    &mut self,
    segment: Segment,
    offset: usize,
  ) {
    let next = self
      .head
      .map_or(ptr::null_mut(), |head| head.node.as_ptr());
    segment.write(Node { offset, next });
    self.head = Some(segment);
    self.len += 1;
  }

  pub fn pop(&mut self) -> Option<Segment> {
    let head = self.head?;
    self.head = head.next();
    self.len -= 1;
    Some(head)
  }

  pub fn len(&self) -> usize {
    self.len
  }

  /// Forgets every node without touching memory.
  pub fn clear(&mut self) {
    self.head = None;
    self.len = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[repr(C, align(16))]
  struct Page([u8; 512]);

  #[test]
  fn test_layout() {
    assert_eq!(HEADER_SIZE, 2 * mem::size_of::<usize>());
    assert_eq!(NODE_SIZE, 2 * mem::size_of::<usize>());
  }

  #[test]
  fn test_segment_finds_header() {
    let mut page = Page([0; 512]);
    let base = NonNull::new(page.0.as_mut_ptr()).unwrap();

    unsafe {
      let region = Region::init(
        base,
        Header {
          region_size: 512,
          segment_size: 32,
        },
      );

      let offset = HEADER_SIZE + 2 * (32 + NODE_SIZE);
      let mut list = FreeList::new();
      list.push(region.segment_at(offset), offset);

      let segment = list.pop().unwrap();
      let payload = segment.payload();
      assert_eq!(payload.as_ptr(), base.as_ptr().add(offset + NODE_SIZE));

      let found = Segment::from_payload(payload);
      assert_eq!(found, segment);
      assert_eq!(found.offset(), offset);
      assert_eq!(found.region(), region);
      assert_eq!(found.region().segment_size(), 32);
    }
  }

  #[test]
  fn test_free_list_is_lifo() {
    let mut page = Page([0; 512]);
    let base = NonNull::new(page.0.as_mut_ptr()).unwrap();
    let stride = 16 + NODE_SIZE;

    unsafe {
      let region = Region::init(
        base,
        Header {
          region_size: 512,
          segment_size: 16,
        },
      );

      let mut list = FreeList::new();
      assert_eq!(list.len(), 0);

      let offsets: Vec<usize> = (0..4).map(|i| HEADER_SIZE + i * stride).collect();
      for &offset in &offsets {
        list.push(region.segment_at(offset), offset);
      }
      assert_eq!(list.len(), 4);

      for &offset in offsets.iter().rev() {
        assert_eq!(list.pop().unwrap().offset(), offset);
      }
      assert!(list.pop().is_none());
      assert_eq!(list.len(), 0);
    }
  }

  #[test]
  fn test_set_region_size_keeps_segment_size() {
    let mut page = Page([0; 512]);
    let base = NonNull::new(page.0.as_mut_ptr()).unwrap();

    let region = unsafe {
      Region::init(
        base,
        Header {
          region_size: 256,
          segment_size: 64,
        },
      )
    };
    region.set_region_size(512);

    assert_eq!(
      region.header(),
      Header {
        region_size: 512,
        segment_size: 64,
      }
    );
  }
}
