//! # segalloc - A Segregated Size-Class Allocator
//!
//! This crate provides a general-purpose dynamic memory allocator that takes
//! its memory straight from anonymous page mappings (`mmap(2)`) and never
//! relies on another allocator.
//!
//! ## Overview
//!
//! Requests are split at half the OS page size:
//!
//! ```text
//!   allocate(size)
//!        │
//!        ├── size == 0 ──────────────► null
//!        │
//!        ├── size <= page / 2 ───────► small path
//!        │                               class = next_power_of_two(size)
//!        │                               pop the class free list
//!        │
//!        └── size >  page / 2 ───────► large path
//!                                        one private mapping per request
//! ```
//!
//! Each size class owns one arena, a growable region carved into segments of
//! `class + node` bytes:
//!
//! ```text
//!   Small-Object Arena (class 16, 4 KiB page):
//!
//!   ┌────────┬──────┬──────────┬──────┬──────────┬─────┬──────┬──────────┬────┐
//!   │ Header │ Node │ 16 bytes │ Node │ 16 bytes │ ... │ Node │ 16 bytes │    │
//!   └────────┴──────┴──────────┴──────┴──────────┴─────┴──────┴──────────┴────┘
//!                   ▲
//!                   └── pointer returned to the caller
//!
//!   free list (LIFO):  head ──► last carved ──► ... ──► first carved ──► ∅
//! ```
//!
//! When the free list runs dry the arena grows by one page at the same base
//! address, so every node's offset back to the header stays valid.
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Size-class index (align!, align_to!, class_index)
//!   ├── region     - Header / free-list node encoding (internal)
//!   ├── os         - PageSource trait and the mmap implementation
//!   ├── config     - Page size, threshold, arena reservation
//!   ├── error      - AllocError
//!   ├── small      - Per-class arenas (internal)
//!   ├── large      - One mapping per large request (internal)
//!   ├── heap       - Heap, the single-threaded allocation facade
//!   ├── locked     - LockedHeap, per-class locks and GlobalAlloc
//!   └── global     - Process-wide heap and exit hook
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let ptr = heap.allocate(10) as *mut u64;
//! unsafe {
//!     *ptr = 42;
//!     assert_eq!(*ptr, 42);
//!
//!     let ptr = heap.resize(ptr as *mut u8, 10_000);
//!     heap.free(ptr);
//! }
//! ```
//!
//! ## Limitations
//!
//! - **No coalescing**: freed segments only ever go back to their own class
//! - **No shrinking**: arenas keep their pages until released
//! - **No pointer validation**: freeing a foreign pointer is undefined behavior
//! - **Unix-only**: requires `libc` and `mmap`
//!
//! [`Heap`] is single-threaded; [`LockedHeap`] adds one lock per size class
//! and implements [`GlobalAlloc`](std::alloc::GlobalAlloc).

pub mod align;
mod config;
mod error;
pub mod global;
mod heap;
mod large;
mod locked;
mod os;
mod region;
mod small;

pub use align::{
  MIN_ALIGN, MIN_CLASS_SIZE, NUM_CLASSES, align_page, align_small, align_word, class_index,
  class_size,
};
pub use config::{Config, DEFAULT_ARENA_RESERVE};
pub use error::AllocError;
pub use heap::Heap;
pub use locked::LockedHeap;
pub use os::{Mmap, PageSource};
pub use small::{ArenaEvent, ArenaInfo};
