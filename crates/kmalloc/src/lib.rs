//! Kernel heap allocator combining size classes with buddy coalescing.
//!
//! This crate provides the small-object heap of a kernel that has no swap and
//! gets its memory one page at a time. It is `no_std` and takes pages from a
//! caller-supplied [`PageSource`].
//!
//! # Design
//!
//! Requests of up to half a page are rounded up to a power of two between
//! 16 bytes and half a page. Each of these *size classes* keeps its own free
//! list behind its own lock, so most allocations are a single pop.
//!
//! When every suitable list is empty a new page becomes an *arena*. Its
//! payload starts out as one block of the largest class and is split in half
//! repeatedly until the request fits, leaving one free half on each smaller
//! list on the way down.
//!
//! Releasing a block merges it with its *buddy* (the neighbouring block of
//! the same size it was split from) for as long as the buddy is free. When a
//! merge rebuilds the whole payload the page is handed back to the page
//! source, so an idle heap holds no pages.
//!
//! See [`buddy`] for the algorithm and locking rules and [`arena`] for the
//! page layout.
//!
//! # Usage
//!
//! ```rust
//! use core::{alloc::Layout, ptr::NonNull};
//!
//! use kmalloc::{BuddyAllocator, Config, PageSource};
//!
//! struct HostPages;
//!
//! unsafe impl PageSource for HostPages {
//!     fn acquire_page(&self) -> Option<NonNull<u8>> {
//!         let layout = Layout::from_size_align(4096, 4096).unwrap();
//!         NonNull::new(unsafe { std::alloc::alloc(layout) })
//!     }
//!
//!     unsafe fn release_page(&self, page: NonNull<u8>) {
//!         let layout = Layout::from_size_align(4096, 4096).unwrap();
//!         unsafe { std::alloc::dealloc(page.as_ptr(), layout) }
//!     }
//! }
//!
//! let heap = BuddyAllocator::new(HostPages, Config::default());
//!
//! let a = heap.allocate(100).unwrap(); // 128-byte block
//! let b = heap.zero_allocate(4, 8).unwrap(); // 32 zeroed bytes
//! assert!(heap.allocate(4096).is_none()); // more than half a page
//!
//! let a = unsafe { heap.reallocate(Some(a), 300) }.unwrap();
//! assert_eq!(unsafe { heap.current_size(a) }, 512);
//!
//! unsafe {
//!     heap.release(Some(a));
//!     heap.release(Some(b));
//! }
//! assert_eq!(heap.arena_count(), 0);
//! ```
//!
//! # Integration with Global Allocator
//!
//! [`BuddyAllocator`] implements [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! Layouts whose size or alignment exceeds half a page are refused, so a
//! kernel typically puts it behind a wrapper that sends large requests to the
//! page allocator:
//!
//! ```rust,ignore
//! unsafe impl GlobalAlloc for KernelAllocator {
//!     unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
//!         if layout.size().max(layout.align()) > self.small.config().max_block_size() {
//!             return self.pages.alloc(layout);
//!         }
//!         unsafe { self.small.alloc(layout) }
//!     }
//!     // ...
//! }
//! ```
//!
//! # Features
//!
//! - `poison`: fill released blocks with [`POISON_BYTE`] even in release
//!   builds. Debug builds always do.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod arena;
pub mod buddy;
pub mod config;
pub mod error;
mod free_list;
pub mod page_source;
pub mod report;
mod size_class;

#[cfg(test)]
mod testing;

pub use self::{
    arena::SlotState,
    buddy::{BuddyAllocator, POISON_BYTE},
    config::{Config, DEFAULT_PAGE_SIZE, MIN_BLOCK_SIZE},
    error::{AllocError, ConfigError},
    page_source::PageSource,
    report::{FreeBlockInfo, HeapReport},
};
