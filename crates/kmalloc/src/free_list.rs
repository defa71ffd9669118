//! Intrusive free list of blocks.
//!
//! Free blocks are at least [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE)
//! bytes, which is enough to store a [`FreeBlock`] header at the start of the
//! block itself. The list is a singly linked stack: [`push`](FreeList::push)
//! and [`pop`](FreeList::pop) both work at the head, so the most recently
//! freed or split block is handed out first.
//!
//! ```text
//! head ──▶ ┌──────────────┐     ┌──────────────┐
//!          │ next ────────┼───▶ │ next: null   │
//!          │ (free bytes) │     │ (free bytes) │
//!          └──────────────┘     └──────────────┘
//! ```

use core::ptr::{self, NonNull};

/// Header written at the start of every free block.
#[repr(C)]
struct FreeBlock {
    next: *mut Self,
}
const _: () = assert!(size_of::<FreeBlock>() <= crate::config::MIN_BLOCK_SIZE);

/// A stack of free blocks of one size class.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: *mut FreeBlock,
}

// The list only links blocks that the allocator owns; moving the head pointer
// between threads is fine as long as access is serialised by the class lock.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: ptr::null_mut() }
    }

    /// Pushes a block onto the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must point to a free block owned by the allocator that is at
    /// least [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE) bytes long,
    /// aligned to it, and not already linked into any free list.
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeBlock>();
        assert!(node.is_aligned(), "free block must be aligned");
        unsafe {
            node.write(FreeBlock { next: self.head });
        }
        self.head = node.as_ptr();
    }

    /// Pops the most recently pushed block.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = NonNull::new(self.head)?;
        unsafe {
            self.head = node.as_ref().next;
        }
        Some(node.cast())
    }

    /// Unlinks `block` if it is in the list.
    ///
    /// Returns `false` if the block was not found, which happens when another
    /// thread popped it between the caller's occupancy check and this call.
    pub(crate) fn remove(&mut self, block: NonNull<u8>) -> bool {
        let target = block.cast::<FreeBlock>().as_ptr();
        let mut link: *mut *mut FreeBlock = &raw mut self.head;
        unsafe {
            while !(*link).is_null() {
                if ptr::eq(*link, target) {
                    *link = (*target).next;
                    return true;
                }
                link = &raw mut (**link).next;
            }
        }
        false
    }

    /// Iterates over the blocks from head to tail.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _list: self,
        }
    }
}

pub(crate) struct Iter<'a> {
    next: *mut FreeBlock,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.next)?;
        unsafe {
            self.next = node.as_ref().next;
        }
        Some(node.cast())
    }
}
