//! Host-backed page source for unit tests.

use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::{collections::BTreeSet, sync::Mutex};

use crate::{buddy::BuddyAllocator, config::Config, page_source::PageSource};

/// Hands out pages from the host allocator and records every transfer.
pub(crate) struct HostPages {
    layout: Layout,
    limit: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    outstanding: Mutex<BTreeSet<usize>>,
}

impl HostPages {
    pub(crate) fn new(config: Config) -> Self {
        Self::with_limit(config, usize::MAX)
    }

    pub(crate) fn with_limit(config: Config, limit: usize) -> Self {
        Self {
            layout: Layout::from_size_align(config.page_size(), config.page_size()).unwrap(),
            limit,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            outstanding: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

unsafe impl PageSource for HostPages {
    fn acquire_page(&self) -> Option<NonNull<u8>> {
        let mut outstanding = self.outstanding.lock().unwrap();
        if outstanding.len() >= self.limit {
            return None;
        }
        let page = NonNull::new(unsafe { std::alloc::alloc(self.layout) })?;
        unsafe {
            page.write_bytes(0x11, self.layout.size());
        }
        outstanding.insert(page.as_ptr().expose_provenance());
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    unsafe fn release_page(&self, page: NonNull<u8>) {
        let removed = self.outstanding.lock().unwrap().remove(&page.addr().get());
        assert!(removed, "released a page that is not outstanding: {page:p}");
        self.released.fetch_add(1, Ordering::Relaxed);
        unsafe {
            std::alloc::dealloc(page.as_ptr(), self.layout);
        }
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        let outstanding = self.outstanding.get_mut().unwrap();
        for &addr in outstanding.iter() {
            unsafe {
                std::alloc::dealloc(std::ptr::with_exposed_provenance_mut(addr), self.layout);
            }
        }
    }
}

pub(crate) fn with_test_allocator<F>(config: Config, test_fn: F)
where
    F: FnOnce(&BuddyAllocator<HostPages>),
{
    let allocator = BuddyAllocator::new(HostPages::new(config), config);
    test_fn(&allocator);
}

/// Collects `(offset, size)` of every free block, sorted.
pub(crate) fn free_blocks<P>(allocator: &BuddyAllocator<P>) -> Vec<(usize, usize)>
where
    P: PageSource,
{
    let mut blocks = Vec::new();
    allocator.for_each_free_block(|info| blocks.push((info.offset, info.size)));
    blocks.sort_unstable();
    blocks
}
