//! The allocator driven through its public API from several threads, backed
//! by a fixed pool of pages the way a kernel page allocator would hand them
//! out.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::{sync::Mutex, thread};

use kmalloc::{AllocError, BuddyAllocator, Config, PageSource};

struct PagePool {
    base: NonNull<u8>,
    layout: Layout,
    page_size: usize,
    free: Mutex<Vec<usize>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    fn new(config: Config, pages: usize) -> Self {
        let page_size = config.page_size();
        let layout = Layout::from_size_align(page_size * pages, page_size).unwrap();
        let base = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
        Self {
            base,
            layout,
            page_size,
            free: Mutex::new((0..pages).rev().collect()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    fn free_pages(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

unsafe impl PageSource for PagePool {
    fn acquire_page(&self) -> Option<NonNull<u8>> {
        let index = self.free.lock().unwrap().pop()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { self.base.add(index * self.page_size) })
    }

    unsafe fn release_page(&self, page: NonNull<u8>) {
        let index = (page.addr().get() - self.base.addr().get()) / self.page_size;
        let mut free = self.free.lock().unwrap();
        assert!(!free.contains(&index), "page {index} released twice");
        free.push(index);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Small deterministic generator so every thread gets its own size sequence.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn test_threads_share_allocator() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2000;
    const LIVE: usize = 16;

    let config = Config::default();
    let allocator = BuddyAllocator::new(PagePool::new(config, 256), config);

    thread::scope(|scope| {
        for tid in 0..THREADS {
            let allocator = &allocator;
            scope.spawn(move || {
                let mut rng = Lcg(tid as u64 + 1);
                let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                for round in 0..ROUNDS {
                    if live.len() == LIVE || (!live.is_empty() && rng.next() % 3 == 0) {
                        let index = (rng.next() as usize) % live.len();
                        let (block, size, tag) = live.swap_remove(index);
                        unsafe {
                            let bytes = core::slice::from_raw_parts(block.as_ptr(), size);
                            assert!(bytes.iter().all(|&b| b == tag), "block was clobbered");
                            allocator.release(Some(block));
                        }
                        continue;
                    }

                    let size = 1 + (rng.next() as usize) % 2048;
                    let block = allocator.allocate(size).expect("page pool is large enough");
                    let tag = (tid * 31 + round) as u8;
                    unsafe {
                        assert!(allocator.current_size(block) >= size);
                        block.write_bytes(tag, size);
                    }
                    live.push((block, size, tag));
                }
                for (block, _, _) in live {
                    unsafe {
                        allocator.release(Some(block));
                    }
                }
            });
        }
    });

    let pool = allocator.page_source();
    assert_eq!(allocator.arena_count(), 0);
    assert_eq!(pool.free_pages(), 256);
    assert_eq!(
        pool.acquired.load(Ordering::Relaxed),
        pool.released.load(Ordering::Relaxed)
    );
    assert_eq!(allocator.report().to_string(), "arenas: 0\n");
}

#[test]
fn test_threads_reallocate() {
    let config = Config::default();
    let allocator = BuddyAllocator::new(PagePool::new(config, 64), config);

    thread::scope(|scope| {
        for tid in 0..4_u8 {
            let allocator = &allocator;
            scope.spawn(move || unsafe {
                let mut block = allocator.allocate(1).unwrap();
                block.write(tid);
                for size in (16..=2048).step_by(48).chain((16..=2048).rev().step_by(80)) {
                    block = allocator.reallocate(Some(block), size).unwrap();
                    assert_eq!(block.read(), tid);
                }
                assert!(allocator.reallocate(Some(block), 0).is_none());
            });
        }
    });

    assert_eq!(allocator.arena_count(), 0);
    assert_eq!(allocator.page_source().free_pages(), 64);
}

#[test]
fn test_pool_exhaustion_is_recoverable() {
    let config = Config::default();
    let allocator = BuddyAllocator::new(PagePool::new(config, 2), config);

    let a = allocator.allocate(2048).unwrap();
    let b = allocator.allocate(1500).unwrap();
    assert!(matches!(
        allocator.try_allocate(2000),
        Err(AllocError::Exhausted { .. })
    ));
    assert!(allocator.zero_allocate(16, 16).is_none());
    assert_eq!(allocator.arena_count(), 2);

    unsafe {
        allocator.release(Some(a));
    }
    let c = allocator.zero_allocate(16, 16).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(c.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));

    unsafe {
        allocator.release(Some(b));
        allocator.release(Some(c));
    }
    assert_eq!(allocator.page_source().free_pages(), 2);
}

#[test]
fn test_config_errors_display() {
    let err = Config::new(1000).unwrap_err();
    assert_eq!(err.to_string(), "page size 1000 is not a power of two");

    let config = Config::default();
    let allocator = BuddyAllocator::new(PagePool::new(config, 1), config);
    let err = allocator.try_allocate(0).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid allocation size 0 (must be in 1..=2048)"
    );
    let err = allocator.try_zero_allocate(usize::MAX, 2).unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("allocation size overflow: {} * 2", usize::MAX)
    );
}
