//! Size-class front end over per-page buddy arenas.
//!
//! # Algorithm
//!
//! - **Allocation**: the request is rounded up to its size class. The first
//!   non-empty free list at or above that class supplies a *carrier* block;
//!   if every list is empty a new page becomes an arena whose payload is one
//!   top-class carrier. The carrier is then split down: at each step its
//!   upper half goes onto the next-smaller free list, until the carrier is
//!   the requested class.
//! - **Release**: the block's size comes from its arena's occupancy array.
//!   While its buddy (`offset ^ size`) is a whole free block the two are
//!   merged and the merged block moves up one class. A block that reaches the
//!   top class is the whole payload, so the page goes back to the
//!   [`PageSource`].
//!
//! # Locking
//!
//! Each size class has a lock around its free list, each arena has a lock
//! around its occupancy array, and the list of live arenas has one more. The
//! order is always arena, then size class or arena list. Popping a free block
//! takes only the class lock, so a block can be off every free list while its
//! occupancy slots still read as free. A concurrent release that picks it as
//! a merge partner fails to unlink it and stops merging there, which is the
//! right outcome because the block is about to be allocated.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{
    arena::{Arena, ArenaList, SlotState},
    config::Config,
    error::{self, AllocError, Corruption, ExhaustedSnafu, InvalidSizeSnafu, OverflowSnafu},
    page_source::PageSource,
    size_class::SizeClassTable,
};

/// Byte pattern written over released blocks when poisoning is enabled.
pub const POISON_BYTE: u8 = 0xcc;

/// Hybrid size-class and buddy allocator for requests up to half a page.
///
/// All methods take `&self`; the allocator is `Sync` whenever its page source
/// is.
///
/// # Examples
///
/// ```
/// # use core::{alloc::Layout, ptr::NonNull};
/// use kmalloc::{BuddyAllocator, Config, PageSource};
///
/// struct HostPages;
///
/// unsafe impl PageSource for HostPages {
///     fn acquire_page(&self) -> Option<NonNull<u8>> {
///         let layout = Layout::from_size_align(4096, 4096).unwrap();
///         NonNull::new(unsafe { std::alloc::alloc(layout) })
///     }
///
///     unsafe fn release_page(&self, page: NonNull<u8>) {
///         let layout = Layout::from_size_align(4096, 4096).unwrap();
///         unsafe { std::alloc::dealloc(page.as_ptr(), layout) }
///     }
/// }
///
/// let allocator = BuddyAllocator::new(HostPages, Config::default());
/// let block = allocator.allocate(100).unwrap();
/// assert_eq!(unsafe { allocator.current_size(block) }, 128);
/// unsafe {
///     allocator.release(Some(block));
/// }
/// assert_eq!(allocator.arena_count(), 0);
/// ```
#[derive(Debug)]
pub struct BuddyAllocator<P> {
    config: Config,
    classes: SizeClassTable,
    arenas: Mutex<ArenaList>,
    source: P,
}

impl<P> BuddyAllocator<P>
where
    P: PageSource,
{
    /// Creates an allocator drawing pages from `source`.
    ///
    /// No page is acquired until the first allocation.
    pub fn new(source: P, config: Config) -> Self {
        Self {
            config,
            classes: SizeClassTable::new(config),
            arenas: Mutex::new(ArenaList::new()),
            source,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn page_source(&self) -> &P {
        &self.source
    }

    /// Number of pages currently held as arenas.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.arenas.lock().len()
    }

    pub(crate) fn classes(&self) -> &SizeClassTable {
        &self.classes
    }

    pub(crate) fn arenas(&self) -> &Mutex<ArenaList> {
        &self.arenas
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// Returns `None` if `size` is zero, larger than half a page, or the page
    /// source is exhausted. See [`try_allocate`](Self::try_allocate).
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok()
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The block is the smallest power of two not below `size` and not below
    /// [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE), and is aligned to
    /// its own size. Failure leaves the allocator unchanged.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let config = self.config;
        let max = config.max_block_size();
        let target = self.classes.index_for_size(size).filter(|_| size > 0);
        let Some(target) = target else {
            log::warn!("rejected allocation of {size} bytes (max {max})");
            return InvalidSizeSnafu { size, max }.fail();
        };

        let (arena, mut index, block) = if let Some((index, block)) = self.pop_free_block(target) {
            let arena = unsafe { Arena::from_block(block, config) };
            (arena, index, block)
        } else {
            let arena = self.create_arena()?;
            (arena, self.classes.top_index(), arena.block_at(0, config))
        };
        let offset = arena.offset_of(block, config);

        let mut occupancy = arena.lock(config);
        while index > target {
            index -= 1;
            let class = self.classes.class(index);
            let upper_half = arena.block_at(offset + class.block_size(), config);
            unsafe {
                class.lock().push(upper_half);
            }
        }
        let block_size = self.classes.class(target).block_size();
        occupancy.set(offset, SlotState::Allocated(block_size));
        drop(occupancy);

        log::trace!("allocate({size}) -> {block:p} [{block_size}]");
        Ok(block)
    }

    /// Allocates zeroed memory for `count` elements of `element_size` bytes.
    ///
    /// Returns `None` if the product overflows or the allocation fails.
    #[must_use]
    pub fn zero_allocate(&self, count: usize, element_size: usize) -> Option<NonNull<u8>> {
        self.try_zero_allocate(count, element_size).ok()
    }

    /// Allocates zeroed memory for `count` elements of `element_size` bytes.
    pub fn try_zero_allocate(
        &self,
        count: usize,
        element_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(size) = count.checked_mul(element_size) else {
            return OverflowSnafu {
                count,
                element_size,
            }
            .fail();
        };
        let block = self.try_allocate(size)?;
        unsafe {
            block.write_bytes(0, size);
        }
        Ok(block)
    }

    /// Returns the current size of an allocated block.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator and not released.
    #[track_caller]
    pub unsafe fn current_size(&self, block: NonNull<u8>) -> usize {
        let config = self.config;
        let arena = unsafe { Arena::from_block(block, config) };
        let offset = arena.offset_of(block, config);
        match arena.lock(config).state(offset) {
            SlotState::Allocated(size) => size,
            SlotState::Free => error::heap_corruption(Corruption::NotAllocated {
                addr: block.addr().get(),
            }),
        }
    }

    /// Moves `block` to a new block of at least `new_size` bytes.
    ///
    /// - `new_size == 0` releases `block` and returns `None`.
    /// - `block == None` behaves like [`allocate`](Self::allocate).
    /// - Otherwise the first `min(current size, new_size)` bytes are copied
    ///   into a fresh block and `block` is released. If the fresh allocation
    ///   fails `None` is returned and `block` stays valid.
    ///
    /// # Safety
    ///
    /// `block`, if present, must have been returned by this allocator and not
    /// released.
    #[must_use]
    pub unsafe fn reallocate(
        &self,
        block: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            unsafe {
                self.release(block);
            }
            return None;
        }

        let new_block = self.allocate(new_size)?;
        if let Some(old_block) = block {
            unsafe {
                let old_size = self.current_size(old_block);
                ptr::copy_nonoverlapping(
                    old_block.as_ptr(),
                    new_block.as_ptr(),
                    old_size.min(new_size),
                );
                self.release(Some(old_block));
            }
        }
        Some(new_block)
    }

    /// Releases a block, merging it with its buddies as far as possible.
    ///
    /// `None` is ignored. An arena whose payload becomes one free block is
    /// returned to the page source.
    ///
    /// # Safety
    ///
    /// `block`, if present, must have been returned by this allocator and not
    /// released since. The memory must not be used afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the block's arena fails its sentinel check or the block is
    /// not currently allocated.
    #[track_caller]
    pub unsafe fn release(&self, block: Option<NonNull<u8>>) {
        let Some(block) = block else {
            return;
        };
        let config = self.config;
        let arena = unsafe { Arena::from_block(block, config) };
        let mut offset = arena.offset_of(block, config);

        let mut occupancy = arena.lock(config);
        let SlotState::Allocated(mut size) = occupancy.state(offset) else {
            error::heap_corruption(Corruption::NotAllocated {
                addr: block.addr().get(),
            });
        };
        if !offset.is_multiple_of(size) {
            error::heap_corruption(Corruption::Misaligned {
                addr: block.addr().get(),
            });
        }
        log::trace!("release({block:p}) [{size}]");

        #[cfg(any(debug_assertions, feature = "poison"))]
        unsafe {
            block.write_bytes(POISON_BYTE, size);
        }
        occupancy.set(offset, SlotState::Free);

        let mut index = SizeClassTable::index_of_block_size(size);
        loop {
            if index == self.classes.top_index() {
                drop(occupancy);
                unsafe {
                    self.destroy_arena(arena);
                }
                return;
            }

            let buddy_offset = offset ^ size;
            let mut free_list = self.classes.class(index).lock();
            let merged = occupancy.is_range_free(buddy_offset, size)
                && free_list.remove(arena.block_at(buddy_offset, config));
            if !merged {
                unsafe {
                    free_list.push(arena.block_at(offset, config));
                }
                return;
            }
            drop(free_list);

            offset = offset.min(buddy_offset);
            size *= 2;
            index += 1;
        }
    }

    fn pop_free_block(&self, target: usize) -> Option<(usize, NonNull<u8>)> {
        (target..self.classes.len())
            .find_map(|index| Some((index, self.classes.class(index).lock().pop()?)))
    }

    fn create_arena(&self) -> Result<Arena, AllocError> {
        let Some(page) = self.source.acquire_page() else {
            log::warn!("page source exhausted");
            return ExhaustedSnafu.fail();
        };
        assert!(
            page.addr().get().is_multiple_of(self.config.page_size()),
            "page source returned unaligned page {page:p}"
        );

        let arena = unsafe { Arena::init(page, self.config) };
        unsafe {
            self.arenas.lock().push(arena);
        }
        log::debug!("new arena at {page:p}");
        Ok(arena)
    }

    /// Unlinks an arena whose payload is entirely free and returns its page.
    ///
    /// # Safety
    ///
    /// No block of the arena may be allocated or on a free list, and the
    /// arena lock must not be held.
    unsafe fn destroy_arena(&self, arena: Arena) {
        unsafe {
            self.arenas.lock().remove(arena);
            arena.retire();
            self.source.release_page(arena.page());
        }
        log::debug!("released arena at {:p}", arena.page());
    }
}

unsafe impl<P> GlobalAlloc for BuddyAllocator<P>
where
    P: PageSource,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are aligned to their own size.
        let size = layout.size().max(layout.align());
        self.allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.release(NonNull::new(ptr)) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let size = new_size.max(layout.align());
        unsafe { self.reallocate(NonNull::new(ptr), size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
