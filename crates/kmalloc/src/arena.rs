//! Arenas: pages turned into buddy-managed block pools.
//!
//! # Page Layout
//!
//! ```text
//! page                                  page + page_size / 2      page + page_size
//! ┌────────────┬───────────────┬────────┬──────────────────────────────────┐
//! │ ArenaHeader│ [Slot; N]     │ unused │ payload (one top-class block)    │
//! └────────────┴───────────────┴────────┴──────────────────────────────────┘
//! ```
//!
//! The payload is the upper half of the page and is exactly one block of the
//! top size class, so a block at payload offset `x` of size `S` is aligned to
//! `S` both relative to the payload and in absolute terms. Blocks are located
//! by their payload offset; the buddy of a block is at `offset ^ size`.
//!
//! The occupancy array holds one [`Slot`] per
//! [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE) granule of the payload.
//! Only the first slot of an allocated block is marked; every other slot,
//! including all slots of free blocks, reads as [`SlotState::Free`].
//!
//! The occupancy array is guarded by the mutex in the arena header.

use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
    slice,
};

use derive_more::IsVariant;
use spin::{Mutex, MutexGuard};

use crate::{
    config::{Config, MIN_BLOCK_SHIFT, MIN_BLOCK_SIZE},
    error::{self, Corruption},
};

/// Sentinel stored at the start of every live arena.
pub(crate) const ARENA_MAGIC: usize = 0x9a54_8eed;

#[repr(C)]
struct ArenaHeader {
    magic: usize,
    next: *mut Self,
    prev: *mut Self,
    lock: Mutex<()>,
}

/// Bytes needed at the start of a page for the header and occupancy array.
pub(crate) const fn header_size(config: Config) -> usize {
    size_of::<ArenaHeader>() + config.slot_count() * size_of::<Slot>()
}

/// Decoded state of one occupancy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum SlotState {
    /// No allocated block starts at this granule.
    Free,
    /// An allocated block of the given size starts at this granule.
    Allocated(usize),
}

/// One occupancy entry, stored as the base-two logarithm of the owning
/// block's size, or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Slot(u8);

impl Slot {
    const FREE: Self = Self(0);

    #[expect(clippy::cast_possible_truncation)]
    fn allocated(size: usize) -> Self {
        assert!(size.is_power_of_two() && size >= MIN_BLOCK_SIZE);
        Self(size.trailing_zeros() as u8)
    }

    fn state(self) -> SlotState {
        match self.0 {
            0 => SlotState::Free,
            shift => SlotState::Allocated(1 << shift),
        }
    }
}

impl From<SlotState> for Slot {
    fn from(state: SlotState) -> Self {
        match state {
            SlotState::Free => Self::FREE,
            SlotState::Allocated(size) => Self::allocated(size),
        }
    }
}

/// Handle to an arena living in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Arena {
    header: NonNull<ArenaHeader>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Initialises a fresh arena at the start of `page`.
    ///
    /// # Safety
    ///
    /// `page` must be a page-aligned region of `config.page_size()` bytes that
    /// is exclusively owned by the caller.
    pub(crate) unsafe fn init(page: NonNull<u8>, config: Config) -> Self {
        let header = page.cast::<ArenaHeader>();
        unsafe {
            header.write(ArenaHeader {
                magic: ARENA_MAGIC,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                lock: Mutex::new(()),
            });
            let slots = header.add(1).cast::<Slot>();
            ptr::write_bytes(slots.as_ptr(), 0, config.slot_count());
        }
        Self { header }
    }

    /// Resolves the arena owning `block` and checks that `block` lies on a
    /// granule boundary inside its payload.
    ///
    /// A missing sentinel or an out-of-payload address is heap corruption and
    /// does not return.
    ///
    /// # Safety
    ///
    /// `block` must point into a page that was handed out by the page source
    /// of the allocator using `config`.
    #[track_caller]
    pub(crate) unsafe fn from_block(block: NonNull<u8>, config: Config) -> Self {
        let page_mask = config.page_size() - 1;
        let Some(page_addr) = NonZeroUsize::new(block.addr().get() & !page_mask) else {
            error::heap_corruption(Corruption::OutsidePayload {
                addr: block.addr().get(),
            });
        };
        let page = block.with_addr(page_addr);
        let header = page.cast::<ArenaHeader>();

        let magic = unsafe { (*header.as_ptr()).magic };
        if magic != ARENA_MAGIC {
            error::heap_corruption(Corruption::BadMagic {
                page: page.addr().get(),
                found: magic,
            });
        }

        let page_offset = block.addr().get() & page_mask;
        if page_offset < config.payload_offset() {
            error::heap_corruption(Corruption::OutsidePayload {
                addr: block.addr().get(),
            });
        }
        if !page_offset.is_multiple_of(MIN_BLOCK_SIZE) {
            error::heap_corruption(Corruption::Misaligned {
                addr: block.addr().get(),
            });
        }

        Self { header }
    }

    pub(crate) fn page(self) -> NonNull<u8> {
        self.header.cast()
    }

    fn payload(self, config: Config) -> NonNull<u8> {
        unsafe { self.page().add(config.payload_offset()) }
    }

    /// Offset of `block` from the start of the payload.
    pub(crate) fn offset_of(self, block: NonNull<u8>, config: Config) -> usize {
        block.addr().get() - self.payload(config).addr().get()
    }

    /// Pointer to the block at payload offset `offset`.
    pub(crate) fn block_at(self, offset: usize, config: Config) -> NonNull<u8> {
        debug_assert!(offset < config.max_block_size());
        unsafe { self.payload(config).add(offset) }
    }

    /// Clears the sentinel so stale pointers into a returned page are caught.
    ///
    /// # Safety
    ///
    /// Nobody may use the arena afterwards.
    pub(crate) unsafe fn retire(self) {
        unsafe {
            (*self.header.as_ptr()).magic = 0;
        }
    }

    /// Locks the occupancy array.
    pub(crate) fn lock<'a>(&'a self, config: Config) -> Occupancy<'a> {
        let header = unsafe { &*self.header.as_ptr() };
        let guard = header.lock.lock();
        let slots = unsafe {
            let base = self.header.add(1).cast::<Slot>();
            slice::from_raw_parts_mut(base.as_ptr(), config.slot_count())
        };
        Occupancy {
            slots,
            _guard: guard,
        }
    }
}

/// Locked view of an arena's occupancy array.
///
/// All offsets are payload offsets in bytes and must be multiples of
/// [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE).
pub(crate) struct Occupancy<'a> {
    slots: &'a mut [Slot],
    _guard: MutexGuard<'a, ()>,
}

impl Occupancy<'_> {
    fn index(offset: usize) -> usize {
        debug_assert!(offset.is_multiple_of(MIN_BLOCK_SIZE));
        offset >> MIN_BLOCK_SHIFT
    }

    pub(crate) fn state(&self, offset: usize) -> SlotState {
        self.slots[Self::index(offset)].state()
    }

    pub(crate) fn set(&mut self, offset: usize, state: SlotState) {
        self.slots[Self::index(offset)] = state.into();
    }

    /// Returns `true` if no allocated block starts in `offset..offset + size`.
    pub(crate) fn is_range_free(&self, offset: usize, size: usize) -> bool {
        let start = Self::index(offset);
        let end = Self::index(offset + size);
        self.slots[start..end]
            .iter()
            .all(|slot| slot.state().is_free())
    }
}

/// Intrusive list of live arenas.
#[derive(Debug)]
pub(crate) struct ArenaList {
    head: *mut ArenaHeader,
    len: usize,
}

unsafe impl Send for ArenaList {}

impl ArenaList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Links `arena` at the head of the list.
    ///
    /// # Safety
    ///
    /// `arena` must be live and not already linked.
    pub(crate) unsafe fn push(&mut self, arena: Arena) {
        let node = arena.header.as_ptr();
        unsafe {
            (*node).prev = ptr::null_mut();
            (*node).next = self.head;
            if let Some(head) = self.head.as_mut() {
                head.prev = node;
            }
        }
        self.head = node;
        self.len += 1;
    }

    /// Unlinks `arena`.
    ///
    /// # Safety
    ///
    /// `arena` must be linked into this list.
    pub(crate) unsafe fn remove(&mut self, arena: Arena) {
        let node = arena.header.as_ptr();
        unsafe {
            let next = (*node).next;
            let prev = (*node).prev;
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
            if let Some(prev) = prev.as_mut() {
                prev.next = next;
            } else {
                assert!(ptr::eq(self.head, node), "arena is not in the list");
                self.head = next;
            }
            (*node).next = ptr::null_mut();
            (*node).prev = ptr::null_mut();
        }
        self.len -= 1;
    }

    /// Iterates over the live arenas, most recently created first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Arena> + '_ {
        let mut next = self.head;
        core::iter::from_fn(move || {
            let header = NonNull::new(next)?;
            next = unsafe { header.as_ref().next };
            Some(Arena { header })
        })
    }
}
