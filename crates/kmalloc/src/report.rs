//! Read-only introspection of live arenas and free lists.
//!
//! Nothing here takes an arena lock or changes a free list. Output produced
//! while other threads allocate or release is only indicative.

use core::{fmt, ptr::NonNull};

use crate::{
    buddy::BuddyAllocator, config::Config, page_source::PageSource, size_class::SizeClass,
};

/// A block sitting on one of the free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreeBlockInfo {
    /// Page of the arena the block belongs to.
    pub page: NonNull<u8>,
    /// Offset of the block from the start of the arena payload.
    pub offset: usize,
    /// Size class of the block.
    pub size: usize,
}

impl FreeBlockInfo {
    fn new(block: NonNull<u8>, size: usize, config: Config) -> Self {
        let page_mask = config.page_size() - 1;
        let page_offset = block.addr().get() & page_mask;
        Self {
            page: unsafe { block.sub(page_offset) },
            offset: page_offset - config.payload_offset(),
            size,
        }
    }
}

impl<P> BuddyAllocator<P>
where
    P: PageSource,
{
    /// Calls `f` for every block on every free list, smallest class first,
    /// each list from head to tail.
    ///
    /// The class lock is held while `f` runs, so `f` must not allocate from
    /// or release to this allocator.
    pub fn for_each_free_block<F>(&self, mut f: F)
    where
        F: FnMut(FreeBlockInfo),
    {
        for class in self.classes().iter() {
            let free_list = class.lock();
            for block in free_list.iter() {
                f(FreeBlockInfo::new(block, class.block_size(), *self.config()));
            }
        }
    }

    /// Returns a printable dump of the live arenas and their free blocks.
    ///
    /// # Examples
    ///
    /// ```text
    /// arenas: 1
    /// arena 0 at 0x5581a000:
    ///      16: 16
    ///      32: 32
    ///      64: 64
    ///     128: 128
    ///     256: 256
    ///     512: 512
    ///    1024: 1024
    ///    2048:
    /// ```
    #[must_use]
    pub fn report(&self) -> HeapReport<'_, P> {
        HeapReport { allocator: self }
    }

    /// Smallest offset above `after` of a free block of `class` in `page`.
    fn next_free_offset(
        &self,
        class: &SizeClass,
        page: NonNull<u8>,
        after: Option<usize>,
    ) -> Option<usize> {
        class
            .lock()
            .iter()
            .map(|block| FreeBlockInfo::new(block, class.block_size(), *self.config()))
            .filter(|info| info.page == page && after.is_none_or(|after| info.offset > after))
            .map(|info| info.offset)
            .min()
    }
}

/// Display adapter returned by [`BuddyAllocator::report`].
///
/// Offsets are printed in ascending order. No lock is held while writing to
/// the formatter, so the formatter's sink may itself allocate from the
/// reported allocator.
pub struct HeapReport<'a, P> {
    allocator: &'a BuddyAllocator<P>,
}

impl<P> fmt::Display for HeapReport<'_, P>
where
    P: PageSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocator = self.allocator;
        writeln!(f, "arenas: {}", allocator.arena_count())?;

        for n in 0.. {
            let Some(arena) = allocator.arenas().lock().iter().nth(n) else {
                break;
            };
            let page = arena.page();
            writeln!(f, "arena {n} at {page:p}:")?;
            for class in allocator.classes().iter() {
                write!(f, "{:>8}:", class.block_size())?;
                let mut last = None;
                while let Some(offset) = allocator.next_free_offset(class, page, last) {
                    write!(f, " {offset}")?;
                    last = Some(offset);
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl<P> fmt::Debug for HeapReport<'_, P>
where
    P: PageSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
