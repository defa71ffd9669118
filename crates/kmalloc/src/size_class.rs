//! The size-class table.
//!
//! Block sizes are the powers of two from
//! [`MIN_BLOCK_SIZE`](crate::config::MIN_BLOCK_SIZE) up to half a page, in
//! ascending order. Each class owns a [`FreeList`] behind its own lock; the
//! lock guards nothing else.

use arrayvec::ArrayVec;
use spin::{Mutex, MutexGuard};

use crate::{
    config::{Config, MAX_SIZE_CLASSES, MIN_BLOCK_SHIFT, MIN_BLOCK_SIZE},
    free_list::FreeList,
};

/// One entry of the size-class table.
#[derive(Debug)]
pub(crate) struct SizeClass {
    block_size: usize,
    free_list: Mutex<FreeList>,
}

impl SizeClass {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free_list: Mutex::new(FreeList::new()),
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FreeList> {
        self.free_list.lock()
    }
}

/// Ascending table of size classes.
#[derive(Debug)]
pub(crate) struct SizeClassTable {
    classes: ArrayVec<SizeClass, MAX_SIZE_CLASSES>,
}

impl SizeClassTable {
    /// Builds the table for `config`.
    ///
    /// [`Config::new`] already rejects page sizes that need more classes than
    /// the table can hold, so this only asserts it.
    pub(crate) fn new(config: Config) -> Self {
        let mut classes = ArrayVec::new();
        let mut block_size = MIN_BLOCK_SIZE;
        while block_size <= config.max_block_size() {
            assert!(!classes.is_full(), "size-class table overflow");
            classes.push(SizeClass::new(block_size));
            block_size *= 2;
        }
        assert_eq!(classes.len(), config.size_class_count());
        Self { classes }
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }

    pub(crate) fn top_index(&self) -> usize {
        self.classes.len() - 1
    }

    pub(crate) fn class(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }

    /// Index of the smallest class whose blocks hold `size` bytes.
    ///
    /// Returns `None` if `size` exceeds the top class.
    pub(crate) fn index_for_size(&self, size: usize) -> Option<usize> {
        let block_size = size.max(MIN_BLOCK_SIZE).checked_next_power_of_two()?;
        let index = Self::index_of_block_size(block_size);
        (index < self.classes.len()).then_some(index)
    }

    /// Index of the class whose block size is exactly `block_size`.
    pub(crate) fn index_of_block_size(block_size: usize) -> usize {
        debug_assert!(block_size.is_power_of_two() && block_size >= MIN_BLOCK_SIZE);
        (block_size.trailing_zeros() - MIN_BLOCK_SHIFT) as usize
    }
}
