//! Allocator configuration.
//!
//! The page size drives everything else: the top size class is half a page,
//! the arena payload occupies the upper half of each page, and the occupancy
//! array has one slot per [`MIN_BLOCK_SIZE`] granule of that payload.

use snafu::ensure;

use crate::{
    arena,
    error::{
        ConfigError, HeaderTooLargeSnafu, PageSizeNotPowerOfTwoSnafu, PageTooSmallSnafu,
        TooManySizeClassesSnafu,
    },
};

/// Page size used by [`Config::default`].
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest block handed out by the allocator.
///
/// Also the granularity of the occupancy array.
pub const MIN_BLOCK_SIZE: usize = 16;
pub const MIN_BLOCK_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();
const _: () = assert!(MIN_BLOCK_SIZE == 1 << MIN_BLOCK_SHIFT);

/// Capacity of the size-class table.
///
/// Sixteen classes cover pages up to 1 MiB.
pub const MAX_SIZE_CLASSES: usize = 16;

/// Validated allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    /// Creates a configuration for pages of `page_size` bytes.
    ///
    /// The page size must be a power of two, large enough to hold at least
    /// two minimum-size blocks in its payload half, small enough that the
    /// size-class table fits in [`MAX_SIZE_CLASSES`], and large enough that
    /// the arena header fits in the lower half of the page.
    ///
    /// # Examples
    ///
    /// ```
    /// use kmalloc::Config;
    ///
    /// let config = Config::new(4096).unwrap();
    /// assert_eq!(config.max_block_size(), 2048);
    /// assert_eq!(config.size_class_count(), 8);
    ///
    /// assert!(Config::new(3000).is_err());
    /// ```
    pub fn new(page_size: usize) -> Result<Self, ConfigError> {
        ensure!(
            page_size.is_power_of_two(),
            PageSizeNotPowerOfTwoSnafu { page_size }
        );
        ensure!(
            page_size >= 4 * MIN_BLOCK_SIZE,
            PageTooSmallSnafu {
                page_size,
                min: 4 * MIN_BLOCK_SIZE,
            }
        );

        let config = Self { page_size };
        let classes = config.size_class_count();
        ensure!(
            classes <= MAX_SIZE_CLASSES,
            TooManySizeClassesSnafu {
                page_size,
                classes,
                capacity: MAX_SIZE_CLASSES,
            }
        );

        let header_size = arena::header_size(config);
        ensure!(
            header_size <= config.payload_offset(),
            HeaderTooLargeSnafu {
                page_size,
                header_size,
            }
        );

        Ok(config)
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest request the allocator accepts, and the top size class.
    #[must_use]
    pub const fn max_block_size(&self) -> usize {
        self.page_size / 2
    }

    /// Offset of the arena payload from the start of its page.
    ///
    /// The payload is the upper half of the page, so every block is aligned
    /// to its own size in absolute address terms as well.
    #[must_use]
    pub const fn payload_offset(&self) -> usize {
        self.page_size / 2
    }

    /// Number of occupancy slots per arena.
    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.max_block_size() >> MIN_BLOCK_SHIFT
    }

    /// Number of size classes between [`MIN_BLOCK_SIZE`] and the top class.
    #[must_use]
    pub const fn size_class_count(&self) -> usize {
        (self.max_block_size().trailing_zeros() - MIN_BLOCK_SHIFT + 1) as usize
    }
}
