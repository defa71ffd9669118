//! Error types and the fatal-error reporter.
//!
//! Recoverable failures (bad request size, page source exhaustion, size
//! overflow) are values. Heap corruption is not: once an arena header or an
//! occupancy slot is found to be inconsistent nothing the allocator decides
//! afterwards can be trusted, so it goes through [`heap_corruption`], which
//! never returns.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

/// Source location where an error was created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Reasons an allocation request fails.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("invalid allocation size {size} (must be in 1..={max})"))]
    InvalidSize {
        size: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page source exhausted"))]
    Exhausted {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation size overflow: {count} * {element_size}"))]
    Overflow {
        count: usize,
        element_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Reasons a [`Config`](crate::Config) is rejected.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("page size {page_size} is not a power of two"))]
    PageSizeNotPowerOfTwo {
        page_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page size {page_size} is smaller than {min}"))]
    PageTooSmall {
        page_size: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "page size {page_size} needs {classes} size classes, table holds {capacity}"
    ))]
    TooManySizeClasses {
        page_size: usize,
        classes: usize,
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "arena header of {header_size} bytes does not fit in the lower half of a {page_size}-byte page"
    ))]
    HeaderTooLarge {
        page_size: usize,
        header_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Inconsistencies detected while resolving or releasing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Corruption {
    BadMagic { page: usize, found: usize },
    Misaligned { addr: usize },
    OutsidePayload { addr: usize },
    NotAllocated { addr: usize },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadMagic { page, found } => {
                write!(f, "bad arena magic {found:#x} in page {page:#x}")
            }
            Self::Misaligned { addr } => write!(f, "misaligned block {addr:#x}"),
            Self::OutsidePayload { addr } => {
                write!(f, "block {addr:#x} is outside the arena payload")
            }
            Self::NotAllocated { addr } => {
                write!(f, "block {addr:#x} is not allocated (double release?)")
            }
        }
    }
}

#[track_caller]
pub(crate) fn heap_corruption(corruption: Corruption) -> ! {
    log::error!("heap corruption: {corruption}");
    panic!("heap corruption: {corruption}");
}
