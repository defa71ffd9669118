//! The collaborator that supplies whole pages.

use core::ptr::NonNull;

/// A source of page-sized, page-aligned memory regions.
///
/// The allocator turns every page it acquires into one arena and gives it
/// back as soon as every block carved from it has been released.
///
/// # Safety
///
/// Implementors must guarantee that every pointer returned by
/// [`acquire_page`](Self::acquire_page):
///
/// - is aligned to the page size of the [`Config`](crate::Config) the
///   allocator was created with,
/// - is valid for reads and writes of that many bytes,
/// - is not handed out again, nor used by anyone else, until it has been
///   passed back to [`release_page`](Self::release_page).
pub unsafe trait PageSource {
    /// Hands out one page, or `None` if the source is exhausted.
    fn acquire_page(&self) -> Option<NonNull<u8>>;

    /// Takes back a page.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by [`acquire_page`](Self::acquire_page)
    /// on this source and not released since.
    unsafe fn release_page(&self, page: NonNull<u8>);
}

unsafe impl<P> PageSource for &P
where
    P: PageSource + ?Sized,
{
    fn acquire_page(&self) -> Option<NonNull<u8>> {
        (**self).acquire_page()
    }

    unsafe fn release_page(&self, page: NonNull<u8>) {
        unsafe { (**self).release_page(page) }
    }
}
