//! The page-granular backing store both allocators are layered over.
//!
//! Neither allocator algorithm cares where a page's bytes actually live;
//! they only need a page-aligned region of `PAGE_SIZE` bytes, an opaque
//! handle to give back on release, and a way to round an arbitrary pointer
//! down to the page it lives on. [`VecPageProvider`] is the concrete,
//! heap-backed implementation the test suites and the trace harness run
//! against, playing the role a real physical-page allocator would during
//! early boot.

#[cfg(feature = "std")]
use core::alloc::Layout;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

#[cfg(feature = "std")]
use std::collections::HashSet;

/// Opaque identity for a page acquired from a [`PageProvider`].
///
/// Deliberately not a pointer: a handle can be stored in-band (RM writes
/// it at a page's base) without granting whoever reads it the ability to
/// dereference it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(NonZeroUsize);

impl PageHandle {
    /// # Safety
    /// `addr` must be a value previously produced by a `PageProvider`
    /// implementation for this same provider instance.
    unsafe fn from_addr(addr: usize) -> Self {
        debug_assert_ne!(addr, 0);
        Self(NonZeroUsize::new_unchecked(addr))
    }

    #[cfg(feature = "std")]
    fn addr(self) -> usize {
        self.0.get()
    }

    /// Encodes this handle as a raw, storable integer — used by allocators
    /// that need to persist a page's handle in-band (RM) or in a
    /// bookkeeping slot (BUD) so it can be recovered and passed back to
    /// `release_page` without a side table.
    pub(crate) fn into_raw(self) -> usize {
        self.0.get()
    }

    /// # Safety
    /// `raw` must be a value previously produced by `into_raw` on a handle
    /// for this same provider.
    pub(crate) unsafe fn from_raw(raw: usize) -> Self {
        Self::from_addr(raw)
    }
}

/// A page-granular backing store.
///
/// Implementors hand out whole, non-subdivided pages of `PAGE_SIZE` bytes
/// and take them back by [`PageHandle`]. `base_of` must agree with
/// whatever alignment `acquire_page` actually produces — both allocators
/// rely on it to recover a page's start from any pointer into it.
pub trait PageProvider {
    /// Size of a page in bytes. Must be a power of two.
    const PAGE_SIZE: usize;

    /// Hands out one fresh, zero-length-lifetime page. Returns `None` on
    /// exhaustion; callers treat this exactly like an oversize request.
    fn acquire_page(&mut self) -> Option<(PageHandle, NonNull<u8>)>;

    /// Returns a page to the provider.
    ///
    /// # Safety
    /// `handle` must be a value this provider returned from
    /// `acquire_page` and not yet passed to `release_page`. No live
    /// allocation may still reference bytes in that page.
    unsafe fn release_page(&mut self, handle: PageHandle);

    /// Rounds `ptr` down to the first byte of the page containing it.
    fn base_of(ptr: NonNull<u8>) -> NonNull<u8> {
        let mask = !(Self::PAGE_SIZE - 1);
        let base = (ptr.as_ptr() as usize) & mask;
        // SAFETY: base is >= a page-aligned allocation's start and thus non-null.
        unsafe { NonNull::new_unchecked(base as *mut u8) }
    }
}

/// A [`PageProvider`] backed by individually heap-allocated, page-aligned
/// buffers. Used by the allocator test suites and the trace harness; not
/// part of the allocators' hot path.
#[cfg(feature = "std")]
pub struct VecPageProvider<const PAGE_SIZE: usize> {
    live: HashSet<usize>,
}

#[cfg(feature = "std")]
impl<const PAGE_SIZE: usize> VecPageProvider<PAGE_SIZE> {
    /// Fallible constructor: fails if `PAGE_SIZE` cannot back a valid
    /// page-aligned `Layout` (zero, not a power of two, or larger than
    /// `isize::MAX`).
    pub fn try_new() -> crate::error::Result<Self> {
        if PAGE_SIZE == 0 || !PAGE_SIZE.is_power_of_two() {
            return Err(crate::error::Error::PageProviderOOM);
        }
        Ok(Self {
            live: HashSet::new(),
        })
    }

    /// # Panics
    /// If `PAGE_SIZE` is zero or not a power of two. Prefer [`Self::try_new`]
    /// when `PAGE_SIZE` is not already known-good at the call site.
    pub fn new() -> Self {
        Self::try_new().expect("PAGE_SIZE must be a non-zero power of two")
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .expect("PAGE_SIZE must be a non-zero power of two")
    }
}

#[cfg(feature = "std")]
impl<const PAGE_SIZE: usize> Default for VecPageProvider<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl<const PAGE_SIZE: usize> PageProvider for VecPageProvider<PAGE_SIZE> {
    const PAGE_SIZE: usize = PAGE_SIZE;

    fn acquire_page(&mut self) -> Option<(PageHandle, NonNull<u8>)> {
        // SAFETY: layout is a non-zero, page-aligned size.
        let raw = unsafe { std::alloc::alloc_zeroed(Self::layout()) };
        let ptr = NonNull::new(raw)?;
        let addr = ptr.as_ptr() as usize;
        self.live.insert(addr);
        // SAFETY: addr came from a successful allocation, so it is non-zero.
        Some((unsafe { PageHandle::from_addr(addr) }, ptr))
    }

    unsafe fn release_page(&mut self, handle: PageHandle) {
        let addr = handle.addr();
        debug_assert!(
            self.live.remove(&addr),
            "release_page called with an unknown or already-released handle"
        );
        std::alloc::dealloc(addr as *mut u8, Self::layout());
    }
}

#[cfg(feature = "std")]
impl<const PAGE_SIZE: usize> Drop for VecPageProvider<PAGE_SIZE> {
    fn drop(&mut self) {
        for addr in self.live.drain() {
            // SAFETY: every address in `live` was produced by `acquire_page`
            // and has not been released yet.
            unsafe { std::alloc::dealloc(addr as *mut u8, Self::layout()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_page_aligned_pointers() {
        let mut provider = VecPageProvider::<4096>::new();
        let (_, ptr) = provider.acquire_page().unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn base_of_rounds_down_to_page_start() {
        let mut provider = VecPageProvider::<4096>::new();
        let (_, ptr) = provider.acquire_page().unwrap();
        let mid = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(42)) };
        assert_eq!(
            VecPageProvider::<4096>::base_of(mid).as_ptr(),
            ptr.as_ptr()
        );
    }

    #[test]
    fn release_then_reacquire_does_not_leak_handles() {
        let mut provider = VecPageProvider::<4096>::new();
        let (handle, _) = provider.acquire_page().unwrap();
        unsafe { provider.release_page(handle) };
        assert!(provider.live.is_empty());
        let (_, ptr2) = provider.acquire_page().unwrap();
        assert_eq!(ptr2.as_ptr() as usize % 4096, 0);
        assert_eq!(provider.live.len(), 1);
    }
}
