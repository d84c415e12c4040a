//! Public contract shared by both allocator variants, and the
//! process-wide singleton wiring around whichever one the `rm`/`bud`
//! feature flags select.
//!
//! The facade wraps a `KmaAllocator<P>` in `spin::Mutex`, the same way
//! shared hardware-singleton allocator state gets wrapped elsewhere in a
//! kernel, even though the algorithm underneath is not internally
//! concurrent: the lock exists so a caller invoked reentrantly gets a
//! well-defined panic instead of silently corrupting allocator state, not
//! for throughput.

use core::ptr::NonNull;

use spin::Mutex;

use crate::page::PageProvider;

#[cfg(all(feature = "rm", feature = "bud"))]
compile_error!("features \"rm\" and \"bud\" are mutually exclusive; enable exactly one");
#[cfg(not(any(feature = "rm", feature = "bud")))]
compile_error!("exactly one of features \"rm\" or \"bud\" must be enabled");

#[cfg(feature = "rm")]
pub type KmaAllocator<P> = crate::rm::RmAllocator<P>;
#[cfg(feature = "bud")]
pub type KmaAllocator<P> = crate::bud::BudAllocator<P>;

/// The contract both allocator variants implement.
///
/// `deallocate` is `unsafe`: `ptr` must be exactly a live pointer this same
/// allocator previously returned from `allocate`, un-freed. The original C
/// signature has no way to express that precondition; `unsafe fn` does.
pub trait Allocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must be exactly a pointer this allocator previously returned
    /// from `allocate` and not yet passed to `deallocate`. `size` must
    /// match the size originally requested; it is advisory only (both
    /// variants recover the true size from their own metadata) but is
    /// kept in the signature for interface stability.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);
}

#[cfg(feature = "rm")]
impl<P: PageProvider> Allocator for crate::rm::RmAllocator<P> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        crate::rm::RmAllocator::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        crate::rm::RmAllocator::deallocate(self, ptr)
    }
}

#[cfg(feature = "bud")]
impl<P: PageProvider> Allocator for crate::bud::BudAllocator<P> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        crate::bud::BudAllocator::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        crate::bud::BudAllocator::deallocate(self, ptr)
    }
}

/// A process-wide allocator facade over one `PageProvider` implementation
/// `P`, lazily constructed on first use.
///
/// A genuine `static` singleton needs a concrete, always-available `P`
/// (a real physical-page provider), which is out of scope here — see
/// DESIGN.md. `Kma` is the reusable machinery a crate that does have one
/// would instantiate as a `static KMA: Kma<RealProvider> = Kma::new();`.
pub struct Kma<P: PageProvider> {
    inner: Mutex<Option<KmaAllocator<P>>>,
}

impl<P: PageProvider> Kma<P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Installs the backing provider. Calling this more than once replaces
    /// whatever allocator state existed, losing track of any still-live
    /// allocations against it — callers own sequencing this exactly once,
    /// before any `allocate`/`deallocate` call.
    pub fn init(&self, provider: P) {
        *self.inner.lock() = Some(KmaAllocator::new(provider));
    }

    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner
            .lock()
            .as_mut()
            .expect("Kma::init must be called before Kma::allocate")
            .allocate(size)
    }

    /// # Safety
    /// See [`Allocator::deallocate`].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mut guard = self.inner.lock();
        let allocator = guard
            .as_mut()
            .expect("Kma::init must be called before Kma::deallocate");
        Allocator::deallocate(allocator, ptr, size)
    }
}

impl<P: PageProvider> Default for Kma<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Page size backing the process-wide [`allocate`]/[`deallocate`] free
/// functions below. 8 KiB, a typical kernel page size.
#[cfg(feature = "std")]
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// The process-wide singleton the free-function surface below is a thin
/// wrapper over — the Rust shape of the original C library's exactly one
/// backing arena. Only available under `std`, since [`crate::page::VecPageProvider`]
/// is the one concrete [`PageProvider`] this crate ships.
#[cfg(feature = "std")]
static KMA: Kma<crate::page::VecPageProvider<DEFAULT_PAGE_SIZE>> = Kma::new();

/// Installs the backing page provider for the process-wide singleton.
/// Must be called exactly once, before the first [`allocate`]/[`deallocate`]
/// call — mirrors [`Kma::init`]'s own precondition.
#[cfg(feature = "std")]
pub fn init() {
    KMA.init(crate::page::VecPageProvider::new());
}

/// `allocate(size) -> ptr | null`, over the process-wide singleton.
///
/// # Panics
/// If [`init`] has not yet been called.
#[cfg(feature = "std")]
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    KMA.allocate(size)
}

/// `deallocate(ptr, size)`, over the process-wide singleton.
///
/// # Safety
/// See [`Allocator::deallocate`].
///
/// # Panics
/// If [`init`] has not yet been called.
#[cfg(feature = "std")]
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
    KMA.deallocate(ptr, size)
}
