//! Resource-map allocator: first fit, in-band block headers, same-page
//! coalescing.
//!
//! Every block, used or free, is threaded onto one global
//! `intrusive_collections::LinkedList` in ascending address order,
//! spanning *all* blocks rather than only free ones. A block's usable
//! capacity is never stored: it is always the distance to whatever comes
//! next in the list (or the page end), so coalescing a run of blocks is
//! just removing list nodes.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

use crate::address::{Address, PhysicalAddress};
use crate::page::PageProvider;

#[repr(C)]
struct BlockHeader {
    link: LinkedListLink,
    used: Cell<bool>,
}

intrusive_adapter!(BlockAdapter = &'static BlockHeader: BlockHeader { link: LinkedListLink });

/// First-fit resource-map allocator over pages supplied by `P`.
pub struct RmAllocator<P: PageProvider> {
    provider: P,
    list: LinkedList<BlockAdapter>,
}

// SAFETY: every access to the `'static` block-header references reached
// through `list` goes through an `&mut self` method call on this same
// `RmAllocator`; nothing is ever read or written concurrently from two
// threads. A caller that moves an `RmAllocator<P>` to another thread between
// calls, or shares it behind a lock (as `kma::Kma` does), still only ever
// has one thread actually touching it at a time.
unsafe impl<P: PageProvider + Send> Send for RmAllocator<P> {}

const HANDLE_SIZE: usize = size_of::<usize>();
const HEADER_SIZE: usize = size_of::<BlockHeader>();
const HEADER_ALIGN: usize = core::mem::align_of::<BlockHeader>();

impl<P: PageProvider> RmAllocator<P> {
    pub fn new(provider: P) -> Self {
        static_assertions::const_assert!(HEADER_SIZE > 0);
        Self {
            provider,
            list: LinkedList::new(BlockAdapter::new()),
        }
    }

    fn max_request_size() -> usize {
        P::PAGE_SIZE.saturating_sub(HEADER_SIZE).saturating_sub(HANDLE_SIZE)
    }

    fn page_base(ptr: usize) -> usize {
        // SAFETY: any in-bounds page address is non-null.
        let nn = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        P::base_of(nn).as_ptr() as usize
    }

    fn same_page(a: usize, b: usize) -> bool {
        Self::page_base(a) == Self::page_base(b)
    }

    /// Acquires a fresh page from the provider, writes its handle at the
    /// base, installs one free block spanning the whole usable region, and
    /// appends it to the tail of the global list.
    fn acquire_and_append_page(&mut self) -> Option<()> {
        let (handle, base) = self.provider.acquire_page()?;
        let base_addr = base.as_ptr() as usize;
        log::trace!("rm: acquired page at {base_addr:#x}");

        // SAFETY: `base` is a fresh, exclusively-owned page of PAGE_SIZE bytes.
        unsafe {
            (base_addr as *mut usize).write(handle.into_raw());
            let header_addr = base_addr + HANDLE_SIZE;
            let header_ptr = header_addr as *mut BlockHeader;
            header_ptr.write(BlockHeader {
                link: LinkedListLink::new(),
                used: Cell::new(false),
            });
            self.list.push_back(&*header_ptr);
        }
        Some(())
    }

    /// Distance from the block at `addr`'s first data byte to whatever
    /// comes next — the next block on the same page, or the page end.
    ///
    /// Addresses, not references, cross the cursor's borrow: `Cursor::get`
    /// ties its returned reference to the cursor's own lifetime, not to
    /// the `'static` duration the underlying page actually has, so we
    /// extract the address we need while the cursor is alive and
    /// re-derive typed access afterward.
    fn capacity_of(&self, addr: usize) -> usize {
        let data_start = addr + HEADER_SIZE;
        let page_end = Self::page_base(addr) + P::PAGE_SIZE;

        // SAFETY: `addr` is a live list element's address.
        let next_addr = unsafe {
            let cursor = self.list.cursor_from_ptr(addr as *const BlockHeader);
            cursor.peek_next().get().map(|n| n as *const BlockHeader as usize)
        };

        if let Some(next_addr) = next_addr {
            if Self::same_page(addr, next_addr) {
                return next_addr - data_start;
            }
        }
        page_end - data_start
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > Self::max_request_size() {
            return None;
        }

        if self.list.is_empty() {
            self.acquire_and_append_page()?;
        }

        loop {
            let found = {
                let mut cursor = self.list.front();
                let mut result = None;
                while let Some(block) = cursor.get() {
                    let addr = block as *const BlockHeader as usize;
                    if !block.used.get() && self.capacity_of(addr) >= size {
                        result = Some(addr);
                        break;
                    }
                    cursor.move_next();
                }
                result
            };

            if let Some(addr) = found {
                return Some(self.complete_allocation(addr, size));
            }

            self.acquire_and_append_page()?;
        }
    }

    fn complete_allocation(&mut self, addr: usize, size: usize) -> NonNull<u8> {
        // SAFETY: `addr` is a live, address-stable block header.
        let block = unsafe { &*(addr as *const BlockHeader) };
        block.used.set(true);
        let data_start = addr + HEADER_SIZE;
        let capacity = self.capacity_of(addr);
        let split_addr = PhysicalAddress::new(data_start + size).align_up(HEADER_ALIGN);

        if split_addr + HEADER_SIZE < data_start + capacity {
            // SAFETY: `split_addr` lies strictly within the block's own
            // usable region, which this allocator exclusively owns.
            unsafe {
                let split_ptr = split_addr as *mut BlockHeader;
                split_ptr.write(BlockHeader {
                    link: LinkedListLink::new(),
                    used: Cell::new(false),
                });
                let mut cursor = self.list.cursor_mut_from_ptr(addr as *const BlockHeader);
                cursor.insert_after(&*(split_ptr as *const BlockHeader));
            }
        }

        // SAFETY: `data_start` is inside the page this block belongs to.
        unsafe { NonNull::new_unchecked(data_start as *mut u8) }
    }

    /// # Safety
    /// `ptr` must be exactly a pointer previously returned by `allocate` on
    /// this allocator and not yet deallocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let header_addr = ptr.as_ptr() as usize - HEADER_SIZE;
        debug_assert!(
            (&*(header_addr as *const BlockHeader)).used.get(),
            "double free or invalid pointer"
        );

        let (prev_addr, next_addr) = {
            let cursor = self.list.cursor_from_ptr(header_addr as *const BlockHeader);
            (
                cursor.peek_prev().get().map(|p| p as *const BlockHeader as usize),
                cursor.peek_next().get().map(|n| n as *const BlockHeader as usize),
            )
        };

        let prev_free = prev_addr.is_some_and(|p| {
            !(&*(p as *const BlockHeader)).used.get() && Self::same_page(p, header_addr)
        });
        let next_free = next_addr.is_some_and(|n| {
            !(&*(n as *const BlockHeader)).used.get() && Self::same_page(n, header_addr)
        });

        let survivor = match (prev_free, next_free) {
            (true, true) => {
                self.unlink(next_addr.unwrap());
                self.unlink(header_addr);
                prev_addr.unwrap()
            }
            (true, false) => {
                self.unlink(header_addr);
                prev_addr.unwrap()
            }
            (false, true) => {
                self.unlink(next_addr.unwrap());
                (&*(header_addr as *const BlockHeader)).used.set(false);
                header_addr
            }
            (false, false) => {
                (&*(header_addr as *const BlockHeader)).used.set(false);
                header_addr
            }
        };

        self.maybe_release_page(survivor);
    }

    fn unlink(&mut self, addr: usize) {
        // SAFETY: `addr` is currently linked into `self.list`.
        let mut cursor = unsafe { self.list.cursor_mut_from_ptr(addr as *const BlockHeader) };
        cursor.remove();
    }

    /// If the block at `addr` is now the sole, unused block on its page,
    /// release the page back to the provider.
    fn maybe_release_page(&mut self, addr: usize) {
        // SAFETY: `addr` is a live, address-stable block header.
        let block = unsafe { &*(addr as *const BlockHeader) };
        if block.used.get() {
            return;
        }

        let page_base = Self::page_base(addr);
        if addr != page_base + HANDLE_SIZE {
            return;
        }

        let whole_region = P::PAGE_SIZE - HANDLE_SIZE - HEADER_SIZE;
        if self.capacity_of(addr) != whole_region {
            return;
        }

        self.unlink(addr);

        // SAFETY: `page_base` is this page's first byte, where its handle
        // was stored when the page was acquired.
        let raw = unsafe { (page_base as *const usize).read() };
        let handle = unsafe { crate::page::PageHandle::from_raw(raw) };
        log::trace!("rm: releasing empty page at {page_base:#x}");
        // SAFETY: `handle` was produced by `acquire_page` for this page, and
        // no live allocation references it anymore (its sole block just
        // became free and spans the whole usable region).
        unsafe { self.provider.release_page(handle) };
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::page::VecPageProvider;

    const PAGE_SIZE: usize = 4096;
    type Provider = VecPageProvider<PAGE_SIZE>;
    type Rm = RmAllocator<Provider>;

    fn new_allocator() -> Rm {
        RmAllocator::new(Provider::new())
    }

    #[test]
    fn oversize_request_returns_none() {
        let mut rm = new_allocator();
        assert!(rm.allocate(PAGE_SIZE).is_none());
    }

    #[test]
    fn seed_s1_alloc_then_free_returns_page() {
        let mut rm = new_allocator();
        let p = rm.allocate(100).unwrap();
        unsafe { rm.deallocate(p) };
        assert!(rm.list.is_empty());
    }

    #[test]
    fn seed_s3_two_allocations_disjoint() {
        let mut rm = new_allocator();
        let a = rm.allocate(100).unwrap();
        let b = rm.allocate(100).unwrap();
        assert_ne!(a, b);
        unsafe {
            rm.deallocate(a);
            rm.deallocate(b);
        }
    }

    #[test]
    fn seed_s5_repeated_alloc_free_reverse_order() {
        let mut rm = new_allocator();
        let mut ptrs = Vec::new();
        for _ in 0..10 {
            ptrs.push(rm.allocate(200).unwrap());
        }
        for p in ptrs.into_iter().rev() {
            unsafe { rm.deallocate(p) };
        }
        assert!(rm.list.is_empty());
    }

    #[test]
    fn randomized_allocate_free_never_overlaps() {
        use rand::seq::SliceRandom;
        use rand::Rng;
        use std::collections::BTreeMap;

        let mut rm = new_allocator();
        let mut rng = rand::thread_rng();
        let mut live: BTreeMap<usize, usize> = BTreeMap::new();

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..200);
                if let Some(p) = rm.allocate(size) {
                    let addr = p.as_ptr() as usize;
                    for (&other, &other_size) in &live {
                        let overlaps = addr < other + other_size && other < addr + size;
                        assert!(!overlaps, "allocation overlap detected");
                    }
                    live.insert(addr, size);
                }
            } else {
                let keys: Vec<usize> = live.keys().copied().collect();
                let addr = *keys.choose(&mut rng).unwrap();
                let size = live.remove(&addr).unwrap();
                // SAFETY: `addr` was returned by `allocate` and not yet freed.
                unsafe { rm.deallocate(NonNull::new_unchecked(addr as *mut u8)) };
                let _ = size;
            }
        }

        for (&addr, _) in live.clone().iter() {
            // SAFETY: still live.
            unsafe { rm.deallocate(NonNull::new_unchecked(addr as *mut u8)) };
        }
        assert!(rm.list.is_empty());
    }

    fn list_addrs(rm: &Rm) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = rm.list.front();
        while let Some(block) = cursor.get() {
            out.push(block as *const BlockHeader as usize);
            cursor.move_next();
        }
        out
    }

    fn assert_no_adjacent_same_page_free_pair(rm: &Rm) {
        let addrs = list_addrs(rm);
        for w in addrs.windows(2) {
            let (a, b) = (w[0], w[1]);
            if !Rm::same_page(a, b) {
                continue;
            }
            let a_used = unsafe { (&*(a as *const BlockHeader)).used.get() };
            let b_used = unsafe { (&*(b as *const BlockHeader)).used.get() };
            assert!(
                a_used || b_used,
                "adjacent same-page blocks at {a:#x}/{b:#x} are both unused"
            );
        }
    }

    /// After every `deallocate`, no same-page adjacent pair of block headers
    /// is both unused, and within each page the block list stays
    /// address-ascending (pages themselves are linked in acquisition order,
    /// not address order).
    #[test]
    fn no_adjacent_unused_pair_and_list_stays_address_ordered() {
        let mut rm = new_allocator();
        let ptrs: Vec<_> = [100, 200, 300, 4000, 50, 4000]
            .into_iter()
            .filter_map(|s| rm.allocate(s))
            .collect();

        for p in ptrs {
            unsafe { rm.deallocate(p) };
            let addrs = list_addrs(&rm);
            for w in addrs.windows(2) {
                if Rm::same_page(w[0], w[1]) {
                    assert!(w[0] < w[1], "same-page blocks out of order");
                }
            }
            assert_no_adjacent_same_page_free_pair(&rm);
        }
    }
}
