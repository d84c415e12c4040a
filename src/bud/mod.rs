//! Buddy allocator: in-band `{size, used}` header, out-of-band bookkeeping
//! pages for the free-block and live-page lists.
//!
//! A data page's bytes carry only the one-byte [`InBandHeader`] per block —
//! user data is never at risk of being overwritten by list links, unlike
//! the resource-map variant. The free list and page list instead live on
//! dedicated bookkeeping pages, each a small slot array threaded by
//! `intrusive_collections::LinkedList`.
//!
//! The aggregate list state (list heads, bookkeeping-page chains) lives in
//! the allocator object itself rather than being re-derived from whichever
//! bookkeeping page happens to be "head", replacing a global mutable
//! singleton with an explicit allocator object. A bookkeeping page therefore
//! needs only an occupancy count, its own page handle, and a forward link to
//! the next page of its kind; when occupancy drops to zero the page is
//! simply unlinked and released (see DESIGN.md for how this reads on head
//! migration).

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use modular_bitfield::prelude::*;

use crate::page::{PageHandle, PageProvider};

/// In-band per-block header: a block's size (as a power of two) and
/// whether it is currently handed out. Packed into a single byte as a
/// discriminated, explicitly laid out struct rather than raw sentinel
/// bit-packing; no on-page layout is pinned by any test.
#[bitfield]
#[derive(Clone, Copy)]
pub(crate) struct InBandHeader {
    pub size_log2: B5,
    pub used: bool,
    #[skip]
    __: B2,
}

const HEADER_SIZE: usize = size_of::<InBandHeader>();

fn log2(n: usize) -> u8 {
    debug_assert!(n.is_power_of_two());
    n.trailing_zeros() as u8
}

unsafe fn read_header(addr: usize) -> InBandHeader {
    (addr as *const InBandHeader).read()
}

unsafe fn write_header(addr: usize, size: usize, used: bool) {
    let header = InBandHeader::new()
        .with_size_log2(log2(size))
        .with_used(used);
    (addr as *mut InBandHeader).write(header);
}

fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

fn buddy_of(addr: usize, size: usize) -> usize {
    addr ^ size
}

// ---------------------------------------------------------------------
// Free-block list (out of band)
// ---------------------------------------------------------------------

#[repr(C)]
struct BlockEntry {
    link: LinkedListLink,
    in_use: Cell<bool>,
    addr: Cell<usize>,
    size: Cell<usize>,
}

intrusive_adapter!(BlockEntryAdapter = &'static BlockEntry: BlockEntry { link: LinkedListLink });

#[repr(C)]
struct BlockBkHeader {
    occupancy: Cell<u32>,
    page_handle: Cell<usize>,
    next: Cell<usize>,
}

fn block_slots_per_page<P: PageProvider>() -> usize {
    (P::PAGE_SIZE - size_of::<BlockBkHeader>()) / size_of::<BlockEntry>()
}

// ---------------------------------------------------------------------
// Live-page list (out of band)
// ---------------------------------------------------------------------

#[repr(C)]
struct PageEntry {
    link: LinkedListLink,
    in_use: Cell<bool>,
    handle_raw: Cell<usize>,
    page_addr: Cell<usize>,
}

intrusive_adapter!(PageEntryAdapter = &'static PageEntry: PageEntry { link: LinkedListLink });

#[repr(C)]
struct PageBkHeader {
    occupancy: Cell<u32>,
    page_handle: Cell<usize>,
    next: Cell<usize>,
}

fn page_slots_per_page<P: PageProvider>() -> usize {
    (P::PAGE_SIZE - size_of::<PageBkHeader>()) / size_of::<PageEntry>()
}

/// Buddy allocator over pages supplied by `P`.
pub struct BudAllocator<P: PageProvider> {
    provider: P,
    free_blocks: LinkedList<BlockEntryAdapter>,
    live_pages: LinkedList<PageEntryAdapter>,
    block_bk_head: Option<usize>,
    page_bk_head: Option<usize>,
}

// SAFETY: every access to the `'static` bookkeeping-slot references reached
// through `free_blocks`/`live_pages` goes through an `&mut self` method call
// on this same `BudAllocator`; nothing is ever read or written concurrently
// from two threads. A caller that moves a `BudAllocator<P>` to another
// thread between calls, or shares it behind a lock (as `kma::Kma` does),
// still only ever has one thread actually touching it at a time.
unsafe impl<P: PageProvider + Send> Send for BudAllocator<P> {}

impl<P: PageProvider> BudAllocator<P> {
    /// Fallible constructor: fails if `P::PAGE_SIZE` is too small to host
    /// even one block or page bookkeeping slot alongside its header.
    pub fn try_new(provider: P) -> crate::error::Result<Self> {
        if block_slots_per_page::<P>() == 0 || page_slots_per_page::<P>() == 0 {
            return Err(crate::error::Error::BookkeepingExhausted);
        }
        Ok(Self {
            provider,
            free_blocks: LinkedList::new(BlockEntryAdapter::new()),
            live_pages: LinkedList::new(PageEntryAdapter::new()),
            block_bk_head: None,
            page_bk_head: None,
        })
    }

    /// # Panics
    /// If `P::PAGE_SIZE` cannot host even one bookkeeping slot. Prefer
    /// [`Self::try_new`] when that isn't already known-good at the call site.
    pub fn new(provider: P) -> Self {
        Self::try_new(provider).expect("PAGE_SIZE too small to host even one bookkeeping slot")
    }

    // -- block bookkeeping slot management --------------------------------

    unsafe fn bk_page_of(addr: usize) -> usize {
        let nn = NonNull::new_unchecked(addr as *mut u8);
        P::base_of(nn).as_ptr() as usize
    }

    fn block_bk_header(page: usize) -> &'static BlockBkHeader {
        unsafe { &*(page as *const BlockBkHeader) }
    }

    fn block_slot(page: usize, idx: usize) -> &'static BlockEntry {
        let addr = page + size_of::<BlockBkHeader>() + idx * size_of::<BlockEntry>();
        unsafe { &*(addr as *const BlockEntry) }
    }

    /// Finds a free slot in the existing chain, or chains on a fresh
    /// bookkeeping page, and returns an initialized, in-use `BlockEntry`.
    fn alloc_block_slot(&mut self, addr: usize, size: usize) -> Option<&'static BlockEntry> {
        let mut page = self.block_bk_head;
        let mut tail = None;
        while let Some(p) = page {
            let header = Self::block_bk_header(p);
            for i in 0..block_slots_per_page::<P>() {
                let slot = Self::block_slot(p, i);
                if !slot.in_use.get() {
                    slot.in_use.set(true);
                    slot.addr.set(addr);
                    slot.size.set(size);
                    header.occupancy.set(header.occupancy.get() + 1);
                    self.free_blocks.push_back(slot);
                    return Some(slot);
                }
            }
            tail = Some(p);
            page = (header.next.get() != 0).then(|| header.next.get());
        }

        let (handle, base) = self.provider.acquire_page()?;
        let base_addr = base.as_ptr() as usize;
        unsafe {
            (base_addr as *mut BlockBkHeader).write(BlockBkHeader {
                occupancy: Cell::new(0),
                page_handle: Cell::new(handle.into_raw()),
                next: Cell::new(0),
            });
            for i in 0..block_slots_per_page::<P>() {
                let slot_addr = base_addr + size_of::<BlockBkHeader>() + i * size_of::<BlockEntry>();
                (slot_addr as *mut BlockEntry).write(BlockEntry {
                    link: LinkedListLink::new(),
                    in_use: Cell::new(false),
                    addr: Cell::new(0),
                    size: Cell::new(0),
                });
            }
        }

        match tail {
            Some(t) => Self::block_bk_header(t).next.set(base_addr),
            None => self.block_bk_head = Some(base_addr),
        }

        let header = Self::block_bk_header(base_addr);
        let slot = Self::block_slot(base_addr, 0);
        slot.in_use.set(true);
        slot.addr.set(addr);
        slot.size.set(size);
        header.occupancy.set(1);
        self.free_blocks.push_back(slot);
        Some(slot)
    }

    /// Removes `entry` from the free list and reclaims its bookkeeping
    /// slot, releasing the bookkeeping page if it becomes empty.
    fn free_block_slot(&mut self, entry: &'static BlockEntry) {
        {
            let mut cursor = unsafe {
                self.free_blocks
                    .cursor_mut_from_ptr(entry as *const BlockEntry)
            };
            cursor.remove();
        }
        entry.in_use.set(false);

        let page = unsafe { Self::bk_page_of(entry as *const BlockEntry as usize) };
        let header = Self::block_bk_header(page);
        header.occupancy.set(header.occupancy.get() - 1);
        if header.occupancy.get() == 0 {
            self.reclaim_block_bk_page(page);
        }
    }

    fn reclaim_block_bk_page(&mut self, page: usize) {
        let handle = unsafe { PageHandle::from_raw(Self::block_bk_header(page).page_handle.get()) };
        let next = Self::block_bk_header(page).next.get();

        if self.block_bk_head == Some(page) {
            self.block_bk_head = (next != 0).then_some(next);
        } else {
            let mut cur = self.block_bk_head;
            while let Some(p) = cur {
                let h = Self::block_bk_header(p);
                if h.next.get() == page {
                    h.next.set(next);
                    break;
                }
                cur = Some(h.next.get());
            }
        }

        unsafe { self.provider.release_page(handle) };
    }

    // -- page bookkeeping slot management ----------------------------------

    fn page_bk_header(page: usize) -> &'static PageBkHeader {
        unsafe { &*(page as *const PageBkHeader) }
    }

    fn page_slot(page: usize, idx: usize) -> &'static PageEntry {
        let addr = page + size_of::<PageBkHeader>() + idx * size_of::<PageEntry>();
        unsafe { &*(addr as *const PageEntry) }
    }

    fn alloc_page_slot(&mut self, handle: PageHandle, page_addr: usize) -> Option<&'static PageEntry> {
        let mut page = self.page_bk_head;
        let mut tail = None;
        while let Some(p) = page {
            let header = Self::page_bk_header(p);
            for i in 0..page_slots_per_page::<P>() {
                let slot = Self::page_slot(p, i);
                if !slot.in_use.get() {
                    slot.in_use.set(true);
                    slot.handle_raw.set(handle.into_raw());
                    slot.page_addr.set(page_addr);
                    header.occupancy.set(header.occupancy.get() + 1);
                    self.live_pages.push_back(slot);
                    return Some(slot);
                }
            }
            tail = Some(p);
            page = (header.next.get() != 0).then(|| header.next.get());
        }

        let (bk_handle, base) = self.provider.acquire_page()?;
        let base_addr = base.as_ptr() as usize;
        unsafe {
            (base_addr as *mut PageBkHeader).write(PageBkHeader {
                occupancy: Cell::new(0),
                page_handle: Cell::new(bk_handle.into_raw()),
                next: Cell::new(0),
            });
            for i in 0..page_slots_per_page::<P>() {
                let slot_addr = base_addr + size_of::<PageBkHeader>() + i * size_of::<PageEntry>();
                (slot_addr as *mut PageEntry).write(PageEntry {
                    link: LinkedListLink::new(),
                    in_use: Cell::new(false),
                    handle_raw: Cell::new(0),
                    page_addr: Cell::new(0),
                });
            }
        }

        match tail {
            Some(t) => Self::page_bk_header(t).next.set(base_addr),
            None => self.page_bk_head = Some(base_addr),
        }

        let header = Self::page_bk_header(base_addr);
        let slot = Self::page_slot(base_addr, 0);
        slot.in_use.set(true);
        slot.handle_raw.set(handle.into_raw());
        slot.page_addr.set(page_addr);
        header.occupancy.set(1);
        self.live_pages.push_back(slot);
        Some(slot)
    }

    fn free_page_slot(&mut self, entry: &'static PageEntry) {
        {
            let mut cursor = unsafe {
                self.live_pages
                    .cursor_mut_from_ptr(entry as *const PageEntry)
            };
            cursor.remove();
        }
        entry.in_use.set(false);

        let page = unsafe { Self::bk_page_of(entry as *const PageEntry as usize) };
        let header = Self::page_bk_header(page);
        header.occupancy.set(header.occupancy.get() - 1);
        if header.occupancy.get() == 0 {
            self.reclaim_page_bk_page(page);
        }
    }

    fn reclaim_page_bk_page(&mut self, page: usize) {
        let handle = unsafe { PageHandle::from_raw(Self::page_bk_header(page).page_handle.get()) };
        let next = Self::page_bk_header(page).next.get();

        if self.page_bk_head == Some(page) {
            self.page_bk_head = (next != 0).then_some(next);
        } else {
            let mut cur = self.page_bk_head;
            while let Some(p) = cur {
                let h = Self::page_bk_header(p);
                if h.next.get() == page {
                    h.next.set(next);
                    break;
                }
                cur = Some(h.next.get());
            }
        }

        unsafe { self.provider.release_page(handle) };
    }

    // -- data page acquisition ---------------------------------------------

    /// Acquires a fresh data page, records it in the page list, and
    /// installs one free block spanning the whole page.
    fn acquire_data_page(&mut self) -> Option<&'static BlockEntry> {
        let (handle, base) = self.provider.acquire_page()?;
        let base_addr = base.as_ptr() as usize;
        log::trace!("bud: acquired data page at {base_addr:#x}");
        self.alloc_page_slot(handle, base_addr)?;
        unsafe { write_header(base_addr, P::PAGE_SIZE, false) };
        self.alloc_block_slot(base_addr, P::PAGE_SIZE)
    }

    // -- public contract ----------------------------------------------------

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        // A block must hold its own header plus at least one byte of usable
        // data, or the returned pointer (`addr + HEADER_SIZE`) lands past the
        // block's end and into its buddy.
        let effective = next_power_of_two((size + HEADER_SIZE).max(2 * HEADER_SIZE));
        if effective > P::PAGE_SIZE {
            return None;
        }

        let mut chosen_addr = self.best_fit(effective);
        if chosen_addr.is_none() {
            chosen_addr = self
                .acquire_data_page()
                .map(|e| e as *const BlockEntry as usize);
        }
        let chosen_addr = chosen_addr?;
        // SAFETY: `chosen_addr` is a live free-block slot's address.
        let chosen = unsafe { &*(chosen_addr as *const BlockEntry) };

        while chosen.size.get() > effective {
            let half = chosen.size.get() / 2;
            chosen.size.set(half);
            let buddy_addr = buddy_of(chosen.addr.get(), half);
            unsafe { write_header(buddy_addr, half, false) };
            self.alloc_block_slot(buddy_addr, half);
        }

        let addr = chosen.addr.get();
        self.free_block_slot(chosen);
        unsafe { write_header(addr, effective, true) };

        // SAFETY: `addr` is the start of a live block this allocator owns.
        Some(unsafe { NonNull::new_unchecked((addr + HEADER_SIZE) as *mut u8) })
    }

    /// Single pass over the free list: smallest block with `size >=
    /// effective`, breaking early on an exact match. Returns an address
    /// rather than a reference — `Cursor::get` ties its result to the
    /// cursor's own borrow, not to the list's actual `'static` duration.
    fn best_fit(&self, effective: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        let mut cursor = self.free_blocks.front();
        while let Some(entry) = cursor.get() {
            let size = entry.size.get();
            let slot_addr = entry as *const BlockEntry as usize;
            if size >= effective {
                if size == effective {
                    return Some(slot_addr);
                }
                if best.is_none_or(|(_, best_size)| size < best_size) {
                    best = Some((slot_addr, size));
                }
            }
            cursor.move_next();
        }
        best.map(|(slot_addr, _)| slot_addr)
    }

    /// # Safety
    /// `ptr` must be exactly a pointer previously returned by `allocate` on
    /// this allocator and not yet deallocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let mut addr = ptr.as_ptr() as usize - HEADER_SIZE;
        let header = read_header(addr);
        debug_assert!(header.used(), "double free or invalid pointer");
        let mut size = 1usize << header.size_log2();
        write_header(addr, size, false);

        while size < P::PAGE_SIZE {
            let buddy_addr = buddy_of(addr, size);
            let buddy_header = read_header(buddy_addr);
            let buddy_size = 1usize << buddy_header.size_log2();
            if buddy_header.used() || buddy_size != size {
                break;
            }

            let entry_addr = self.find_free_block(buddy_addr, size);
            match entry_addr {
                // SAFETY: `entry_addr` is a live free-block slot's address.
                Some(entry_addr) => self.free_block_slot(unsafe { &*(entry_addr as *const BlockEntry) }),
                None => break,
            }

            addr = addr.min(buddy_addr);
            size *= 2;
            write_header(addr, size, false);
        }

        if size == P::PAGE_SIZE {
            let page_entry_addr = self
                .find_live_page(addr)
                .expect("every acquired data page has a matching PageEntry");
            // SAFETY: `page_entry_addr` is a live page-list slot's address.
            let page_entry = &*(page_entry_addr as *const PageEntry);
            let handle = PageHandle::from_raw(page_entry.handle_raw.get());
            log::trace!("bud: releasing fully-coalesced page at {addr:#x}");
            self.free_page_slot(page_entry);
            // SAFETY: this page's sole block is free and spans PAGE_SIZE,
            // so it holds no other live state; `handle` is the handle this
            // allocator received when it acquired the page.
            self.provider.release_page(handle);
        } else {
            self.alloc_block_slot(addr, size);
        }
    }

    /// Returns the matching slot's own address, not its `entry.addr` field.
    fn find_free_block(&self, addr: usize, size: usize) -> Option<usize> {
        let mut cursor = self.free_blocks.front();
        while let Some(entry) = cursor.get() {
            if entry.addr.get() == addr && entry.size.get() == size {
                return Some(entry as *const BlockEntry as usize);
            }
            cursor.move_next();
        }
        None
    }

    fn find_live_page(&self, page_base: usize) -> Option<usize> {
        let mut cursor = self.live_pages.front();
        while let Some(entry) = cursor.get() {
            if entry.page_addr.get() == page_base {
                return Some(entry as *const PageEntry as usize);
            }
            cursor.move_next();
        }
        None
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::page::VecPageProvider;

    const PAGE_SIZE: usize = 4096;
    type Provider = VecPageProvider<PAGE_SIZE>;
    type Bud = BudAllocator<Provider>;

    fn new_allocator() -> Bud {
        BudAllocator::new(Provider::new())
    }

    #[test]
    fn oversize_request_returns_none() {
        let mut bud = new_allocator();
        assert!(bud.allocate(PAGE_SIZE).is_none());
    }

    #[test]
    fn seed_s1_alloc_then_free_returns_page() {
        let mut bud = new_allocator();
        let p = bud.allocate(100).unwrap();
        unsafe { bud.deallocate(p) };
        assert!(bud.live_pages.is_empty());
        assert!(bud.free_blocks.is_empty());
    }

    #[test]
    fn seed_s4_two_single_byte_allocations_are_buddies() {
        let mut bud = new_allocator();
        let a = bud.allocate(1).unwrap();
        let b = bud.allocate(1).unwrap();
        let size = next_power_of_two(1 + HEADER_SIZE);
        assert_eq!(
            buddy_of(a.as_ptr() as usize - HEADER_SIZE, size),
            b.as_ptr() as usize - HEADER_SIZE
        );
        unsafe {
            bud.deallocate(a);
            bud.deallocate(b);
        }
        assert!(bud.live_pages.is_empty());
    }

    #[test]
    fn zero_byte_request_does_not_overlap_its_buddy() {
        let mut bud = new_allocator();
        let a = bud.allocate(0).unwrap();
        let b = bud.allocate(0).unwrap();
        let header_addr = a.as_ptr() as usize - HEADER_SIZE;
        let size = next_power_of_two(2 * HEADER_SIZE);
        assert_eq!(buddy_of(header_addr, size), b.as_ptr() as usize - HEADER_SIZE);
        assert!((a.as_ptr() as usize) < (b.as_ptr() as usize - HEADER_SIZE));
        unsafe {
            bud.deallocate(a);
            bud.deallocate(b);
        }
        assert!(bud.live_pages.is_empty());
    }

    #[test]
    fn seed_s6_reuses_freed_slot_address() {
        let mut bud = new_allocator();
        let a = bud.allocate(100).unwrap();
        let b = bud.allocate(100).unwrap();
        unsafe { bud.deallocate(a) };
        let c = bud.allocate(100).unwrap();
        assert_eq!(a, c);
        unsafe {
            bud.deallocate(b);
            bud.deallocate(c);
        }
    }

    #[test]
    fn randomized_allocate_free_never_overlaps() {
        use rand::seq::SliceRandom;
        use rand::Rng;
        use std::collections::BTreeMap;

        let mut bud = new_allocator();
        let mut rng = rand::thread_rng();
        let mut live: BTreeMap<usize, usize> = BTreeMap::new();

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..200);
                if let Some(p) = bud.allocate(size) {
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
                unsafe { bud.deallocate(NonNull::new_unchecked(addr as *mut u8)) };
                let _ = size;
            }
        }

        for (&addr, _) in live.clone().iter() {
            unsafe { bud.deallocate(NonNull::new_unchecked(addr as *mut u8)) };
        }
        assert!(bud.live_pages.is_empty());
    }

    fn free_block_addrs(bud: &Bud) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cursor = bud.free_blocks.front();
        while let Some(entry) = cursor.get() {
            out.push((entry.addr.get(), entry.size.get()));
            cursor.move_next();
        }
        out
    }

    /// Property 6: every in-band header's size is a power of two, at most
    /// `PAGE_SIZE`, and its address is a multiple of that size.
    #[test]
    fn power_of_two_sizing_holds_for_every_live_allocation() {
        let mut bud = new_allocator();
        let mut ptrs = Vec::new();
        for size in [1, 3, 7, 50, 100, 500, 1000, 4000] {
            if let Some(p) = bud.allocate(size) {
                ptrs.push(p);
            }
        }

        for p in &ptrs {
            let header_addr = p.as_ptr() as usize - HEADER_SIZE;
            let header = unsafe { read_header(header_addr) };
            let size = 1usize << header.size_log2();
            assert!(size.is_power_of_two());
            assert!(size <= PAGE_SIZE);
            assert_eq!(header_addr % size, 0, "block not aligned to its own size");
        }

        for p in ptrs {
            unsafe { bud.deallocate(p) };
        }
    }

    /// Property 7: after any `deallocate` returns, no free block has a free
    /// buddy — every eligible merge has already happened.
    #[test]
    fn maximal_coalescing_after_every_free() {
        let mut bud = new_allocator();
        let ptrs: Vec<_> = [16, 32, 64, 100, 1, 1].map(|s| bud.allocate(s).unwrap()).to_vec();

        for (i, p) in ptrs.into_iter().enumerate() {
            unsafe { bud.deallocate(p) };
            for (addr, size) in free_block_addrs(&bud) {
                let buddy_addr = buddy_of(addr, size);
                let still_free = free_block_addrs(&bud)
                    .iter()
                    .any(|&(a, s)| a == buddy_addr && s == size);
                assert!(
                    !still_free,
                    "free block at {addr:#x} (size {size}) has a free buddy after free #{i}"
                );
            }
        }
    }

    /// Property 8: the live `BlockEntry` count always equals the number of
    /// free blocks actually reachable, and every acquired data page has
    /// exactly one matching `PageEntry` — checked here via simple
    /// conservation: total free bytes plus total live-allocation effective
    /// bytes equals `PAGE_SIZE` times the number of acquired pages.
    #[test]
    fn bookkeeping_is_conserved_across_alloc_free_cycles() {
        let mut bud = new_allocator();
        let mut live = Vec::new();
        for size in [10, 20, 40, 80, 160] {
            live.push((bud.allocate(size).unwrap(), size));
        }

        let page_count = {
            let mut n = 0usize;
            let mut cursor = bud.live_pages.front();
            while cursor.get().is_some() {
                n += 1;
                cursor.move_next();
            }
            n
        };

        let free_bytes: usize = free_block_addrs(&bud).iter().map(|&(_, s)| s).sum();
        let effective_live_bytes: usize = live
            .iter()
            .map(|&(_, s)| next_power_of_two(s + HEADER_SIZE))
            .sum();

        assert_eq!(free_bytes + effective_live_bytes, page_count * PAGE_SIZE);

        for (p, _) in live {
            unsafe { bud.deallocate(p) };
        }
        assert!(bud.live_pages.is_empty());
        assert!(bud.free_blocks.is_empty());
    }
}
