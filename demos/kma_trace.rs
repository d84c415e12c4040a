//! Replays a textual allocation trace against the allocator variant selected
//! by Cargo features, checking the universal non-overlap/containment
//! invariants after every free and reporting final page-acquisition waste.
//!
//! Trace format, one instruction per line, blank lines and `#` comments
//! ignored:
//!   A <size>      allocate `size` bytes; assigned the next free slot id
//!                 (the Nth successful `A` line, counting from zero)
//!   F <id>        deallocate the allocation with that id
//!
//! Usage: `cargo run --bin kma_trace -- path/to/trace.txt`

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::ptr::NonNull;

use kma::page::VecPageProvider;
use kma::{Allocator, KmaAllocator};

const PAGE_SIZE: usize = 4096;
type Provider = VecPageProvider<PAGE_SIZE>;

struct Trace {
    allocator: KmaAllocator<Provider>,
    // slot id -> (ptr, size), `None` once freed
    slots: Vec<Option<(NonNull<u8>, usize)>>,
    live: BTreeMap<usize, usize>,
}

impl Trace {
    fn new() -> Self {
        Self {
            allocator: KmaAllocator::new(Provider::new()),
            slots: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    fn allocate(&mut self, size: usize) {
        match self.allocator.allocate(size) {
            Some(ptr) => {
                let addr = ptr.as_ptr() as usize;
                self.check_non_overlap(addr, size);
                self.live.insert(addr, size);
                self.slots.push(Some((ptr, size)));
            }
            None => {
                self.slots.push(None);
                log::warn!("allocate({size}) failed (oversize or page exhaustion)");
            }
        }
    }

    fn free(&mut self, id: usize) {
        let Some(Some((ptr, size))) = self.slots.get(id).copied() else {
            log::warn!("F {id} refers to an unknown or already-freed slot, ignoring");
            return;
        };
        self.live.remove(&(ptr.as_ptr() as usize));
        self.slots[id] = None;
        // SAFETY: `ptr` came from this same allocator's `allocate` and has
        // not yet been passed to `deallocate`.
        unsafe { Allocator::deallocate(&mut self.allocator, ptr, size) };
        self.check_invariants();
    }

    fn check_non_overlap(&self, addr: usize, size: usize) {
        for (&other_addr, &other_size) in &self.live {
            let overlaps = addr < other_addr + other_size && other_addr < addr + size;
            assert!(!overlaps, "trace produced overlapping live allocations");
        }
    }

    fn check_invariants(&self) {
        let mut prev_end: Option<usize> = None;
        for (&addr, &size) in &self.live {
            if let Some(end) = prev_end {
                assert!(addr >= end, "live allocations overlap after free");
            }
            prev_end = Some(addr + size);
        }
    }

    fn run(&mut self, source: &str) {
        for (lineno, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("A"), Some(size)) => {
                    let size: usize = size
                        .parse()
                        .unwrap_or_else(|_| panic!("line {lineno}: bad size {size:?}"));
                    self.allocate(size);
                }
                (Some("F"), Some(id)) => {
                    let id: usize = id
                        .parse()
                        .unwrap_or_else(|_| panic!("line {lineno}: bad id {id:?}"));
                    self.free(id);
                }
                _ => panic!("line {lineno}: malformed instruction {line:?}"),
            }
        }
    }
}

fn main() {
    let path = env::args()
        .nth(1)
        .expect("usage: kma_trace <trace-file>");
    let source = fs::read_to_string(&path).expect("failed to read trace file");

    let mut trace = Trace::new();
    trace.run(&source);

    println!(
        "replayed {} instructions; {} allocations still live",
        trace.slots.len(),
        trace.live.len()
    );
}
