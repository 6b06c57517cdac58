// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic allocation of SRAM.
//!
//! The heap is one statically reserved arena carved into
//! [`config::PAGE_BYTES`]-sized pages, tracked by a [`PageMap`]. An
//! allocation is a contiguous run of pages; callers get back the actual
//! number of bytes granted, which they must present again when freeing.
//!
//! `free` performs no validity checking. Freeing an address that was never
//! allocated, or with the wrong length, only flips the corresponding bitmap
//! bits -- it cannot corrupt the allocator's own structures, but it can
//! certainly ruin someone else's day.

use crate::arch;
use crate::config;
use crate::hooks;
use crate::kernel::SwitchGuard;
use crate::pagemap::{PageMap, SearchStrategy};

/// A successful allocation: the base address of the run and the number of
/// bytes actually granted (the request rounded up to whole pages).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    pub addr: usize,
    pub len: usize,
}

/// The allocator's state: arena base plus the page bitmap.
pub struct Heap {
    base: usize,
    map: PageMap<{ config::PAGE_MAP_BYTES }>,
}

impl Heap {
    /// Wraps `arena` as the heap. Partial trailing pages are unusable and
    /// simply never tracked.
    pub fn new(arena: &'static mut [u8]) -> Self {
        let pages = arena.len() / config::PAGE_BYTES;
        Self {
            base: arena.as_mut_ptr() as usize,
            map: PageMap::new(pages as u16),
        }
    }

    fn page_addr(&self, page: u16) -> usize {
        self.base + usize::from(page) * config::PAGE_BYTES
    }

    fn pages_for(bytes: usize) -> u16 {
        bytes.div_ceil(config::PAGE_BYTES) as u16
    }

    /// Allocates a contiguous chunk of at least `bytes` bytes, searching
    /// the bitmap in the order given by `strategy`. Returns `None` when no
    /// suitable run of pages exists.
    pub fn allocate(
        &mut self,
        bytes: usize,
        strategy: SearchStrategy,
    ) -> Option<Allocation> {
        if bytes == 0 {
            return None;
        }

        let pages = Self::pages_for(bytes);
        let start = self.map.find_free_run(pages, strategy)?;

        for page in start..start + pages {
            self.map.mark_used(page);
        }

        Some(Allocation {
            addr: self.page_addr(start),
            len: usize::from(pages) * config::PAGE_BYTES,
        })
    }

    /// Returns a previously allocated chunk to the heap.
    ///
    /// Out-of-range addresses are ignored; in-range addresses have their
    /// pages marked free whether or not they were allocated (double-free
    /// degenerates to a no-op on the bitmap).
    pub fn free(&mut self, addr: usize, bytes: usize) {
        if bytes == 0 || addr < self.base {
            return;
        }

        let start = (addr - self.base) / config::PAGE_BYTES;
        if start >= usize::from(self.map.total_page_count()) {
            return;
        }
        let start = start as u16;

        let end = (start + Self::pages_for(bytes))
            .min(self.map.total_page_count());
        for page in start..end {
            self.map.mark_free(page);
        }
    }

    /// Number of pages currently free.
    pub fn free_page_count(&self) -> u16 {
        self.map.free_page_count()
    }

    /// Number of pages currently in use.
    pub fn used_page_count(&self) -> u16 {
        self.map.used_page_count()
    }

    /// Total number of pages under management.
    pub fn total_page_count(&self) -> u16 {
        self.map.total_page_count()
    }
}

/// Allocates a chunk of SRAM on behalf of the running thread.
///
/// Context switching is held off for the duration so two threads can't
/// interleave bitmap updates. On failure the `on_out_of_memory` hook fires
/// before `None` comes back.
pub fn allocate(bytes: usize, strategy: SearchStrategy) -> Option<Allocation> {
    let rc = {
        let _gate = SwitchGuard::forbid();
        arch::with_kernel(|k| k.heap_mut().allocate(bytes, strategy))
    };

    if rc.is_none() && bytes != 0 {
        (hooks::get().on_out_of_memory)();
    }

    rc
}

/// Returns a chunk of previously allocated memory to the heap.
pub fn free(addr: usize, bytes: usize) {
    let _gate = SwitchGuard::forbid();
    arch::with_kernel(|k| k.heap_mut().free(addr, bytes));
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = config::PAGE_BYTES;

    fn heap(pages: usize) -> Heap {
        Heap::new(vec![0u8; pages * PAGE].leak())
    }

    #[test]
    fn allocations_are_page_aligned_and_rounded() {
        let mut h = heap(16);
        let a = h.allocate(1, SearchStrategy::BottomUp).unwrap();
        assert_eq!(a.len, PAGE);
        let b = h.allocate(PAGE + 1, SearchStrategy::BottomUp).unwrap();
        assert_eq!(b.len, 2 * PAGE);
        assert_eq!((b.addr - a.addr) % PAGE, 0);
        assert_eq!(h.used_page_count(), 3);
    }

    #[test]
    fn zero_byte_requests_fail() {
        let mut h = heap(16);
        assert_eq!(h.allocate(0, SearchStrategy::BottomUp), None);
        assert_eq!(h.free_page_count(), 16);
    }

    #[test]
    fn allocate_free_round_trip_restores_map() {
        let mut h = heap(16);
        let a = h.allocate(3 * PAGE, SearchStrategy::BottomUp).unwrap();
        assert_eq!(h.used_page_count(), 3);
        h.free(a.addr, a.len);
        assert_eq!(h.used_page_count(), 0);
        // The same run is available again.
        let b = h.allocate(3 * PAGE, SearchStrategy::BottomUp).unwrap();
        assert_eq!(b, a);
    }

    #[test]
    fn top_down_avoids_middle_gap() {
        let mut h = heap(16);
        // Three single-page allocations from the bottom: pages 0, 1, 2.
        let a = h.allocate(PAGE, SearchStrategy::BottomUp).unwrap();
        let b = h.allocate(PAGE, SearchStrategy::BottomUp).unwrap();
        let c = h.allocate(PAGE, SearchStrategy::BottomUp).unwrap();
        assert_eq!(b.addr, a.addr + PAGE);
        assert_eq!(c.addr, b.addr + PAGE);

        // Free the middle one, then allocate downward: the new chunk must
        // come from the top free run, not the middle gap.
        h.free(b.addr, b.len);
        let d = h.allocate(PAGE, SearchStrategy::TopDown).unwrap();
        assert_eq!(d.addr, a.addr + 15 * PAGE);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut h = heap(4);
        assert!(h.allocate(4 * PAGE, SearchStrategy::BottomUp).is_some());
        assert_eq!(h.allocate(1, SearchStrategy::BottomUp), None);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mut h = heap(8);
        let a = h.allocate(2 * PAGE, SearchStrategy::BottomUp).unwrap();
        h.free(a.addr, a.len);
        h.free(a.addr, a.len);
        assert_eq!(h.free_page_count(), 8);
    }

    #[test]
    fn free_of_foreign_address_is_ignored() {
        let mut h = heap(8);
        let _ = h.allocate(PAGE, SearchStrategy::BottomUp).unwrap();
        h.free(0, PAGE);
        h.free(usize::MAX - 4096, PAGE);
        assert_eq!(h.used_page_count(), 1);
    }

    #[test]
    fn stacks_and_data_meet_in_the_middle() {
        let mut h = heap(16);
        let data = h.allocate(2 * PAGE, SearchStrategy::BottomUp).unwrap();
        let stack = h.allocate(2 * PAGE, SearchStrategy::TopDown).unwrap();
        assert!(stack.addr > data.addr);
        assert_eq!(stack.addr, data.addr + 14 * PAGE);
    }
}
