// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! Applications tune the kernel by editing these constants and rebuilding.
//! The `const _` assertions at the bottom keep obviously broken
//! combinations from compiling.

/// Size of one allocator page, in bytes. Must be a power of two.
pub const PAGE_BYTES: usize = 32;

/// Size of the kernel heap, in bytes. Stacks and general allocations both
/// come out of this.
pub const HEAP_BYTES: usize = 4096;

/// Number of pages the heap is divided into.
pub const SRAM_PAGES: usize = HEAP_BYTES / PAGE_BYTES;

/// Bytes of bitmap needed to track [`SRAM_PAGES`] pages.
pub const PAGE_MAP_BYTES: usize = SRAM_PAGES.div_ceil(8);

/// Maximum number of threads that can exist at once, including the idle
/// thread and the pool.
pub const MAX_THREADS: usize = 12;

/// Number of recyclable worker threads created at startup.
pub const POOL_THREADS: usize = 2;

/// Stack size of each pool thread, in bytes.
pub const POOL_THREAD_STACK_BYTES: usize = 192;

/// Stack size of the idle thread, in bytes. Bumped up to
/// [`MIN_STACK_BYTES`] like any other request.
pub const IDLE_STACK_BYTES: usize = 0;

/// Smallest stack the kernel will allocate. Requests below this are
/// rounded up silently.
pub const MIN_STACK_BYTES: usize = 128;

/// Scheduling quantum, in 1 ms timer ticks.
pub const QUANTUM_TICKS: u8 = 15;

const _: () = assert!(PAGE_BYTES.is_power_of_two());
const _: () = assert!(HEAP_BYTES % PAGE_BYTES == 0);
const _: () = assert!(SRAM_PAGES <= PAGE_MAP_BYTES * 8);
const _: () = assert!(QUANTUM_TICKS >= 2, "quantum must be two ticks or more");
const _: () = assert!(MAX_THREADS >= 2 && MAX_THREADS <= 250);
const _: () = assert!(POOL_THREADS + 1 < MAX_THREADS);
const _: () = assert!(POOL_THREAD_STACK_BYTES >= MIN_STACK_BYTES);
const _: () = assert!(
    POOL_THREADS * POOL_THREAD_STACK_BYTES < HEAP_BYTES,
    "thread pool consumes entire heap"
);
