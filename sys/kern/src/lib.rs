// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! atto kernel.
//!
//! This is a preemptive multitasking microkernel for 8-bit AVR parts: a few
//! kilobytes of data RAM, a single hardware stack pointer, and a 1 kHz timer
//! heartbeat. There is no host operating system and no memory protection --
//! threads are cooperating peers that share one address space.
//!
//! The pieces, leaf-first:
//!
//! - [`pagemap`]/[`heap`]: a bitmap page allocator serving both thread
//!   stacks and general allocations, with selectable search direction so
//!   stacks grow down from the top of the heap while data fills from the
//!   bottom.
//! - [`list`]: intrusive doubly-linked lists over the thread table, plus
//!   the delta-offset variant used to order sleeping threads.
//! - [`thread`]: thread control blocks, the per-thread signal bitfields
//!   that are the kernel's only blocking primitive, and the public thread
//!   API.
//! - [`kernel`]: the process-wide state -- dual ready lists, timeout list,
//!   current thread, millisecond clock -- and the scheduler's tick and
//!   yield paths.
//! - [`rendezvous`]: an owned binding of one thread to one signal bit, the
//!   "event" handle drivers hand around.
//! - [`arch`]: everything that touches bytes-on-the-stack or machine
//!   registers. All synthetic stack frame construction lives behind this
//!   one boundary; the `hosted` backend stands in for the hardware so the
//!   rest of the kernel runs (and is tested) on a development machine.
//!
//! # Design principles
//!
//! 1. Static configuration: table sizes, the heap, and the thread pool are
//!    fixed at compile time in [`config`].
//! 2. Threads are named by stable slot indices; public handles carry an id
//!    that is checked before use, so a stale handle degrades to a no-op
//!    rather than reaching into a recycled slot.
//! 3. User mistakes come back as empty results. Panics are reserved for
//!    kernel-table corruption.

#![cfg_attr(not(test), no_std)]

/// Kernel-internal assertion for invariants whose violation means the
/// kernel's own tables are corrupt.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel invariant violated");
        }
    };
}

pub mod arch;

pub mod config;
pub mod heap;
pub mod hooks;
pub mod kernel;
pub mod pagemap;
pub mod power;
pub mod rendezvous;
pub mod resource;
pub mod startup;
pub mod thread;

mod list;
