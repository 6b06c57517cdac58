// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! An application's reset path does whatever board setup it needs, calls
//! [`crate::hooks::install`] if it has hooks, and then hands control here
//! for good.

use core::mem::MaybeUninit;

use abi::ThreadFlags;

use crate::arch;
use crate::config;
use crate::hooks;
use crate::kernel::Kernel;
use crate::power::Power;
use crate::resource::ResourceId;

/// Backing store for the heap. Page-aligned so the first page's address
/// is as natural as the rest.
#[repr(align(64))]
struct Arena(MaybeUninit<[u8; config::HEAP_BYTES]>);

static mut HEAP_ARENA: Arena = Arena(MaybeUninit::uninit());
static mut KERNEL: MaybeUninit<Kernel> = MaybeUninit::uninit();

/// Brings the kernel up and never returns: builds the singleton, creates
/// the idle thread and the worker pool, claims the tick timer, and enters
/// the first thread.
///
/// If the application's `on_reset` hook declines to boot, the device goes
/// into deep sleep instead, and stays there until hardware reset.
///
/// # Safety
///
/// Call exactly once per boot, with interrupts disabled, before any other
/// kernel API.
pub unsafe fn start_kernel() -> ! {
    if !Power::init() {
        loop {
            Power::shutdown(true, false);
        }
    }

    // Safety: single boot-time execution; nothing else references these
    // statics yet.
    let kernel = unsafe {
        let arena = (*core::ptr::addr_of_mut!(HEAP_ARENA))
            .0
            .write([0; config::HEAP_BYTES]);
        (*core::ptr::addr_of_mut!(KERNEL)).write(Kernel::new(arena))
    };
    arch::install_kernel(kernel);

    arch::with_kernel(|k| {
        let idle = k.create_thread(
            Some("idle"),
            config::IDLE_STACK_BYTES,
            Some(hooks::get().idle_entry),
            ThreadFlags::empty(),
            None,
            None,
        );
        k.set_idle(idle.map(|t| t.slot));

        for _ in 0..config::POOL_THREADS {
            let _ = k.create_thread(
                None,
                config::POOL_THREAD_STACK_BYTES,
                None,
                ThreadFlags::POOL_THREAD,
                None,
                None,
            );
        }

        // The heartbeat timer belongs to the kernel; claim it before any
        // driver can.
        let _ = k.obtain_resource(ResourceId::Timer0);
    });

    arch::start_tick_timer();
    arch::start_first_thread()
}
