// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! Used whenever the kernel is built for anything that isn't an AVR --
//! which in practice means unit tests and `cargo check` on a development
//! machine. There is no real context switching here: attempting to enter a
//! thread panics. Tests drive the scheduler through the kernel's own
//! tick/commit entry points instead.
//!
//! Under test the installed-kernel pointer is thread-local, so the test
//! harness can run many kernels in parallel, one per test thread.

use abi::{ThreadEntry, ThreadFlags};

use crate::kernel::Kernel;
use crate::power::{ResetFlags, SleepMode};

use super::FrameLayout;

/// Frame shape used for synthetic stacks on the hosted backend. Matches
/// the AVR layout (minus any extended address register) so frame-building
/// arithmetic gets exercised realistically.
pub const LAYOUT: FrameLayout = FrameLayout {
    pc_bytes: 2,
    register_slots: 32,
    extra_slots: 1,
    param_offsets: [24, 26, 28, 30, 2, 4, 6, 8, 10],
};

/// Builds the synthetic initial frame for a new thread. The springboard
/// address is a dummy; nothing ever jumps through a hosted frame.
pub(crate) fn prepare_stack_frame(
    stack: &mut [u8],
    slot: u8,
    entry: ThreadEntry,
    flags: ThreadFlags,
) -> usize {
    super::build_initial_frame(
        stack,
        &LAYOUT,
        0,
        slot,
        entry as usize,
        flags.bits(),
    )
}

#[cfg(test)]
std::thread_local! {
    static KERNEL: core::cell::Cell<*mut Kernel> =
        const { core::cell::Cell::new(core::ptr::null_mut()) };
}

#[cfg(not(test))]
static mut KERNEL: *mut Kernel = core::ptr::null_mut();

/// Installs the kernel singleton for this context.
pub fn install_kernel(k: &'static mut Kernel) {
    let p: *mut Kernel = k;
    #[cfg(test)]
    KERNEL.with(|cell| cell.set(p));
    #[cfg(not(test))]
    unsafe {
        KERNEL = p;
    }
}

/// Produces the installed kernel.
///
/// # Safety
///
/// The caller must be the only execution context touching the kernel; on
/// hardware that means interrupts are masked. The hosted backend is
/// single-threaded per test, so exclusivity holds trivially, but the
/// returned borrow must still not be held across a call that re-enters
/// the kernel.
pub unsafe fn kernel() -> &'static mut Kernel {
    #[cfg(test)]
    let p = KERNEL.with(|cell| cell.get());
    #[cfg(not(test))]
    let p = unsafe { KERNEL };

    if p.is_null() {
        panic!("kernel not installed");
    }
    unsafe { &mut *p }
}

/// Runs `f` with exclusive access to the kernel.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    // No interrupts to mask here.
    f(unsafe { kernel() })
}

/// Masks interrupts. Nothing to do on the hosted backend.
///
/// # Safety
///
/// Matches the AVR contract; no requirements here.
pub unsafe fn interrupts_off() {}

/// Unmasks interrupts. Nothing to do on the hosted backend.
///
/// # Safety
///
/// Matches the AVR contract; no requirements here.
pub unsafe fn interrupts_on() {}

/// A real backend would save this context and restore the next thread's.
/// The hosted backend has no contexts to switch.
pub fn yield_now() {
    panic!("context switch attempted on the hosted backend");
}

/// Runs `f` on "the kernel stack". The hosted backend just runs it.
pub(crate) fn on_kernel_stack(f: impl FnOnce()) {
    f();
}

/// Reset cause of the current boot. A hosted process didn't reset.
pub(crate) fn take_reset_flags() -> ResetFlags {
    ResetFlags::empty()
}

/// Sleeps the CPU. The hosted backend has nothing to sleep.
pub(crate) fn sleep(_mode: SleepMode) {}

/// Starts the 1 ms heartbeat. Hosted tests advance time by hand.
pub fn start_tick_timer() {}

/// Hands the CPU to the first thread.
pub fn start_first_thread() -> ! {
    panic!("entering threads is not supported on the hosted backend");
}
