// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-overridable kernel hooks.
//!
//! The kernel reports interesting moments through a table of plain
//! function pointers. Every entry defaults to a no-op (or, for
//! [`Hooks::on_reset`], "carry on"); an application that wants logging,
//! restart-on-overflow policy, or a custom idle loop installs its own
//! table once, before starting the kernel.

use abi::ThreadEntry;

use crate::power::{ResetFlags, SleepMode};
use crate::thread::Tcb;

/// The hook table.
#[derive(Copy, Clone)]
pub struct Hooks {
    /// Called before kernel init with the cause of the reset. Returning
    /// `false` sends the device into deep sleep instead of booting.
    pub on_reset: fn(ResetFlags) -> bool,
    /// Called before any non-silent sleep attempt.
    pub on_sleep: fn(SleepMode),
    /// Called when an allocation cannot be satisfied.
    pub on_out_of_memory: fn(),
    /// Called as each thread terminates, with its exit code.
    pub on_thread_exit: fn(&Tcb, i16),
    /// Called when a context save finds a thread's stack blown. Runs on
    /// the kernel stack; the thread's stack is presumed ruined.
    pub on_stack_overflow: fn(&Tcb),
    /// Entry function for the idle thread, replacing the built-in
    /// sleep-until-interrupt loop.
    pub idle_entry: ThreadEntry,
}

fn default_on_reset(_: ResetFlags) -> bool {
    true
}

fn default_on_sleep(_: SleepMode) {}

fn default_on_out_of_memory() {}

fn default_on_thread_exit(_: &Tcb, _: i16) {}

fn default_on_stack_overflow(_: &Tcb) {}

impl Hooks {
    pub const DEFAULT: Hooks = Hooks {
        on_reset: default_on_reset,
        on_sleep: default_on_sleep,
        on_out_of_memory: default_on_out_of_memory,
        on_thread_exit: default_on_thread_exit,
        on_stack_overflow: default_on_stack_overflow,
        idle_entry: crate::power::default_idle_entry,
    };
}

impl Default for Hooks {
    fn default() -> Self {
        Self::DEFAULT
    }
}

static mut HOOKS: Hooks = Hooks::DEFAULT;

/// Installs the application's hook table.
///
/// # Safety
///
/// Must happen before `start_kernel` enables interrupts; installing later
/// races against ISRs already reading the table.
pub unsafe fn install(hooks: Hooks) {
    unsafe {
        *core::ptr::addr_of_mut!(HOOKS) = hooks;
    }
}

/// The live hook table.
pub(crate) fn get() -> &'static Hooks {
    // Safety: writes only happen before the kernel starts.
    unsafe { &*core::ptr::addr_of!(HOOKS) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::config;
    use crate::heap;
    use crate::kernel::Kernel;
    use crate::pagemap::SearchStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static OOM_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn counting_oom() {
        OOM_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn out_of_memory_hook_fires_on_failed_allocation() {
        unsafe {
            install(Hooks {
                on_out_of_memory: counting_oom,
                ..Hooks::DEFAULT
            });
        }

        let k = Box::leak(Box::new(Kernel::new(
            vec![0u8; 2 * config::PAGE_BYTES].leak(),
        )));
        arch::install_kernel(k);

        assert!(heap::allocate(
            10 * config::PAGE_BYTES,
            SearchStrategy::BottomUp
        )
        .is_none());
        assert!(OOM_COUNT.load(Ordering::Relaxed) >= 1);

        unsafe { install(Hooks::DEFAULT) };
    }
}
