// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power, sleep, and device reset.
//!
//! The reset-cause flags are cumulative across resets in hardware, so
//! [`Power::init`] captures and clears them once at boot; everything after
//! that reads the cached copy.

use bitflags::bitflags;

use crate::arch;
use crate::hooks;

bitflags! {
    /// Why the MCU last reset.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ResetFlags: u8 {
        const POWER_ON = 1 << 0;
        const EXTERNAL = 1 << 1;
        const BROWNOUT = 1 << 2;
        const WATCHDOG = 1 << 3;
        const JTAG = 1 << 4;
    }
}

/// Hardware sleep depths, shallowest first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SleepMode {
    Idle,
    AdcNoiseReduction,
    PowerDown,
    PowerSave,
    Standby,
    ExtendedStandby,
}

static mut RESET_FLAGS: ResetFlags = ResetFlags::empty();
static mut ALLOW_SLEEP: bool = true;

/// Power management entry points.
pub struct Power;

impl Power {
    /// Captures the reset cause and runs the application's `on_reset`
    /// hook. A `false` from the hook tells startup to shut the device
    /// down instead of booting.
    pub(crate) fn init() -> bool {
        let flags = arch::take_reset_flags();
        unsafe {
            *core::ptr::addr_of_mut!(RESET_FLAGS) = flags;
        }
        (hooks::get().on_reset)(flags)
    }

    /// The cause of the last reset, as captured at boot.
    pub fn reset_flags() -> ResetFlags {
        unsafe { *core::ptr::addr_of!(RESET_FLAGS) }
    }

    /// Allows the MCU to sleep when asked.
    pub fn allow_sleep() {
        unsafe {
            *core::ptr::addr_of_mut!(ALLOW_SLEEP) = true;
        }
    }

    /// Prevents the MCU from entering a sleep mode when asked.
    pub fn prevent_sleep() {
        unsafe {
            *core::ptr::addr_of_mut!(ALLOW_SLEEP) = false;
        }
    }

    /// Determines if sleeping is currently allowed.
    pub fn is_sleep_enabled() -> bool {
        unsafe { *core::ptr::addr_of!(ALLOW_SLEEP) }
    }

    /// Puts the MCU to sleep until the next wake-capable interrupt.
    ///
    /// `force` overrides the sleep gate; `silent` skips the `on_sleep`
    /// hook.
    pub fn sleep(mode: SleepMode, force: bool, silent: bool) {
        if !Self::is_sleep_enabled() && !force {
            return;
        }
        if !silent {
            (hooks::get().on_sleep)(mode);
        }
        arch::sleep(mode);
    }

    /// Shallow sleep until the next interrupt: the idle thread's one move.
    pub fn idle() {
        Self::sleep(SleepMode::Idle, true, true);
    }

    /// Deep sleep. With `force`, sleeps even when sleeping is prevented;
    /// waking requires a hardware reset.
    pub fn shutdown(force: bool, silent: bool) {
        Self::sleep(SleepMode::PowerDown, force, silent);
    }
}

/// The built-in idle thread: sleep shallowly, forever. Applications swap
/// this out via [`crate::hooks::Hooks::idle_entry`].
pub(crate) fn default_idle_entry() -> i16 {
    loop {
        Power::idle();
    }
}
