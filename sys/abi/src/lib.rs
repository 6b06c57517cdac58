// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in here is deliberately small and `Copy`: these types cross
//! the boundary between kernel internals and application code, and on an
//! 8-bit target we want them to cost exactly what they look like they cost.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

/// Signature of a thread's entry function: no arguments, returns a small
/// signed exit code.
pub type ThreadEntry = fn() -> i16;

/// Number of signal bits reserved by the kernel. User-allocatable signal
/// numbers start at this index.
pub const RESERVED_SIGNALS: u16 = 3;

/// A set of per-thread signal bits.
///
/// Each thread owns an independent 16-bit signal space. The three
/// lowest-numbered bits are reserved from birth ([`SignalSet::TIMEOUT`],
/// [`SignalSet::START`], [`SignalSet::STOP`]) and cannot be freed; the rest
/// are handed out by the thread's signal allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct SignalSet(pub u16);

impl SignalSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Delivered when a `wait` times out.
    pub const TIMEOUT: Self = Self(1 << 0);

    /// Delivered when a service-style thread is asked to (re)start.
    pub const START: Self = Self(1 << 1);

    /// Delivered when a service-style thread is asked to stop.
    pub const STOP: Self = Self(1 << 2);

    /// All reserved signals.
    pub const ALL_RESERVED: Self =
        Self(Self::TIMEOUT.0 | Self::START.0 | Self::STOP.0);

    /// Total number of signal bits in a thread's signal space.
    pub const BITS: u16 = u16::BITS as u16;

    /// Makes a single-bit set for signal number `n`, or the empty set if
    /// `n` is out of range.
    pub const fn single(n: u16) -> Self {
        if n < Self::BITS {
            Self(1 << n)
        } else {
            Self::EMPTY
        }
    }

    /// Checks whether no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Checks whether every bit of `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Checks whether `self` and `other` share at least one bit.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for SignalSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for SignalSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for SignalSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::BitAndAssign for SignalSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl core::ops::Not for SignalSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

bitflags! {
    /// Flags controlling a thread's creation-time behavior.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct ThreadFlags: u16 {
        /// The thread should be eligible to run as soon as it exists.
        const READY = 1 << 0;
        /// The thread belongs to the recyclable worker pool.
        const POOL_THREAD = 1 << 1;
    }
}

/// A span of time, counted in milliseconds.
///
/// The kernel's clock is a free-running 32-bit millisecond counter, so a
/// `Duration` tops out a little past 49 days -- the same horizon as the
/// clock's wrap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Duration(u32);

impl Duration {
    /// A zero-length duration; `wait` treats this as "no timeout".
    pub const ZERO: Self = Self(0);

    pub const fn from_millis(ms: u32) -> Self {
        Self(ms)
    }

    pub const fn from_secs(s: u32) -> Self {
        Self(s * 1_000)
    }

    pub const fn from_mins(m: u32) -> Self {
        Self(m * 60 * 1_000)
    }

    pub const fn from_hours(h: u32) -> Self {
        Self(h * 60 * 60 * 1_000)
    }

    pub const fn from_days(d: u32) -> Self {
        Self(d * 24 * 60 * 60 * 1_000)
    }

    pub const fn from_weeks(w: u32) -> Self {
        Self(w * 7 * 24 * 60 * 60 * 1_000)
    }

    /// The number of milliseconds this duration represents.
    pub const fn as_millis(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<Duration> for u32 {
    fn from(d: Duration) -> Self {
        d.0
    }
}

/// Literal-flavored `Duration` constructors, so call sites can read
/// `delay(500.ms())` or `wait(sigs, 2.secs())`.
pub trait DurationExt {
    fn ms(self) -> Duration;
    fn secs(self) -> Duration;
    fn mins(self) -> Duration;
    fn hrs(self) -> Duration;
    fn days(self) -> Duration;
    fn wks(self) -> Duration;
}

impl DurationExt for u32 {
    fn ms(self) -> Duration {
        Duration::from_millis(self)
    }

    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn mins(self) -> Duration {
        Duration::from_mins(self)
    }

    fn hrs(self) -> Duration {
        Duration::from_hours(self)
    }

    fn days(self) -> Duration {
        Duration::from_days(self)
    }

    fn wks(self) -> Duration {
        Duration::from_weeks(self)
    }
}
