// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads and their signals.
//!
//! A [`Tcb`] is the kernel's bookkeeping record for one thread: identity,
//! stack ownership, scheduling counters, list linkage, and the three signal
//! bitfields that drive all blocking and wake-up. The kernel owns the
//! control blocks; applications hold [`Thread`] handles, which carry a slot
//! index plus the id the slot had when the handle was minted. Every handle
//! operation re-checks that id, so a handle to a thread that has since
//! exited (or been recycled through the pool) quietly does nothing.
//!
//! Signal model, in brief: each thread owns a 16-bit signal space. Three
//! bits are reserved (`TIMEOUT`, `START`, `STOP`); the rest are allocated
//! from the thread, usually via [`crate::rendezvous::Rendezvous`]. A thread
//! blocks by `wait`ing on a mask of its own bits and is woken by any other
//! context posting one of those bits.

use core::ptr::NonNull;

use abi::{Duration, SignalSet, ThreadEntry, ThreadFlags, RESERVED_SIGNALS};

use crate::arch;
use crate::list::{Link, Queue};

/// Termination notification, snapshotted from a rendezvous when the thread
/// is created. Fired (id permitting) when the thread exits.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TermSignal {
    pub slot: u8,
    pub id: u16,
    pub bits: SignalSet,
}

/// A thread's externally visible lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
    /// On a ready list, will run when its turn comes.
    Ready,
    /// Currently executing.
    Running,
    /// Blocked waiting for signals, with or without a timeout.
    Waiting,
    /// Dormant in the thread pool.
    Stopped,
}

/// Thread control block.
///
/// Fields are private to the kernel so the invariants hold: `waiting` and
/// `current` never stray outside `allocated`, and the reserved bits are
/// always allocated.
pub struct Tcb {
    pub(crate) id: u16,
    pub(crate) name: Option<&'static str>,
    pub(crate) flags: ThreadFlags,

    pub(crate) stack_base: usize,
    pub(crate) stack_len: usize,
    pub(crate) sp: usize,
    pub(crate) low_sp: usize,

    pub(crate) ticks_remaining: u8,
    pub(crate) timeout_offset: u32,

    pub(crate) allocated: SignalSet,
    pub(crate) waiting: SignalSet,
    pub(crate) current: SignalSet,

    pub(crate) link: Link,
    pub(crate) queue: Option<Queue>,

    pub(crate) term: Option<TermSignal>,
    pub(crate) exit_to: Option<NonNull<i16>>,
}

impl Tcb {
    /// Makes a dormant control block owning the given stack region. It has
    /// no code and no identity until the kernel reanimates it.
    pub(crate) fn dormant(
        stack_base: usize,
        stack_len: usize,
        flags: ThreadFlags,
    ) -> Self {
        Self {
            id: 0,
            name: None,
            flags,
            stack_base,
            stack_len,
            sp: stack_base + stack_len,
            low_sp: stack_base + stack_len,
            ticks_remaining: 0,
            timeout_offset: 0,
            allocated: SignalSet::ALL_RESERVED,
            waiting: SignalSet::EMPTY,
            current: SignalSet::EMPTY,
            link: Link::default(),
            queue: None,
            term: None,
            exit_to: None,
        }
    }

    /// The thread's id. Ids are assigned monotonically and never reused
    /// until the 16-bit counter wraps.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The thread's name, if it was given one.
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Allocated size of the stack, in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_len
    }

    /// Peak recorded stack usage, in bytes. Only updated at context switch
    /// points, so short-lived excursions between switches go unseen.
    pub fn stack_peak_usage(&self) -> usize {
        self.stack_len
            .saturating_sub(self.low_sp.saturating_sub(self.stack_base))
    }

    fn try_allocate_signal(&mut self, n: u16) -> bool {
        let m = SignalSet::single(n);
        if m.is_empty() || self.allocated.intersects(m) {
            return false;
        }
        self.allocated |= m;
        true
    }

    /// Claims a signal bit. With `Some(n)` only that bit is tried; with
    /// `None` the lowest free user bit wins. Returns the single-bit mask,
    /// or the empty set if nothing was free.
    pub(crate) fn allocate_signal(
        &mut self,
        requested: Option<u16>,
    ) -> SignalSet {
        match requested {
            Some(n) => {
                if self.try_allocate_signal(n) {
                    SignalSet::single(n)
                } else {
                    SignalSet::EMPTY
                }
            }
            None => {
                // The reserved bits are allocated from birth, so the scan
                // can start above them.
                for n in RESERVED_SIGNALS..SignalSet::BITS {
                    if self.try_allocate_signal(n) {
                        return SignalSet::single(n);
                    }
                }
                SignalSet::EMPTY
            }
        }
    }

    /// Releases signal bits back to the thread, scrubbing them from all
    /// three fields. The reserved bits are silently exempt: passing them
    /// here neither errors nor frees them.
    pub(crate) fn free_signals(&mut self, sigs: SignalSet) {
        let to_free = sigs & !SignalSet::ALL_RESERVED;
        self.allocated &= !to_free;
        self.waiting &= !to_free;
        self.current &= !to_free;
    }

    /// The currently allocated signals, optionally excluding the reserved
    /// ones (`user_only` is how the termination path checks for leaks).
    pub fn allocated_signals(&self, user_only: bool) -> SignalSet {
        if user_only {
            self.allocated & !SignalSet::ALL_RESERVED
        } else {
            self.allocated
        }
    }

    /// The signals currently pending against this thread.
    pub fn current_signals(&self) -> SignalSet {
        self.current
    }

    /// The pending signals the thread is actually waiting for -- the ones
    /// that will (or did) wake it.
    pub(crate) fn active_signals(&self) -> SignalSet {
        self.current & self.waiting
    }

    /// Clears bits from the pending set, returning what remains.
    pub(crate) fn clear_signals(&mut self, sigs: SignalSet) -> SignalSet {
        self.current &= !sigs;
        self.current
    }

    /// Records incoming signal bits. Bits the thread never allocated are
    /// dropped on the floor.
    pub(crate) fn accept(&mut self, sigs: SignalSet) {
        self.current |= sigs & self.allocated;
    }

    /// Resets the signal state to its as-born condition: reserved bits
    /// allocated, nothing waiting, nothing pending.
    pub(crate) fn reset_signals(&mut self) {
        self.allocated = SignalSet::ALL_RESERVED;
        self.waiting = SignalSet::EMPTY;
        self.current = SignalSet::EMPTY;
    }
}

/// Handle to a thread.
///
/// Handles are freely copyable and may outlive their thread; operations on
/// a dead handle return empty/default results rather than touching whatever
/// now occupies the slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Thread {
    pub(crate) slot: u8,
    pub(crate) id: u16,
}

impl Thread {
    /// Creates a thread and makes it eligible to run (given
    /// [`ThreadFlags::READY`]).
    ///
    /// The stack is carved from the top of the heap, rounded up to at least
    /// the configured minimum. `term`, if given, is signalled when the
    /// thread exits. `exit_to`, if given, receives the entry function's
    /// return value at exit; the caller must keep that location alive until
    /// then.
    ///
    /// Returns `None` when the heap or the thread table is exhausted.
    pub fn spawn(
        name: Option<&'static str>,
        stack_bytes: usize,
        entry: ThreadEntry,
        flags: ThreadFlags,
        term: Option<&crate::rendezvous::Rendezvous>,
        exit_to: Option<NonNull<i16>>,
    ) -> Option<Thread> {
        let term = term.map(|r| r.term_signal());
        arch::with_kernel(|k| {
            k.create_thread(name, stack_bytes, Some(entry), flags, term, exit_to)
        })
    }

    /// Takes a dormant thread from the pool and reanimates it with new
    /// code. The thread is placed at the head of the active ready list, so
    /// it runs promptly. Returns `None` if the pool is empty.
    pub fn from_pool(
        name: Option<&'static str>,
        entry: ThreadEntry,
        term: Option<&crate::rendezvous::Rendezvous>,
        exit_to: Option<NonNull<i16>>,
    ) -> Option<Thread> {
        let term = term.map(|r| r.term_signal());
        arch::with_kernel(|k| k.thread_from_pool(name, entry, term, exit_to))
    }

    /// The currently executing thread. `None` only before the kernel has
    /// scheduled anything.
    pub fn current() -> Option<Thread> {
        arch::with_kernel(|k| {
            let ix = k.current_index()?;
            Some(Thread {
                slot: ix,
                id: k.tcb(ix)?.id,
            })
        })
    }

    /// Milliseconds since the kernel started. Wraps after about 49 days.
    pub fn now() -> u32 {
        arch::with_kernel(|k| k.now())
    }

    /// Disables context switching. Interrupts still run; only the
    /// scheduler is held off.
    pub fn forbid() {
        arch::with_kernel(|k| k.forbid());
    }

    /// Re-enables context switching.
    pub fn permit() {
        arch::with_kernel(|k| k.permit());
    }

    /// Determines whether context switching is currently enabled.
    pub fn is_switching_enabled() -> bool {
        arch::with_kernel(|k| k.is_switching_enabled())
    }

    /// Runs `f` on this thread's control block if the handle is still
    /// current, otherwise returns `default`.
    fn with_live<R>(
        &self,
        default: R,
        f: impl FnOnce(&mut crate::kernel::Kernel, u8) -> R,
    ) -> R {
        let (slot, id) = (self.slot, self.id);
        arch::with_kernel(|k| {
            if k.tcb(slot).is_some_and(|t| t.id == id) {
                f(k, slot)
            } else {
                default
            }
        })
    }

    /// The id this handle was minted with.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The thread's name. `None` if unnamed or if the thread is gone.
    pub fn name(&self) -> Option<&'static str> {
        self.with_live(None, |k, ix| k.tcb(ix).and_then(|t| t.name()))
    }

    /// The thread's lifecycle state, or `None` if the thread is gone.
    pub fn status(&self) -> Option<ThreadStatus> {
        self.with_live(None, |k, ix| Some(k.status_of(ix)))
    }

    /// Allocated stack size in bytes; 0 if the thread is gone.
    pub fn stack_size(&self) -> usize {
        self.with_live(0, |k, ix| {
            k.tcb(ix).map_or(0, |t| t.stack_size())
        })
    }

    /// Peak stack usage in bytes; 0 if the thread is gone.
    pub fn stack_peak_usage(&self) -> usize {
        self.with_live(0, |k, ix| {
            k.tcb(ix).map_or(0, |t| t.stack_peak_usage())
        })
    }

    /// Signals allocated to the thread.
    pub fn allocated_signals(&self, user_only: bool) -> SignalSet {
        self.with_live(SignalSet::EMPTY, |k, ix| {
            k.tcb(ix)
                .map_or(SignalSet::EMPTY, |t| t.allocated_signals(user_only))
        })
    }

    /// Signals currently pending against the thread.
    pub fn current_signals(&self) -> SignalSet {
        self.with_live(SignalSet::EMPTY, |k, ix| {
            k.tcb(ix).map_or(SignalSet::EMPTY, |t| t.current_signals())
        })
    }

    /// Clears pending signals, returning the ones still set afterwards.
    pub fn clear_signals(&self, sigs: SignalSet) -> SignalSet {
        self.with_live(SignalSet::EMPTY, |k, ix| k.clear_signals(ix, sigs))
    }

    /// Posts signals to the thread, waking it if it is waiting for any of
    /// them. Safe to call from interrupt context.
    pub fn signal(&self, sigs: SignalSet) {
        self.with_live((), |k, ix| k.post(ix, sigs));
    }

    /// Waits for any of `sigs` to be posted to this thread, blocking if
    /// none is pending. Returns the subset that woke the thread, with
    /// those bits cleared from the pending set.
    ///
    /// A non-zero `timeout` arms the reserved `TIMEOUT` signal; if the
    /// timeout fires first, `TIMEOUT` is what comes back.
    ///
    /// A thread may wait only on itself: called on any handle other than
    /// the current thread, this returns the empty set immediately.
    pub fn wait(&self, sigs: SignalSet, timeout: Duration) -> SignalSet {
        // The check, the wait bookkeeping, and the context switch must be
        // one uninterrupted sequence or a signal arriving in between would
        // be missed. The switched-to thread's restored state re-enables
        // interrupts.
        unsafe { arch::interrupts_off() };
        let k = unsafe { arch::kernel() };

        let live = k.current_index() == Some(self.slot)
            && k.tcb(self.slot).is_some_and(|t| t.id == self.id);
        if !live {
            unsafe { arch::interrupts_on() };
            return SignalSet::EMPTY;
        }

        match k.begin_wait(sigs, timeout) {
            Some(bits) => {
                unsafe { arch::interrupts_on() };
                bits
            }
            None => {
                arch::yield_now();

                // Back from the blocking switch; harvest what woke us.
                unsafe { arch::interrupts_off() };
                let bits = unsafe { arch::kernel() }.finish_wait();
                unsafe { arch::interrupts_on() };
                bits
            }
        }
    }

    /// Blocks the current thread for `dur`. Equivalent to waiting on no
    /// signals but the timeout.
    pub fn delay(&self, dur: Duration) {
        let _ = self.wait(SignalSet::EMPTY, dur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dormant_tcb_has_reserved_signals_only() {
        let t = Tcb::dormant(0x100, 256, ThreadFlags::POOL_THREAD);
        assert_eq!(t.allocated_signals(false), SignalSet::ALL_RESERVED);
        assert_eq!(t.allocated_signals(true), SignalSet::EMPTY);
        assert_eq!(t.current_signals(), SignalSet::EMPTY);
        assert_eq!(t.stack_size(), 256);
        assert_eq!(t.stack_peak_usage(), 0);
    }

    #[test]
    fn signal_allocation_starts_above_reserved() {
        let mut t = Tcb::dormant(0, 0, ThreadFlags::empty());
        let first = t.allocate_signal(None);
        assert_eq!(first, SignalSet::single(RESERVED_SIGNALS));
        let second = t.allocate_signal(None);
        assert_eq!(second, SignalSet::single(RESERVED_SIGNALS + 1));
        assert!(t.allocated_signals(true).contains(first | second));
    }

    #[test]
    fn specific_signal_allocation() {
        let mut t = Tcb::dormant(0, 0, ThreadFlags::empty());
        assert_eq!(t.allocate_signal(Some(9)), SignalSet::single(9));
        // Taken now, reserved always taken, out-of-range never works.
        assert_eq!(t.allocate_signal(Some(9)), SignalSet::EMPTY);
        assert_eq!(t.allocate_signal(Some(0)), SignalSet::EMPTY);
        assert_eq!(t.allocate_signal(Some(16)), SignalSet::EMPTY);
    }

    #[test]
    fn allocation_exhaustion_returns_empty() {
        let mut t = Tcb::dormant(0, 0, ThreadFlags::empty());
        for _ in RESERVED_SIGNALS..SignalSet::BITS {
            assert!(!t.allocate_signal(None).is_empty());
        }
        assert_eq!(t.allocate_signal(None), SignalSet::EMPTY);
    }

    #[test]
    fn free_signals_scrubs_all_fields_but_spares_reserved() {
        let mut t = Tcb::dormant(0, 0, ThreadFlags::empty());
        let m = t.allocate_signal(None);
        t.accept(m);
        t.waiting = m | SignalSet::TIMEOUT;

        t.free_signals(m | SignalSet::ALL_RESERVED);
        assert_eq!(t.allocated_signals(false), SignalSet::ALL_RESERVED);
        assert_eq!(t.current_signals(), SignalSet::EMPTY);
        assert_eq!(t.waiting, SignalSet::TIMEOUT);
    }

    #[test]
    fn accept_masks_unallocated_bits() {
        let mut t = Tcb::dormant(0, 0, ThreadFlags::empty());
        let m = t.allocate_signal(None);
        t.accept(m | SignalSet::single(12));
        assert_eq!(t.current_signals(), m);
    }

    #[test]
    fn peak_usage_tracks_low_water_mark() {
        let mut t = Tcb::dormant(0x200, 256, ThreadFlags::empty());
        t.sp = 0x200 + 256 - 40;
        t.low_sp = t.sp;
        assert_eq!(t.stack_peak_usage(), 40);
        t.low_sp = 0x200 + 10;
        assert_eq!(t.stack_peak_usage(), 246);
        // Past the base: saturates at the full stack size.
        t.low_sp = 0x1F0;
        assert_eq!(t.stack_peak_usage(), 256);
    }
}
