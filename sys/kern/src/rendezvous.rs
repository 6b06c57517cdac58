// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendezvous handles.
//!
//! A [`Rendezvous`] is the kernel's abstract "event": an owned binding of
//! one thread to one of that thread's signal bits. Construction allocates a
//! fresh bit from the *currently executing* thread; drop gives it back.
//! Drivers hand the rendezvous to whatever will produce the event (an ISR,
//! another thread, a thread-termination notification) and then `wait` on
//! it.
//!
//! The handle is deliberately not `Clone`: exactly one owner is
//! responsible for the bit's lifetime. A rendezvous that outlives its
//! thread is a user bug; the thread-termination path checks for leaked
//! user bits on pool threads, and every operation here re-validates the
//! owning thread's id, so the stale handle degrades to a no-op rather than
//! signalling whoever lives in the slot next.

use abi::{Duration, SignalSet};

use crate::arch;
use crate::thread::{TermSignal, Thread};

/// An owned (thread, signal-bit) binding. See the module docs.
#[derive(Debug)]
pub struct Rendezvous {
    slot: u8,
    id: u16,
    bits: SignalSet,
}

impl Rendezvous {
    /// Allocates a fresh signal bit from the current thread and binds it.
    ///
    /// Returns `None` if nothing is running yet or the thread's signal
    /// space is exhausted.
    pub fn new() -> Option<Self> {
        arch::with_kernel(|k| {
            let slot = k.current_index()?;
            let t = k.tcb_mut(slot)?;
            let id = t.id();
            let bits = t.allocate_signal(None);
            if bits.is_empty() {
                return None;
            }
            Some(Self { slot, id, bits })
        })
    }

    /// The signal bit(s) this rendezvous represents, for composing into a
    /// larger `wait` mask.
    pub fn mask(&self) -> SignalSet {
        self.bits
    }

    /// Owning thread as a handle.
    fn thread(&self) -> Thread {
        Thread {
            slot: self.slot,
            id: self.id,
        }
    }

    /// Signals the owning thread. Callable from any context, including
    /// interrupts.
    pub fn signal(&self) {
        self.thread().signal(self.bits);
    }

    /// Clears just this rendezvous' bit from the owning thread's pending
    /// signals.
    pub fn clear_signals(&self) {
        let _ = self.thread().clear_signals(self.bits);
    }

    /// Waits for this rendezvous to be signalled. Callable only by the
    /// owning thread; anyone else gets the empty set straight back.
    pub fn wait(&self, timeout: Duration) -> SignalSet {
        self.thread().wait(self.bits, timeout)
    }

    /// Snapshot used to fire this rendezvous when a spawned thread
    /// terminates.
    pub(crate) fn term_signal(&self) -> TermSignal {
        TermSignal {
            slot: self.slot,
            id: self.id,
            bits: self.bits,
        }
    }
}

impl From<&Rendezvous> for SignalSet {
    fn from(r: &Rendezvous) -> Self {
        r.mask()
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        let (slot, id, bits) = (self.slot, self.id, self.bits);
        arch::with_kernel(|k| {
            if let Some(t) = k.tcb_mut(slot) {
                if t.id() == id {
                    t.free_signals(bits);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::kernel::{Kernel, SwitchDecision};
    use abi::{DurationExt, ThreadFlags};

    fn nop_entry() -> i16 {
        0
    }

    /// Installs a fresh kernel with an idle thread and one running thread,
    /// returning the running thread's slot.
    fn install() -> u8 {
        let k = Box::leak(Box::new(Kernel::new(
            vec![0u8; 64 * config::PAGE_BYTES].leak(),
        )));
        let idle = k
            .create_thread(
                Some("idle"),
                0,
                Some(nop_entry),
                ThreadFlags::empty(),
                None,
                None,
            )
            .unwrap();
        k.set_idle(Some(idle.slot));
        let a = k
            .create_thread(
                Some("a"),
                config::MIN_STACK_BYTES,
                Some(nop_entry),
                ThreadFlags::READY,
                None,
                None,
            )
            .unwrap();
        if let SwitchDecision::Preempt = k.tick_preempt() {
            let _ = k.preempt_commit(0);
        }
        assert_eq!(k.current_index(), Some(a.slot));
        arch::install_kernel(k);
        a.slot
    }

    #[test]
    fn binds_a_fresh_bit_and_frees_on_drop() {
        let slot = install();

        let r1 = Rendezvous::new().unwrap();
        let r2 = Rendezvous::new().unwrap();
        assert_ne!(r1.mask(), r2.mask());
        assert!(!r1.mask().intersects(SignalSet::ALL_RESERVED));

        let allocated = arch::with_kernel(|k| {
            k.tcb(slot).unwrap().allocated_signals(true)
        });
        assert_eq!(allocated, r1.mask() | r2.mask());

        drop(r1);
        drop(r2);
        let allocated = arch::with_kernel(|k| {
            k.tcb(slot).unwrap().allocated_signals(true)
        });
        assert!(allocated.is_empty());
    }

    #[test]
    fn signal_then_wait_completes_without_blocking() {
        let _slot = install();

        let r = Rendezvous::new().unwrap();
        r.signal();
        assert_eq!(r.wait(Duration::ZERO), r.mask());
        // Consumed: nothing pending anymore.
        assert_eq!(Thread::current().unwrap().current_signals(), SignalSet::EMPTY);
    }

    #[test]
    fn clear_signals_discards_a_pending_event() {
        let slot = install();

        let r = Rendezvous::new().unwrap();
        r.signal();
        r.clear_signals();
        let pending =
            arch::with_kernel(|k| k.tcb(slot).unwrap().current_signals());
        assert!(pending.is_empty());
    }

    #[test]
    fn wait_by_non_owner_returns_empty() {
        let _slot = install();

        let r = Rendezvous::new().unwrap();
        r.signal();

        // Fake a context switch away from the owner.
        arch::with_kernel(|k| {
            let sp = k
                .current_index()
                .and_then(|c| k.tcb(c))
                .map_or(0, |t| t.sp);
            let _ = k.yield_commit(sp);
        });
        assert_eq!(r.wait(100.ms()), SignalSet::EMPTY);
    }

    #[test]
    fn stale_handle_is_inert_after_thread_exit() {
        let slot = install();

        let r = Rendezvous::new().unwrap();
        arch::with_kernel(|k| {
            k.terminate_current(0);
            let _ = k.yield_commit(0);
            assert!(k.tcb(slot).is_none());
        });

        // The owning thread is gone; none of these may touch the slot.
        r.signal();
        r.clear_signals();
        assert_eq!(r.wait(Duration::ZERO), SignalSet::EMPTY);
        drop(r);
    }

    #[test]
    fn exhaustion_of_signal_space_fails_construction() {
        let _slot = install();

        let mut held = Vec::new();
        while let Some(r) = Rendezvous::new() {
            held.push(r);
            assert!(held.len() <= 16);
        }
        assert_eq!(held.len(), usize::from(SignalSet::BITS - abi::RESERVED_SIGNALS));
    }
}
