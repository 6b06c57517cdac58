// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide kernel state and the scheduler.
//!
//! There is exactly one [`Kernel`] per device, owning the thread table, the
//! heap, the two ready lists, the timeout list, the pool list, the
//! millisecond clock, and the context-switch gate. The architecture layer
//! installs it at startup and hands out short exclusive borrows with
//! interrupts masked (see [`crate::arch`]).
//!
//! # Scheduling
//!
//! Round-robin over the two ready lists. The running thread sits at (or
//! near) the head of the *active* list; when its quantum expires it moves
//! to the tail of the *expired* list, and when the active list drains the
//! two lists swap roles with a single index flip. The idle thread is not on
//! either list and runs only when both are empty.
//!
//! A woken thread is prepended to the active list, and the tick handler
//! forces the current thread's quantum to zero whenever it finds the
//! current thread no longer at the head. The effect is a soft
//! "most-recently-unblocked first" priority. Under a signal storm this can
//! cost two consecutive context switches in as many ticks; that is
//! accepted, since round-robin progress is still made.
//!
//! # Tick structure
//!
//! The hardware timer fires two independent 1 ms compare events, kept
//! separate so timekeeping is never delayed by stack work:
//!
//! - [`Kernel::tick_timekeeping`]: clock increment and timeout-list drain.
//! - [`Kernel::tick_preempt`] / [`Kernel::preempt_commit`]: quantum
//!   accounting and the context switch proper.

use core::ptr::NonNull;

use abi::{Duration, SignalSet, ThreadEntry, ThreadFlags};

use crate::arch;
use crate::config;
use crate::heap::Heap;
use crate::hooks;
use crate::list::{self, List, OffsetList, Queue};
use crate::pagemap::SearchStrategy;
use crate::resource::ResourceId;
use crate::thread::{Tcb, TermSignal, ThreadStatus};

/// Outcome of the preemption half of a tick. Forgetting to act on it means
/// a thread that should have been switched out keeps running, so it must be
/// used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SwitchDecision {
    /// The current thread keeps the CPU; nothing more to do this tick.
    Stay,
    /// A switch is due: save context and call [`Kernel::preempt_commit`].
    Preempt,
}

/// Scoped context-switch gate.
///
/// Holds switching off for its lifetime and restores the *previous* state
/// on drop, so nested guards compose. Interrupts (and therefore
/// timekeeping and signal delivery) continue to run; only the scheduler is
/// held off.
pub struct SwitchGuard {
    prev: bool,
}

impl SwitchGuard {
    pub fn forbid() -> Self {
        Self {
            prev: arch::with_kernel(|k| k.swap_switching(false)),
        }
    }
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        if self.prev {
            arch::with_kernel(|k| k.permit());
        }
    }
}

/// The kernel singleton's state.
pub struct Kernel {
    heap: Heap,
    slots: [Option<Tcb>; config::MAX_THREADS],

    ready: [List; 2],
    active_ix: u8,
    pool: List,
    sleepers: OffsetList,

    current: Option<u8>,
    idle: Option<u8>,

    next_id: u16,
    millis: u32,
    switching: bool,
    resources: u16,
}

impl Kernel {
    /// Builds a kernel over the given heap arena. No threads exist yet;
    /// startup creates the idle thread and the pool.
    pub fn new(arena: &'static mut [u8]) -> Self {
        Self {
            heap: Heap::new(arena),
            slots: core::array::from_fn(|_| None),
            ready: [List::new(Queue::Ready(0)), List::new(Queue::Ready(1))],
            active_ix: 0,
            pool: List::new(Queue::Pool),
            sleepers: OffsetList::new(),
            current: None,
            idle: None,
            next_id: 1,
            millis: 0,
            switching: true,
            resources: 0,
        }
    }

    // ------------------------------------------------------------------
    // Introspection.

    /// Slot index of the running thread.
    pub fn current_index(&self) -> Option<u8> {
        self.current
    }

    /// Borrows the control block in `slot`, if occupied.
    pub fn tcb(&self, slot: u8) -> Option<&Tcb> {
        self.slots.get(usize::from(slot))?.as_ref()
    }

    pub(crate) fn tcb_mut(&mut self, slot: u8) -> Option<&mut Tcb> {
        self.slots.get_mut(usize::from(slot))?.as_mut()
    }

    /// Milliseconds since boot, wrapping at 2^32.
    pub fn now(&self) -> u32 {
        self.millis
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Lifecycle state of the thread in `slot`.
    pub fn status_of(&self, slot: u8) -> ThreadStatus {
        if self.current == Some(slot) {
            return ThreadStatus::Running;
        }
        match self.tcb(slot).and_then(|t| t.queue) {
            Some(Queue::Ready(_)) => ThreadStatus::Ready,
            Some(Queue::Pool) => ThreadStatus::Stopped,
            Some(Queue::Sleep) | None => ThreadStatus::Waiting,
        }
    }

    /// Number of dormant threads in the pool.
    pub fn pool_size(&self) -> usize {
        let mut n = 0;
        let mut cur = self.pool.head();
        while let Some(c) = cur {
            n += 1;
            cur = list::tcb(&self.slots, c).link.next;
        }
        n
    }

    // ------------------------------------------------------------------
    // The context-switch gate.

    /// Prevents context switching. Timekeeping and signal delivery still
    /// happen; the scheduler just stops moving threads.
    pub fn forbid(&mut self) {
        self.switching = false;
    }

    /// Allows context switching.
    pub fn permit(&mut self) {
        self.switching = true;
    }

    pub fn is_switching_enabled(&self) -> bool {
        self.switching
    }

    pub(crate) fn swap_switching(&mut self, on: bool) -> bool {
        core::mem::replace(&mut self.switching, on)
    }

    // ------------------------------------------------------------------
    // Thread creation and the pool.

    fn free_slot(&self) -> Option<u8> {
        self.slots.iter().position(|s| s.is_none()).map(|i| i as u8)
    }

    fn fresh_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Creates a thread.
    ///
    /// The stack comes from the top of the heap so it stays clear of
    /// bottom-up data allocations. Pool threads are parked dormant and
    /// ignore `entry` until reanimated; everything else is animated
    /// immediately and enqueued if `READY`.
    ///
    /// Returns the new thread's handle, or `None` if the heap or thread
    /// table is exhausted (the out-of-memory hook fires for the former).
    pub(crate) fn create_thread(
        &mut self,
        name: Option<&'static str>,
        stack_bytes: usize,
        entry: Option<ThreadEntry>,
        flags: ThreadFlags,
        term: Option<TermSignal>,
        exit_to: Option<NonNull<i16>>,
    ) -> Option<crate::thread::Thread> {
        let want = stack_bytes.max(config::MIN_STACK_BYTES);
        let stack = match self.heap.allocate(want, SearchStrategy::TopDown) {
            Some(a) => a,
            None => {
                (hooks::get().on_out_of_memory)();
                return None;
            }
        };

        let Some(ix) = self.free_slot() else {
            self.heap.free(stack.addr, stack.len);
            return None;
        };

        self.slots[usize::from(ix)] =
            Some(Tcb::dormant(stack.addr, stack.len, flags));

        if flags.contains(ThreadFlags::POOL_THREAD) {
            self.pool.append(&mut self.slots, ix);
            return Some(crate::thread::Thread { slot: ix, id: 0 });
        }

        let entry = match entry {
            Some(e) => e,
            None => {
                self.slots[usize::from(ix)] = None;
                self.heap.free(stack.addr, stack.len);
                return None;
            }
        };

        self.reanimate(ix, name, entry, flags, term, exit_to);
        if flags.contains(ThreadFlags::READY) {
            let a = usize::from(self.active_ix);
            self.ready[a].append(&mut self.slots, ix);
        }

        let id = list::tcb(&self.slots, ix).id;
        Some(crate::thread::Thread { slot: ix, id })
    }

    /// Pops a dormant thread from the pool and gives it new code, a fresh
    /// id, and a clean signal state, then prepends it to the active list so
    /// it runs promptly.
    pub(crate) fn thread_from_pool(
        &mut self,
        name: Option<&'static str>,
        entry: ThreadEntry,
        term: Option<TermSignal>,
        exit_to: Option<NonNull<i16>>,
    ) -> Option<crate::thread::Thread> {
        let ix = self.pool.head()?;
        self.pool.remove(&mut self.slots, ix);

        self.reanimate(
            ix,
            name,
            entry,
            ThreadFlags::READY | ThreadFlags::POOL_THREAD,
            term,
            exit_to,
        );

        let a = usize::from(self.active_ix);
        self.ready[a].prepend(&mut self.slots, ix);

        let id = list::tcb(&self.slots, ix).id;
        Some(crate::thread::Thread { slot: ix, id })
    }

    /// Rewrites a control block (and its stack) to host a new logical
    /// thread. The synthetic stack frame is laid out so that the first
    /// context restore lands in the architecture's thread springboard with
    /// this slot, `entry`, and `flags` as arguments.
    fn reanimate(
        &mut self,
        ix: u8,
        name: Option<&'static str>,
        entry: ThreadEntry,
        flags: ThreadFlags,
        term: Option<TermSignal>,
        exit_to: Option<NonNull<i16>>,
    ) {
        let id = self.fresh_id();
        let t = list::tcb_mut(&mut self.slots, ix);

        t.id = id;
        t.name = name;
        t.flags = flags;
        t.reset_signals();
        t.timeout_offset = 0;
        t.ticks_remaining = 0;
        t.term = term;
        t.exit_to = exit_to;

        // The stack region belongs to this control block alone; we hold
        // the only path to it while the thread is dormant.
        let stack = unsafe {
            core::slice::from_raw_parts_mut(
                t.stack_base as *mut u8,
                t.stack_len,
            )
        };
        let sp_off = arch::prepare_stack_frame(stack, ix, entry, flags);
        t.sp = t.stack_base + sp_off;
        t.low_sp = t.sp;
    }

    // ------------------------------------------------------------------
    // Signals.

    /// Posts signal bits to the thread in `slot`, waking it if the post
    /// newly completes a wait and the poster isn't the thread itself. A
    /// woken thread leaves the timeout list (its pending timeout is
    /// cancelled) and goes to the *head* of the active list.
    pub(crate) fn post(&mut self, slot: u8, sigs: SignalSet) {
        let Some(t) = self.tcb_mut(slot) else {
            return;
        };

        let already = !t.active_signals().is_empty();
        t.accept(sigs);

        if self.current == Some(slot) {
            // The running thread will see its own signals at the next
            // wait; no scheduling work to do.
            return;
        }

        let t = list::tcb(&self.slots, slot);
        if already || t.active_signals().is_empty() {
            return;
        }

        // The thread has newly become wakeable. Pull it out of wherever it
        // is and put it first in line.
        match t.queue {
            Some(Queue::Sleep) => {
                self.sleepers.remove(&mut self.slots, slot);
                list::tcb_mut(&mut self.slots, slot).timeout_offset = 0;
            }
            Some(Queue::Ready(l)) => {
                self.ready[usize::from(l)].remove(&mut self.slots, slot);
            }
            Some(Queue::Pool) => return,
            None => {}
        }

        let a = usize::from(self.active_ix);
        self.ready[a].prepend(&mut self.slots, slot);
    }

    /// Clears pending signals on `slot`, returning the bits still set.
    pub(crate) fn clear_signals(
        &mut self,
        slot: u8,
        sigs: SignalSet,
    ) -> SignalSet {
        self.tcb_mut(slot)
            .map_or(SignalSet::EMPTY, |t| t.clear_signals(sigs))
    }

    /// First half of `wait`, on the running thread: fixes the waiting
    /// mask, arms the timeout, and checks for immediate satisfaction.
    ///
    /// `Some(bits)` means the wait is already over (bits may be empty if
    /// there was nothing valid to wait on). `None` means the caller must
    /// yield; the thread will block until a signal or the timeout arrives.
    pub(crate) fn begin_wait(
        &mut self,
        sigs: SignalSet,
        timeout: Duration,
    ) -> Option<SignalSet> {
        let cur = self.current?;
        let t = list::tcb_mut(&mut self.slots, cur);

        t.waiting = sigs;
        t.timeout_offset = timeout.as_millis();

        if t.timeout_offset != 0 {
            t.waiting |= SignalSet::TIMEOUT;
        } else {
            // TIMEOUT may have been named in the mask without a timeout
            // value; it means nothing then.
            t.waiting &= !SignalSet::TIMEOUT;
        }

        t.waiting &= t.allocated;

        if t.waiting.is_empty() {
            return Some(SignalSet::EMPTY);
        }

        let active = t.active_signals();
        if !active.is_empty() {
            t.clear_signals(active);
            t.timeout_offset = 0;
            return Some(active);
        }

        None
    }

    /// Second half of `wait`, after the blocking yield: harvests the bits
    /// that woke the thread and disarms any stale timeout.
    pub(crate) fn finish_wait(&mut self) -> SignalSet {
        let Some(cur) = self.current else {
            return SignalSet::EMPTY;
        };
        let t = list::tcb_mut(&mut self.slots, cur);

        let active = t.active_signals();
        t.clear_signals(active);
        t.timeout_offset = 0;
        active
    }

    // ------------------------------------------------------------------
    // Tick and switch paths.

    /// Timekeeping half of the 1 ms tick: advances the clock, then drains
    /// the timeout list. The head's delta is decremented; every leading
    /// node that reaches zero is removed and handed the reserved TIMEOUT
    /// signal, which puts it at the front of the active list.
    pub fn tick_timekeeping(&mut self) {
        self.millis = self.millis.wrapping_add(1);

        if let Some(head) = self.sleepers.head() {
            let t = list::tcb_mut(&mut self.slots, head);
            if t.timeout_offset > 0 {
                t.timeout_offset -= 1;
            }

            while let Some(h) = self.sleepers.head() {
                if list::tcb(&self.slots, h).timeout_offset != 0 {
                    break;
                }
                self.sleepers.remove(&mut self.slots, h);
                self.post(h, SignalSet::TIMEOUT);
            }
        }
    }

    /// Preemption half of the 1 ms tick: quantum accounting and the switch
    /// decision.
    ///
    /// The current thread's quantum is decremented (floor at zero). If the
    /// current thread is no longer the head of the active list -- someone
    /// was just woken ahead of it -- its quantum is forced to zero so it
    /// yields this very tick. [`SwitchDecision::Preempt`] tells the caller
    /// to save context and call [`Kernel::preempt_commit`]; with switching
    /// disabled or quantum remaining, nothing happens.
    pub fn tick_preempt(&mut self) -> SwitchDecision {
        let Some(cur) = self.current else {
            // Nothing is running (only possible very early); somebody
            // should be.
            return SwitchDecision::Preempt;
        };

        let a = usize::from(self.active_ix);
        let at_head = self.ready[a].head() == Some(cur);
        let switching = self.switching;

        let t = list::tcb_mut(&mut self.slots, cur);
        if t.ticks_remaining > 0 {
            t.ticks_remaining -= 1;
        }
        if switching && !at_head {
            t.ticks_remaining = 0;
        }

        if t.ticks_remaining > 0 || !switching {
            SwitchDecision::Stay
        } else {
            SwitchDecision::Preempt
        }
    }

    /// Completes a preemptive switch: retires the current thread to the
    /// expired list (the idle thread is simply not re-enqueued), selects
    /// the next thread, tops up its quantum if spent, and makes it
    /// current. `sp` is the outgoing thread's saved stack pointer; the
    /// return value is the incoming thread's.
    pub fn preempt_commit(&mut self, sp: usize) -> usize {
        if let Some(cur) = self.current {
            self.record_switch_sp(cur, sp);

            if Some(cur) != self.idle {
                let a = usize::from(self.active_ix);
                self.ready[a].remove(&mut self.slots, cur);
                self.ready[a ^ 1].append(&mut self.slots, cur);
            }
        }

        let next = self.select_next();
        self.current = next;

        match next {
            Some(n) => {
                let t = list::tcb_mut(&mut self.slots, n);
                if t.ticks_remaining == 0 {
                    t.ticks_remaining = config::QUANTUM_TICKS;
                }
                t.sp
            }
            None => sp,
        }
    }

    /// Completes a voluntary switch (wait, delay, termination). The
    /// outgoing thread is *not* re-enqueued: it either left the active
    /// list already (termination) or is blocking and will be re-inserted
    /// by whatever wakes it. A pending timeout puts it on the sleep list.
    pub fn yield_commit(&mut self, sp: usize) -> usize {
        if let Some(cur) = self.current {
            self.record_switch_sp(cur, sp);

            let a = usize::from(self.active_ix);
            self.ready[a].remove(&mut self.slots, cur);

            let off = list::tcb(&self.slots, cur).timeout_offset;
            if off > 0 {
                self.sleepers.insert_by_offset(&mut self.slots, cur, off);
            }
        }

        let next = self.select_next();
        self.current = next;

        match next {
            Some(n) => list::tcb(&self.slots, n).sp,
            None => sp,
        }
    }

    /// Chooses the next thread: the head of the active list, after a role
    /// swap if the active list has drained, falling back to the idle
    /// thread.
    fn select_next(&mut self) -> Option<u8> {
        let mut rc = self.ready[usize::from(self.active_ix)].head();
        if rc.is_none() {
            self.active_ix ^= 1;
            rc = self.ready[usize::from(self.active_ix)].head();
            if rc.is_none() {
                rc = self.idle;
            }
        }
        rc
    }

    /// Stores a context-save stack pointer and maintains the low-water
    /// mark. A mark below the stack base means the thread has overrun its
    /// stack; the overflow hook runs on the kernel's own stack since the
    /// thread's is presumed ruined.
    fn record_switch_sp(&mut self, ix: u8, sp: usize) {
        let t = list::tcb_mut(&mut self.slots, ix);
        t.sp = sp;
        t.low_sp = t.low_sp.min(sp);

        if t.low_sp < t.stack_base {
            let t = list::tcb(&self.slots, ix);
            arch::on_kernel_stack(|| (hooks::get().on_stack_overflow)(t));
        }
    }

    /// Registers `slot` as the idle thread. It will never be enqueued on a
    /// ready list by the scheduler.
    pub(crate) fn set_idle(&mut self, slot: Option<u8>) {
        self.idle = slot;
    }

    pub fn idle_index(&self) -> Option<u8> {
        self.idle
    }

    // ------------------------------------------------------------------
    // Termination.

    /// Terminal bookkeeping for the running thread, called from the
    /// architecture springboard once the entry function has returned.
    /// Interrupts must already be off; the caller yields afterwards and
    /// never comes back.
    pub(crate) fn terminate_current(&mut self, code: i16) {
        let Some(cur) = self.current else {
            return;
        };

        let (flags, exit_to, term, leaked, base, len) = {
            let t = list::tcb(&self.slots, cur);
            (
                t.flags,
                t.exit_to,
                t.term,
                t.allocated_signals(true),
                t.stack_base,
                t.stack_len,
            )
        };

        // A pool thread still holding user signals means a rendezvous out
        // there survived its thread; recycling would let that stale handle
        // signal whoever occupies this slot next.
        if flags.contains(ThreadFlags::POOL_THREAD) {
            debug_assert!(leaked.is_empty(), "signals remain at exit");
        }

        if let Some(p) = exit_to {
            // Liveness of the destination was promised at spawn.
            unsafe { p.as_ptr().write(code) };
        }

        if let Some(ts) = term {
            let live = self
                .tcb(ts.slot)
                .is_some_and(|t| t.id == ts.id);
            if live {
                self.post(ts.slot, ts.bits);
            }
        }

        let a = usize::from(self.active_ix);
        self.ready[a].remove(&mut self.slots, cur);
        self.current = None;

        {
            let t = list::tcb(&self.slots, cur);
            (hooks::get().on_thread_exit)(t, code);
        }

        if flags.contains(ThreadFlags::POOL_THREAD) {
            self.pool.append(&mut self.slots, cur);
        } else {
            self.slots[usize::from(cur)] = None;
            self.heap.free(base, len);
        }
    }

    // ------------------------------------------------------------------
    // Shared-resource bitmap.

    /// Obtains exclusive use of a hardware resource. `false` means someone
    /// already holds it.
    pub(crate) fn obtain_resource(&mut self, id: ResourceId) -> bool {
        let m = 1u16 << (id as u16);
        if self.resources & m != 0 {
            return false;
        }
        self.resources |= m;
        true
    }

    /// Releases a previously obtained resource.
    pub(crate) fn release_resource(&mut self, id: ResourceId) {
        self.resources &= !(1u16 << (id as u16));
    }
}

/// Ends the running thread with `code`, never to return. This is the tail
/// of the architecture springboard; application code simply returns from
/// its entry function instead.
pub fn exit_thread(code: i16) -> ! {
    unsafe { arch::interrupts_off() };
    unsafe { arch::kernel() }.terminate_current(code);
    arch::yield_now();
    // The context that was executing here no longer exists.
    unreachable!()
}
