// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive thread lists.
//!
//! Threads link into lists through the `prev`/`next` slot indices stored in
//! their own control blocks, so insertion and removal never allocate and
//! are O(1). A thread is on at most one list at a time; the control block's
//! queue tag names which one, which lets `remove` refuse to touch a thread
//! that belongs to someone else's list.
//!
//! [`OffsetList`] is the variant used for sleeping threads. Each node's
//! `timeout_offset` holds the *delta* from the previous node's wake time,
//! so the 1 ms tick only ever decrements the head, and insertion in the
//! middle adjusts exactly one neighbor.

use crate::thread::Tcb;

/// The thread table: one optional control block per slot.
pub(crate) type Slots = [Option<Tcb>];

/// Which list a thread is currently linked into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Queue {
    /// One of the two ready lists, by index.
    Ready(u8),
    /// The dormant worker pool.
    Pool,
    /// The timeout list.
    Sleep,
}

/// Intrusive linkage, stored inside each control block.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Link {
    pub prev: Option<u8>,
    pub next: Option<u8>,
}

/// Borrows the control block in slot `ix`.
///
/// Panics if the slot is empty: list links only ever name occupied slots,
/// so an empty one means the kernel's tables are corrupt.
pub(crate) fn tcb(slots: &Slots, ix: u8) -> &Tcb {
    match slots[usize::from(ix)].as_ref() {
        Some(t) => t,
        None => panic!("empty slot {ix} on a list"),
    }
}

/// Mutably borrows the control block in slot `ix`. See [`tcb`].
pub(crate) fn tcb_mut(slots: &mut Slots, ix: u8) -> &mut Tcb {
    match slots[usize::from(ix)].as_mut() {
        Some(t) => t,
        None => panic!("empty slot {ix} on a list"),
    }
}

/// A head/tail doubly-linked list of threads.
pub(crate) struct List {
    head: Option<u8>,
    tail: Option<u8>,
    tag: Queue,
}

impl List {
    pub const fn new(tag: Queue) -> Self {
        Self {
            head: None,
            tail: None,
            tag,
        }
    }

    pub fn head(&self) -> Option<u8> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Links `ix` in at the head.
    pub fn prepend(&mut self, slots: &mut Slots, ix: u8) {
        uassert!(tcb(slots, ix).queue.is_none());

        let old_head = self.head;
        {
            let t = tcb_mut(slots, ix);
            t.link.prev = None;
            t.link.next = old_head;
            t.queue = Some(self.tag);
        }

        if let Some(h) = old_head {
            tcb_mut(slots, h).link.prev = Some(ix);
        }
        self.head = Some(ix);
        if self.tail.is_none() {
            self.tail = Some(ix);
        }
    }

    /// Links `ix` in at the tail.
    pub fn append(&mut self, slots: &mut Slots, ix: u8) {
        uassert!(tcb(slots, ix).queue.is_none());

        let old_tail = self.tail;
        {
            let t = tcb_mut(slots, ix);
            t.link.next = None;
            t.link.prev = old_tail;
            t.queue = Some(self.tag);
        }

        if let Some(t) = old_tail {
            tcb_mut(slots, t).link.next = Some(ix);
        }
        self.tail = Some(ix);
        if self.head.is_none() {
            self.head = Some(ix);
        }
    }

    /// Links `ix` in immediately before `before`, which must already be a
    /// member.
    pub fn insert_before(&mut self, slots: &mut Slots, ix: u8, before: u8) {
        uassert!(tcb(slots, ix).queue.is_none());
        uassert!(tcb(slots, before).queue == Some(self.tag));

        let prev = tcb(slots, before).link.prev;
        {
            let t = tcb_mut(slots, ix);
            t.link.next = Some(before);
            t.link.prev = prev;
            t.queue = Some(self.tag);
        }
        tcb_mut(slots, before).link.prev = Some(ix);

        match prev {
            Some(p) => tcb_mut(slots, p).link.next = Some(ix),
            None => self.head = Some(ix),
        }
    }

    /// Unlinks `ix`. Quietly does nothing if `ix` is not on this list, so
    /// callers may remove speculatively.
    pub fn remove(&mut self, slots: &mut Slots, ix: u8) {
        if tcb(slots, ix).queue != Some(self.tag) {
            return;
        }

        let Link { prev, next } = tcb(slots, ix).link;

        match prev {
            Some(p) => tcb_mut(slots, p).link.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => tcb_mut(slots, n).link.prev = prev,
            None => self.tail = prev,
        }

        let t = tcb_mut(slots, ix);
        t.link = Link::default();
        t.queue = None;
    }
}

/// The timeout list: a [`List`] whose nodes are ordered by delta offsets.
///
/// The sum of `timeout_offset` fields from the head through node N is N's
/// absolute remaining time. Insertion and removal maintain that property by
/// touching at most one neighbor.
pub(crate) struct OffsetList {
    list: List,
}

impl OffsetList {
    pub const fn new() -> Self {
        Self {
            list: List::new(Queue::Sleep),
        }
    }

    pub fn head(&self) -> Option<u8> {
        self.list.head()
    }

    /// Inserts `ix` to fire `offset_from_now` milliseconds from now.
    ///
    /// Walks from the head accumulating deltas until the running sum would
    /// pass `offset_from_now`, then splices in before that node. Both the
    /// new node's delta and the successor's reduced delta are computed from
    /// the sums *before* either is written.
    pub fn insert_by_offset(
        &mut self,
        slots: &mut Slots,
        ix: u8,
        offset_from_now: u32,
    ) {
        let mut sum: u32 = 0;
        let mut cur = self.list.head();

        while let Some(c) = cur {
            let c_off = tcb(slots, c).timeout_offset;
            let sum_through = sum + c_off;

            if sum_through > offset_from_now {
                let node_off = offset_from_now - sum;
                let succ_off = sum_through - offset_from_now;

                self.list.insert_before(slots, ix, c);
                tcb_mut(slots, ix).timeout_offset = node_off;
                tcb_mut(slots, c).timeout_offset = succ_off;
                return;
            }

            sum = sum_through;
            cur = tcb(slots, c).link.next;
        }

        self.list.append(slots, ix);
        tcb_mut(slots, ix).timeout_offset = offset_from_now - sum;
    }

    /// Unlinks `ix`, folding its delta into its successor so every other
    /// node's absolute wake time is unchanged. No-op for non-members.
    pub fn remove(&mut self, slots: &mut Slots, ix: u8) {
        if tcb(slots, ix).queue != Some(Queue::Sleep) {
            return;
        }

        let off = tcb(slots, ix).timeout_offset;
        if let Some(n) = tcb(slots, ix).link.next {
            tcb_mut(slots, n).timeout_offset += off;
        }
        self.list.remove(slots, ix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::ThreadFlags;

    fn slots(n: usize) -> Vec<Option<Tcb>> {
        (0..n)
            .map(|_| Some(Tcb::dormant(0, 0, ThreadFlags::empty())))
            .collect()
    }

    fn collect(list: &List, slots: &Slots) -> Vec<u8> {
        let mut rc = Vec::new();
        let mut cur = list.head();
        while let Some(c) = cur {
            rc.push(c);
            cur = tcb(slots, c).link.next;
        }
        rc
    }

    fn absolutes(list: &OffsetList, slots: &Slots) -> Vec<(u8, u32)> {
        let mut rc = Vec::new();
        let mut sum = 0;
        let mut cur = list.head();
        while let Some(c) = cur {
            sum += tcb(slots, c).timeout_offset;
            rc.push((c, sum));
            cur = tcb(slots, c).link.next;
        }
        rc
    }

    #[test]
    fn append_and_prepend_order() {
        let mut s = slots(4);
        let mut l = List::new(Queue::Pool);
        l.append(&mut s, 0);
        l.append(&mut s, 1);
        l.prepend(&mut s, 2);
        assert_eq!(collect(&l, &s), vec![2, 0, 1]);
        assert_eq!(tcb(&s, 0).queue, Some(Queue::Pool));
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut s = slots(4);
        let mut l = List::new(Queue::Pool);
        for ix in 0..4 {
            l.append(&mut s, ix);
        }

        l.remove(&mut s, 2);
        assert_eq!(collect(&l, &s), vec![0, 1, 3]);
        assert_eq!(tcb(&s, 2).queue, None);

        l.remove(&mut s, 0);
        assert_eq!(collect(&l, &s), vec![1, 3]);

        l.remove(&mut s, 3);
        assert_eq!(collect(&l, &s), vec![1]);

        l.remove(&mut s, 1);
        assert!(l.is_empty());
    }

    #[test]
    fn remove_of_non_member_is_a_no_op() {
        let mut s = slots(3);
        let mut a = List::new(Queue::Ready(0));
        let mut b = List::new(Queue::Ready(1));
        a.append(&mut s, 0);
        b.append(&mut s, 1);

        // 1 belongs to b; removing it from a must not disturb either list.
        a.remove(&mut s, 1);
        a.remove(&mut s, 2);
        assert_eq!(collect(&a, &s), vec![0]);
        assert_eq!(collect(&b, &s), vec![1]);
    }

    #[test]
    fn insert_before_relinks_head() {
        let mut s = slots(3);
        let mut l = List::new(Queue::Pool);
        l.append(&mut s, 0);
        l.insert_before(&mut s, 1, 0);
        assert_eq!(collect(&l, &s), vec![1, 0]);
        l.insert_before(&mut s, 2, 0);
        assert_eq!(collect(&l, &s), vec![1, 2, 0]);
    }

    #[test]
    fn offset_insert_orders_by_absolute_time() {
        let mut s = slots(4);
        let mut l = OffsetList::new();
        l.insert_by_offset(&mut s, 0, 300);
        l.insert_by_offset(&mut s, 1, 100);
        l.insert_by_offset(&mut s, 2, 500);
        assert_eq!(absolutes(&l, &s), vec![(1, 100), (0, 300), (2, 500)]);
        // Deltas: 100, 200, 200.
        assert_eq!(tcb(&s, 1).timeout_offset, 100);
        assert_eq!(tcb(&s, 0).timeout_offset, 200);
        assert_eq!(tcb(&s, 2).timeout_offset, 200);
    }

    #[test]
    fn offset_insert_between_uses_preadjustment_sums() {
        let mut s = slots(3);
        let mut l = OffsetList::new();
        l.insert_by_offset(&mut s, 0, 100);
        l.insert_by_offset(&mut s, 1, 300);
        // Splice at 150: new node delta 50, successor reduced to 150.
        l.insert_by_offset(&mut s, 2, 150);
        assert_eq!(absolutes(&l, &s), vec![(0, 100), (2, 150), (1, 300)]);
        assert_eq!(tcb(&s, 2).timeout_offset, 50);
        assert_eq!(tcb(&s, 1).timeout_offset, 150);
    }

    #[test]
    fn equal_offsets_keep_insertion_order() {
        let mut s = slots(2);
        let mut l = OffsetList::new();
        l.insert_by_offset(&mut s, 0, 200);
        // Walk only stops when the sum would *exceed* the target, so an
        // equal wake time lands after the existing node with delta 0.
        l.insert_by_offset(&mut s, 1, 200);
        assert_eq!(absolutes(&l, &s), vec![(0, 200), (1, 200)]);
        assert_eq!(tcb(&s, 1).timeout_offset, 0);
    }

    #[test]
    fn offset_remove_preserves_other_absolutes() {
        let mut s = slots(4);
        let mut l = OffsetList::new();
        l.insert_by_offset(&mut s, 0, 100);
        l.insert_by_offset(&mut s, 1, 250);
        l.insert_by_offset(&mut s, 2, 400);

        l.remove(&mut s, 1);
        assert_eq!(absolutes(&l, &s), vec![(0, 100), (2, 400)]);
        // The removed node's delta folded into its successor.
        assert_eq!(tcb(&s, 2).timeout_offset, 300);

        // Round trip: insert it back where it was.
        l.insert_by_offset(&mut s, 1, 250);
        assert_eq!(absolutes(&l, &s), vec![(0, 100), (1, 250), (2, 400)]);
    }

    #[test]
    fn offset_remove_of_head_and_tail() {
        let mut s = slots(3);
        let mut l = OffsetList::new();
        l.insert_by_offset(&mut s, 0, 10);
        l.insert_by_offset(&mut s, 1, 20);
        l.insert_by_offset(&mut s, 2, 30);

        l.remove(&mut s, 0);
        assert_eq!(absolutes(&l, &s), vec![(1, 20), (2, 30)]);
        l.remove(&mut s, 2);
        assert_eq!(absolutes(&l, &s), vec![(1, 20)]);
    }
}
