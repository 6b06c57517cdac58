// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support.
//!
//! Everything that knows about machine registers, interrupt flags, or the
//! byte-level layout of a saved context lives below this module. The rest
//! of the kernel deals only in saved stack-pointer values and the
//! [`FrameLayout`] abstraction.
//!
//! Two backends exist:
//!
//! - `avr`: the real thing. Context-switch ISRs, the thread springboard,
//!   and the 1 ms timer for AVR ATmega parts.
//! - `hosted`: a stand-in for development machines. It cannot switch
//!   contexts -- it exists so the kernel's data structures and scheduler
//!   decisions can be driven directly from unit tests.

use byteorder::{BigEndian, ByteOrder};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "avr")] {
        mod avr;
        pub use avr::*;
    } else {
        mod hosted;
        pub use hosted::*;
    }
}

/// Shape of a saved thread context, as it sits in memory at the moment a
/// context restore begins.
///
/// From the top of the stack downward: `pc_bytes` of return address (least
/// significant byte at the highest address, matching the CPU's call
/// convention), then `register_slots + extra_slots` bytes of saved
/// registers and status. `param_offsets[p]` gives the distance from the
/// post-save stack pointer to the byte pair that the context restore will
/// pop into the registers carrying parameter `p`.
pub struct FrameLayout {
    pub pc_bytes: usize,
    pub register_slots: usize,
    pub extra_slots: usize,
    pub param_offsets: [usize; 9],
}

impl FrameLayout {
    /// Total bytes a saved context occupies.
    pub const fn frame_bytes(&self) -> usize {
        self.pc_bytes + self.register_slots + self.extra_slots
    }
}

/// Writes one 16-bit parameter into a saved register pair. The high byte
/// sits one below `at`, mirroring how the registers were pushed.
fn put_param16(stack: &mut [u8], at: usize, v: u16) {
    BigEndian::write_u16(&mut stack[at - 1..=at], v);
}

/// Builds a thread's synthetic initial context in `stack`.
///
/// When the scheduler later restores this frame and returns from
/// interrupt, execution arrives at `springboard` with `slot`, `entry`, and
/// `flags` already in parameter registers -- exactly as if someone had
/// called it. The register block is zeroed apart from those parameters.
///
/// Returns the offset from the stack base that the thread's saved stack
/// pointer must be set to.
pub(crate) fn build_initial_frame(
    stack: &mut [u8],
    layout: &FrameLayout,
    springboard: usize,
    slot: u8,
    entry: usize,
    flags: u16,
) -> usize {
    let top = stack.len() - 1;
    uassert!(stack.len() > layout.frame_bytes() + 32);

    let new_top = top - layout.frame_bytes();

    // "Push" the springboard address: low byte at the highest address.
    stack[top] = springboard as u8;
    stack[top - 1] = (springboard >> 8) as u8;
    if layout.pc_bytes >= 3 {
        stack[top - 2] = (springboard >> 16) as u8;
    }
    if layout.pc_bytes >= 4 {
        stack[top - 3] = (springboard >> 24) as u8;
    }

    // The register block starts out all zeros.
    for b in &mut stack[new_top + 1..=top - layout.pc_bytes] {
        *b = 0;
    }

    // Parameter 0: the thread's slot.
    put_param16(stack, new_top + layout.param_offsets[0], u16::from(slot));
    // Parameters 2/1: the entry point, as a 32-bit value split low/high.
    put_param16(stack, new_top + layout.param_offsets[2], entry as u16);
    put_param16(
        stack,
        new_top + layout.param_offsets[1],
        (entry >> 16) as u16,
    );
    // Parameter 3: the flags word.
    put_param16(stack, new_top + layout.param_offsets[3], flags);

    new_top
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: FrameLayout = FrameLayout {
        pc_bytes: 2,
        register_slots: 32,
        extra_slots: 1,
        param_offsets: [24, 26, 28, 30, 2, 4, 6, 8, 10],
    };

    #[test]
    fn frame_has_pc_at_top_low_byte_last() {
        let mut stack = vec![0xAAu8; 128];
        let sp = build_initial_frame(
            &mut stack, &LAYOUT, 0x1234, 7, 0xBEEF_CAFE, 0x0003,
        );

        let top = stack.len() - 1;
        assert_eq!(stack[top], 0x34);
        assert_eq!(stack[top - 1], 0x12);
        assert_eq!(sp, top - LAYOUT.frame_bytes());
    }

    #[test]
    fn frame_parameters_land_in_their_slots() {
        let mut stack = vec![0u8; 128];
        let sp = build_initial_frame(
            &mut stack, &LAYOUT, 0x1000, 9, 0xBEEF_CAFE, 0x0103,
        );

        let pair = |off: usize| {
            u16::from(stack[sp + off - 1]) << 8 | u16::from(stack[sp + off])
        };
        assert_eq!(pair(LAYOUT.param_offsets[0]), 9);
        assert_eq!(pair(LAYOUT.param_offsets[2]), 0xCAFE);
        assert_eq!(pair(LAYOUT.param_offsets[1]), 0xBEEF);
        assert_eq!(pair(LAYOUT.param_offsets[3]), 0x0103);
    }

    #[test]
    fn untouched_register_slots_are_zeroed() {
        let mut stack = vec![0xFFu8; 128];
        let sp = build_initial_frame(&mut stack, &LAYOUT, 0, 0, 0, 0);

        let top = stack.len() - 1;
        for b in &stack[sp + 1..=top - LAYOUT.pc_bytes] {
            assert_eq!(*b, 0);
        }
        // Below the frame the stack is untouched.
        for b in &stack[..=sp] {
            assert_eq!(*b, 0xFF);
        }
    }
}
