// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for AVR ATmega parts.
//!
//! This is the kernel's only byte-level module: every saved-context layout
//! decision, every `push`/`pop`, and every stack-pointer write happens
//! here. If you are auditing the unsafe surface of the kernel, this file
//! is most of it.
//!
//! # Saved context layout
//!
//! A context is saved in two halves, mirroring how much work each path
//! needs to do before it knows whether a switch will happen:
//!
//! - *initial*: `r0`, `SREG`, `r1`, `r18`-`r31` -- the caller-saved set,
//!   enough to run the switch decision in Rust.
//! - *extended*: `r2`-`r17` -- saved only once a switch is committed.
//!
//! The preemption ISR saves the initial half, asks the kernel whether the
//! quantum is up, and restores-and-returns if not; only on an actual
//! switch does it pay for the extended half. The voluntary yield always
//! saves everything. Both produce the same frame shape, which is also the
//! shape [`prepare_stack_frame`] fabricates for a brand-new thread -- with
//! the thread springboard's address where the interrupted PC would be, and
//! the springboard's arguments pre-loaded into the saved parameter
//! registers.
//!
//! # Timer
//!
//! Timer/Counter0 in CTC mode produces two independent 1 ms compare
//! events: COMPA drives timekeeping and the timeout drain, COMPB drives
//! quantum accounting and preemption. Keeping them separate means a long
//! context switch never delays the clock.

use core::arch::naked_asm;

use abi::{ThreadEntry, ThreadFlags};

use crate::kernel::{Kernel, SwitchDecision};
use crate::power::{ResetFlags, SleepMode};

use super::FrameLayout;

/// Top of data RAM (ATmega328P). The kernel parks SP here while running
/// the stack-overflow hook, since the faulting thread's stack is suspect.
const RAMEND: u16 = 0x08FF;

/// Compare value for a 1 ms tick: 250 counts of the 16 MHz clock
/// prescaled by 64.
const MS_COMPARE: u8 = 249;

/// Saved context shape. Two bytes of return address, the 32 general
/// registers, and SREG. (Parts with more than 64 KiB of flash would add
/// RAMPZ to the extras and a third PC byte.)
pub const LAYOUT: FrameLayout = FrameLayout {
    pc_bytes: 2,
    register_slots: 32,
    extra_slots: 1,
    param_offsets: [24, 26, 28, 30, 2, 4, 6, 8, 10],
};

macro_rules! save_initial {
    () => {
        "push r0
         in r0, 0x3F
         push r0
         push r1
         push r18
         push r19
         push r20
         push r21
         push r22
         push r23
         push r24
         push r25
         push r26
         push r27
         push r28
         push r29
         push r30
         push r31"
    };
}

macro_rules! restore_initial {
    () => {
        "pop r31
         pop r30
         pop r29
         pop r28
         pop r27
         pop r26
         pop r25
         pop r24
         pop r23
         pop r22
         pop r21
         pop r20
         pop r19
         pop r18
         pop r1
         pop r0
         out 0x3F, r0
         pop r0"
    };
}

macro_rules! save_extended {
    () => {
        "push r2
         push r3
         push r4
         push r5
         push r6
         push r7
         push r8
         push r9
         push r10
         push r11
         push r12
         push r13
         push r14
         push r15
         push r16
         push r17"
    };
}

macro_rules! restore_extended {
    () => {
        "pop r17
         pop r16
         pop r15
         pop r14
         pop r13
         pop r12
         pop r11
         pop r10
         pop r9
         pop r8
         pop r7
         pop r6
         pop r5
         pop r4
         pop r3
         pop r2"
    };
}

// ----------------------------------------------------------------------
// Kernel singleton access.

static mut KERNEL: *mut Kernel = core::ptr::null_mut();

/// Installs the kernel singleton. Called exactly once, from startup,
/// before interrupts are enabled.
pub fn install_kernel(k: &'static mut Kernel) {
    let p: *mut Kernel = k;
    avr_device::interrupt::free(|_| unsafe { KERNEL = p });
}

/// Produces the installed kernel.
///
/// # Safety
///
/// Interrupts must be masked (by hardware ISR entry or an explicit
/// [`interrupts_off`]) for as long as the returned borrow lives, and the
/// borrow must not be held across anything that re-enters the kernel.
pub unsafe fn kernel() -> &'static mut Kernel {
    let p = unsafe { KERNEL };
    if p.is_null() {
        panic!("kernel not installed");
    }
    unsafe { &mut *p }
}

/// Runs `f` with exclusive access to the kernel, interrupts masked.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    avr_device::interrupt::free(|_| f(unsafe { kernel() }))
}

/// Masks interrupts (`cli`).
///
/// # Safety
///
/// The caller takes responsibility for restoring interrupts; forgetting
/// to stops the kernel clock.
pub unsafe fn interrupts_off() {
    avr_device::interrupt::disable();
}

/// Unmasks interrupts (`sei`).
///
/// # Safety
///
/// Must not be called while a kernel borrow from [`kernel`] is live.
pub unsafe fn interrupts_on() {
    unsafe { avr_device::interrupt::enable() };
}

// ----------------------------------------------------------------------
// Stack pointer plumbing.

unsafe fn read_sp() -> u16 {
    let lo: u8;
    let hi: u8;
    unsafe {
        core::arch::asm!(
            "in {lo}, 0x3D",
            "in {hi}, 0x3E",
            lo = out(reg) lo,
            hi = out(reg) hi,
        );
    }
    u16::from(hi) << 8 | u16::from(lo)
}

unsafe fn write_sp(sp: u16) {
    unsafe {
        core::arch::asm!(
            "out 0x3D, {lo}",
            "out 0x3E, {hi}",
            lo = in(reg) sp as u8,
            hi = in(reg) (sp >> 8) as u8,
        );
    }
}

/// Runs `f` with SP parked at the top of RAM. Used for the stack-overflow
/// hook, whose thread's own stack cannot be trusted anymore. Interrupts
/// must be off (this only runs from context-save paths).
pub(crate) fn on_kernel_stack(f: impl FnOnce()) {
    unsafe {
        let saved = read_sp();
        write_sp(RAMEND);
        f();
        write_sp(saved);
    }
}

// ----------------------------------------------------------------------
// Thread entry and exit.

/// Builds the synthetic initial frame for a new thread, aimed at
/// [`thread_springboard`].
pub(crate) fn prepare_stack_frame(
    stack: &mut [u8],
    slot: u8,
    entry: ThreadEntry,
    flags: ThreadFlags,
) -> usize {
    super::build_initial_frame(
        stack,
        &LAYOUT,
        thread_springboard as usize,
        slot,
        entry as usize,
        flags.bits(),
    )
}

/// Every thread starts and ends life here. The first context restore of a
/// fresh thread "returns" to this function with the arguments the frame
/// builder planted in the saved parameter registers.
extern "C" fn thread_springboard(slot: u16, entry: u32, flags: u16) -> ! {
    let _ = (slot, flags);

    // Safety: the frame builder put a ThreadEntry here; nothing else can
    // construct such a frame.
    let entry: ThreadEntry =
        unsafe { core::mem::transmute(entry as usize) };
    let code = entry();

    crate::kernel::exit_thread(code)
}

// ----------------------------------------------------------------------
// Context switching.

extern "C" fn preempt_check() -> u8 {
    let k = unsafe { kernel() };
    (k.tick_preempt() == SwitchDecision::Preempt) as u8
}

extern "C" fn preempt_commit_sp(sp: u16) -> u16 {
    let k = unsafe { kernel() };
    k.preempt_commit(usize::from(sp)) as u16
}

extern "C" fn yield_commit_sp(sp: u16) -> u16 {
    let k = unsafe { kernel() };
    k.yield_commit(usize::from(sp)) as u16
}

extern "C" fn first_sp() -> u16 {
    let k = unsafe { kernel() };
    k.yield_commit(0) as u16
}

/// Voluntarily hands the CPU to another thread. Returns when (and if)
/// something wakes this one.
///
/// Saves the full context with the `call`er's return address on top,
/// which is exactly the frame the restore paths expect. The `reti` on the
/// far side re-enables interrupts.
#[unsafe(naked)]
pub extern "C" fn yield_now() {
    naked_asm!(
        "cli",
        save_initial!(),
        "clr r1",
        save_extended!(),
        "in r24, 0x3D",
        "in r25, 0x3E",
        "call {commit}",
        "out 0x3D, r24",
        "out 0x3E, r25",
        restore_extended!(),
        restore_initial!(),
        "reti",
        commit = sym yield_commit_sp,
    );
}

/// Timekeeping compare: clock increment and timeout drain. A plain ISR;
/// no context switch happens here.
#[avr_device::interrupt(atmega328p)]
fn TIMER0_COMPA() {
    let k = unsafe { kernel() };
    k.tick_timekeeping();
}

/// Preemption compare (TIMER0_COMPB), naked so the partial-save trick
/// works: save only the initial half, ask the kernel, and bail cheaply
/// when no switch is due.
///
/// # Safety
///
/// Entered only by the hardware through the interrupt vector; never call
/// it.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn __vector_15() {
    naked_asm!(
        save_initial!(),
        "clr r1",
        "call {check}",
        "tst r24",
        "breq 2f",
        save_extended!(),
        "in r24, 0x3D",
        "in r25, 0x3E",
        "call {commit}",
        "out 0x3D, r24",
        "out 0x3E, r25",
        restore_extended!(),
        "2:",
        restore_initial!(),
        "reti",
        check = sym preempt_check,
        commit = sym preempt_commit_sp,
    );
}

/// Restores the first thread's fabricated context and enters it. The
/// `reti` both jumps to the springboard and turns interrupts on.
#[unsafe(naked)]
pub extern "C" fn start_first_thread() -> ! {
    naked_asm!(
        "cli",
        "clr r1",
        "call {first}",
        "out 0x3D, r24",
        "out 0x3E, r25",
        restore_extended!(),
        restore_initial!(),
        "reti",
        first = sym first_sp,
    );
}

// ----------------------------------------------------------------------
// Timer and power hardware.

/// Configures Timer/Counter0 for the two 1 ms compare events and enables
/// both interrupts. Claims no other timer resources.
pub fn start_tick_timer() {
    // Safety: startup owns the peripherals; nothing else has touched TC0.
    let dp = unsafe { avr_device::atmega328p::Peripherals::steal() };

    dp.TC0.tccr0b.write(|w| w.cs0().no_clock());
    dp.TC0.tcnt0.write(|w| unsafe { w.bits(0) });
    dp.TC0.tccr0a.write(|w| w.wgm0().ctc());
    dp.TC0.ocr0a.write(|w| unsafe { w.bits(MS_COMPARE) });
    dp.TC0.ocr0b.write(|w| unsafe { w.bits(MS_COMPARE) });
    dp.TC0
        .timsk0
        .write(|w| w.ocie0a().set_bit().ocie0b().set_bit());
    dp.TC0.tccr0b.write(|w| w.cs0().prescale_64());
}

/// Reads and clears the MCU status register, reporting why we reset.
/// Clearing is what lets the next boot see *its* cause, and is also a
/// precondition for taming a watchdog-triggered reset.
pub(crate) fn take_reset_flags() -> ResetFlags {
    let dp = unsafe { avr_device::atmega328p::Peripherals::steal() };
    let mcusr = dp.CPU.mcusr.read();

    let mut rc = ResetFlags::empty();
    if mcusr.porf().bit_is_set() {
        rc |= ResetFlags::POWER_ON;
    }
    if mcusr.extrf().bit_is_set() {
        rc |= ResetFlags::EXTERNAL;
    }
    if mcusr.borf().bit_is_set() {
        rc |= ResetFlags::BROWNOUT;
    }
    if mcusr.wdrf().bit_is_set() {
        rc |= ResetFlags::WATCHDOG;
    }

    dp.CPU.mcusr.write(|w| unsafe { w.bits(0) });
    rc
}

/// Puts the CPU into the requested sleep mode until the next interrupt.
pub(crate) fn sleep(mode: SleepMode) {
    let dp = unsafe { avr_device::atmega328p::Peripherals::steal() };

    dp.CPU.smcr.write(|w| {
        let w = match mode {
            SleepMode::Idle => w.sm().idle(),
            SleepMode::AdcNoiseReduction => w.sm().adc(),
            SleepMode::PowerDown => w.sm().pdown(),
            SleepMode::PowerSave => w.sm().psave(),
            SleepMode::Standby => w.sm().stdby(),
            SleepMode::ExtendedStandby => w.sm().estdby(),
        };
        w.se().set_bit()
    });

    if mode != SleepMode::PowerDown {
        // Anything short of power-down must keep the tick alive to wake.
        unsafe { avr_device::interrupt::enable() };
    }
    avr_device::asm::sleep();

    dp.CPU.smcr.modify(|_, w| w.se().clear_bit());
}
