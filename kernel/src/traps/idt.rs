// =============================================================================
// Ember — Interrupt Descriptor Table and Entry Stubs
// =============================================================================
//
// 256 gates mapping CPU vectors to entry stubs. Every stub packages the
// saved frame, the error code (zero when the CPU pushes none), and its
// vector number into an `IntrState` and hands it to `route::dispatch`.
// Gates are installed for the fault range, the external IRQ window, and
// the spurious vector; a vector nobody routes still reaches dispatch and
// panics there with its number.
//
// Double fault is the exception: by the time it fires the kernel state is
// already suspect, so it panics directly instead of going through routing.
// =============================================================================

use core::arch::asm;
use core::mem::size_of;

use spin::Once;

use crate::arch::gdt::SLTR_KERNEL_CODE;

use super::{route, IntrFrame, IntrState, IRQ0, SPURIOUS};

/// One 16-byte IDT gate.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    ptr_low: u16,
    selector: u16,
    ist: u8,
    /// Present bit, DPL, and gate type.
    attributes: u8,
    ptr_mid: u16,
    ptr_high: u32,
    reserved: u32,
}

/// Present, DPL 0, 64-bit interrupt gate (interrupts masked on entry).
const GATE_INTERRUPT: u8 = 0x8E;

impl IdtEntry {
    const MISSING: Self = Self {
        ptr_low: 0,
        selector: 0,
        ist: 0,
        attributes: 0,
        ptr_mid: 0,
        ptr_high: 0,
        reserved: 0,
    };

    fn new(handler: usize) -> Self {
        Self {
            ptr_low: handler as u16,
            selector: SLTR_KERNEL_CODE,
            ist: 0,
            attributes: GATE_INTERRUPT,
            ptr_mid: (handler >> 16) as u16,
            ptr_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

/// Pointer operand for the `lidt` instruction.
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// The descriptor table itself.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; super::INTERRUPTS],
}

impl Idt {
    fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; super::INTERRUPTS],
        }
    }

    fn set_gate(&mut self, vector: u8, handler: usize) {
        self.entries[vector as usize] = IdtEntry::new(handler);
    }

    unsafe fn load(&'static self) {
        let ptr = IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };
        unsafe {
            asm!(
                "lidt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );
        }
    }
}

static IDT: Once<Idt> = Once::new();

// Stub generators. The CPU pushes an error code for some faults and not
// others, so two shapes are needed.

macro_rules! intr_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: IntrFrame) {
            route::dispatch(&IntrState {
                id: $vector,
                error_code: 0,
                frame,
            });
        }
    };
}

macro_rules! intr_stub_err {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: IntrFrame, error_code: u64) {
            route::dispatch(&IntrState {
                id: $vector,
                error_code,
                frame,
            });
        }
    };
}

intr_stub!(divide_error, 0);
intr_stub!(debug, 1);
intr_stub!(nmi, 2);
intr_stub!(breakpoint, 3);
intr_stub!(overflow, 4);
intr_stub!(bound_range, 5);
intr_stub!(invalid_opcode, 6);
intr_stub!(device_not_available, 7);
intr_stub!(coprocessor_overrun, 9);
intr_stub_err!(invalid_tss, 10);
intr_stub_err!(segment_not_present, 11);
intr_stub_err!(stack_segment_fault, 12);
intr_stub_err!(general_protection, 13);
intr_stub_err!(page_fault, 14);
intr_stub!(reserved_15, 15);
intr_stub!(x87_floating_point, 16);
intr_stub_err!(alignment_check, 17);
intr_stub!(machine_check, 18);
intr_stub!(simd_floating_point, 19);
intr_stub!(virtualization, 20);
intr_stub_err!(control_protection, 21);
intr_stub!(reserved_22, 22);
intr_stub!(reserved_23, 23);
intr_stub!(reserved_24, 24);
intr_stub!(reserved_25, 25);
intr_stub!(reserved_26, 26);
intr_stub!(reserved_27, 27);
intr_stub!(hypervisor_injection, 28);
intr_stub_err!(vmm_communication, 29);
intr_stub_err!(security_exception, 30);
intr_stub!(reserved_31, 31);

intr_stub!(irq_0, IRQ0);
intr_stub!(irq_1, IRQ0 + 1);
intr_stub!(irq_2, IRQ0 + 2);
intr_stub!(irq_3, IRQ0 + 3);
intr_stub!(irq_4, IRQ0 + 4);
intr_stub!(irq_5, IRQ0 + 5);
intr_stub!(irq_6, IRQ0 + 6);
intr_stub!(irq_7, IRQ0 + 7);
intr_stub!(irq_8, IRQ0 + 8);
intr_stub!(irq_9, IRQ0 + 9);
intr_stub!(irq_10, IRQ0 + 10);
intr_stub!(irq_11, IRQ0 + 11);
intr_stub!(irq_12, IRQ0 + 12);
intr_stub!(irq_13, IRQ0 + 13);
intr_stub!(irq_14, IRQ0 + 14);
intr_stub!(irq_15, IRQ0 + 15);
intr_stub!(irq_16, IRQ0 + 16);
intr_stub!(irq_17, IRQ0 + 17);
intr_stub!(irq_18, IRQ0 + 18);
intr_stub!(irq_19, IRQ0 + 19);
intr_stub!(irq_20, IRQ0 + 20);
intr_stub!(irq_21, IRQ0 + 21);
intr_stub!(irq_22, IRQ0 + 22);
intr_stub!(irq_23, IRQ0 + 23);

intr_stub!(spurious, SPURIOUS);

/// A double fault means a fault during fault delivery; routing through the
/// ordinary chains would trust state that just proved untrustworthy.
extern "x86-interrupt" fn double_fault(frame: IntrFrame, error_code: u64) -> ! {
    panic!(
        "double fault (error code {:#x}) at {:#018x}",
        error_code, frame.rip
    );
}

/// Builds and loads the IDT. One-shot; later calls reuse the same table.
pub fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = Idt::new();

        idt.set_gate(0, divide_error as usize);
        idt.set_gate(1, debug as usize);
        idt.set_gate(2, nmi as usize);
        idt.set_gate(3, breakpoint as usize);
        idt.set_gate(4, overflow as usize);
        idt.set_gate(5, bound_range as usize);
        idt.set_gate(6, invalid_opcode as usize);
        idt.set_gate(7, device_not_available as usize);
        idt.set_gate(8, double_fault as usize);
        idt.set_gate(9, coprocessor_overrun as usize);
        idt.set_gate(10, invalid_tss as usize);
        idt.set_gate(11, segment_not_present as usize);
        idt.set_gate(12, stack_segment_fault as usize);
        idt.set_gate(13, general_protection as usize);
        idt.set_gate(14, page_fault as usize);
        idt.set_gate(15, reserved_15 as usize);
        idt.set_gate(16, x87_floating_point as usize);
        idt.set_gate(17, alignment_check as usize);
        idt.set_gate(18, machine_check as usize);
        idt.set_gate(19, simd_floating_point as usize);
        idt.set_gate(20, virtualization as usize);
        idt.set_gate(21, control_protection as usize);
        idt.set_gate(22, reserved_22 as usize);
        idt.set_gate(23, reserved_23 as usize);
        idt.set_gate(24, reserved_24 as usize);
        idt.set_gate(25, reserved_25 as usize);
        idt.set_gate(26, reserved_26 as usize);
        idt.set_gate(27, reserved_27 as usize);
        idt.set_gate(28, hypervisor_injection as usize);
        idt.set_gate(29, vmm_communication as usize);
        idt.set_gate(30, security_exception as usize);
        idt.set_gate(31, reserved_31 as usize);

        idt.set_gate(IRQ0, irq_0 as usize);
        idt.set_gate(IRQ0 + 1, irq_1 as usize);
        idt.set_gate(IRQ0 + 2, irq_2 as usize);
        idt.set_gate(IRQ0 + 3, irq_3 as usize);
        idt.set_gate(IRQ0 + 4, irq_4 as usize);
        idt.set_gate(IRQ0 + 5, irq_5 as usize);
        idt.set_gate(IRQ0 + 6, irq_6 as usize);
        idt.set_gate(IRQ0 + 7, irq_7 as usize);
        idt.set_gate(IRQ0 + 8, irq_8 as usize);
        idt.set_gate(IRQ0 + 9, irq_9 as usize);
        idt.set_gate(IRQ0 + 10, irq_10 as usize);
        idt.set_gate(IRQ0 + 11, irq_11 as usize);
        idt.set_gate(IRQ0 + 12, irq_12 as usize);
        idt.set_gate(IRQ0 + 13, irq_13 as usize);
        idt.set_gate(IRQ0 + 14, irq_14 as usize);
        idt.set_gate(IRQ0 + 15, irq_15 as usize);
        idt.set_gate(IRQ0 + 16, irq_16 as usize);
        idt.set_gate(IRQ0 + 17, irq_17 as usize);
        idt.set_gate(IRQ0 + 18, irq_18 as usize);
        idt.set_gate(IRQ0 + 19, irq_19 as usize);
        idt.set_gate(IRQ0 + 20, irq_20 as usize);
        idt.set_gate(IRQ0 + 21, irq_21 as usize);
        idt.set_gate(IRQ0 + 22, irq_22 as usize);
        idt.set_gate(IRQ0 + 23, irq_23 as usize);

        idt.set_gate(SPURIOUS, spurious as usize);

        idt
    });

    unsafe { idt.load() };
    log::debug!("IDT loaded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout_is_hardware_exact() {
        assert_eq!(size_of::<IdtEntry>(), 16);
        assert_eq!(size_of::<IdtPointer>(), 10);
        assert_eq!(size_of::<Idt>(), 256 * 16);
    }

    #[test]
    fn gate_splits_the_handler_address() {
        let entry = IdtEntry::new(0xFFFF_FFFF_8123_4567);
        assert_eq!({ entry.ptr_low }, 0x4567);
        assert_eq!({ entry.ptr_mid }, 0x8123);
        assert_eq!({ entry.ptr_high }, 0xFFFF_FFFF);
        assert_eq!({ entry.selector }, SLTR_KERNEL_CODE);
        assert_eq!({ entry.attributes }, GATE_INTERRUPT);
    }
}
