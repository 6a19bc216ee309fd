//! Local APIC: the per-CPU interrupt controller.
//!
//! Every core has one; it delivers external interrupts routed by the I/O
//! APICs, local sources, and IPIs. The registers are memory-mapped at the
//! base address held in the IA32_APIC_BASE MSR, reached here through the
//! HHDM window.
//!
//! The routing layer only needs two things from it: `ack` (end-of-
//! interrupt) and `print_info`.

#[cfg(not(test))]
use spin::Once;

#[cfg(not(test))]
const IA32_APIC_BASE_MSR: u32 = 0x1B;

// Register offsets from the MMIO base.
#[cfg(not(test))]
const APIC_REG_ID: u64 = 0x020;
#[cfg(not(test))]
const APIC_REG_VERSION: u64 = 0x030;
#[cfg(not(test))]
const APIC_REG_EOI: u64 = 0x0B0;
#[cfg(not(test))]
const APIC_REG_SVR: u64 = 0x0F0;

/// SVR bit 8: APIC software enable.
#[cfg(not(test))]
const SVR_APIC_ENABLE: u32 = 1 << 8;

/// HHDM virtual base of the local APIC MMIO window, set by `init`.
#[cfg(not(test))]
static APIC_BASE: Once<u64> = Once::new();

#[cfg(not(test))]
unsafe fn read_reg(offset: u64) -> u32 {
    let base = APIC_BASE.get().expect("local APIC not initialized");
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

#[cfg(not(test))]
unsafe fn write_reg(offset: u64, value: u32) {
    let base = APIC_BASE.get().expect("local APIC not initialized");
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
}

/// Locates the local APIC through the IA32_APIC_BASE MSR and software-
/// enables it with the spurious vector installed.
#[cfg(not(test))]
pub fn init() {
    use crate::memory::address::PhysAddr;
    use crate::traps::SPURIOUS;

    let msr = unsafe { x86_64::registers::model_specific::Msr::new(IA32_APIC_BASE_MSR).read() };
    let phys = PhysAddr::new(msr & 0x000F_FFFF_FFFF_F000);
    APIC_BASE.call_once(|| phys.to_virt().as_u64());

    unsafe {
        write_reg(APIC_REG_SVR, SVR_APIC_ENABLE | SPURIOUS as u32);
    }
}

/// Signals end-of-interrupt for `vector`.
///
/// Dispatch never calls this for faults or for the spurious vector; a
/// spurious EOI would confuse the controller's in-service tracking.
pub fn ack(vector: u8) {
    #[cfg(test)]
    {
        crate::testing::ic::record_ack(vector);
    }
    #[cfg(not(test))]
    {
        let _ = vector; // EOI is vector-agnostic on the local APIC
        unsafe { write_reg(APIC_REG_EOI, 0) };
    }
}

/// Logs the controller's identification registers.
pub fn print_info() {
    #[cfg(not(test))]
    unsafe {
        let id = read_reg(APIC_REG_ID) >> 24;
        let version = read_reg(APIC_REG_VERSION) & 0xFF;
        log::info!("local APIC id {:#04x}, version {:#04x}", id, version);
    }
}
