//! I/O APIC records and redirection-entry programming.
//!
//! Each I/O APIC owns a contiguous range of IRQ lines starting at
//! `irq_base`. Its registers are reached through a two-register MMIO
//! window: write the register index to IOREGSEL at the base, then access
//! IOWIN at base + 0x10. Every pin has a 64-bit redirection entry (two
//! 32-bit registers) selecting vector, polarity, trigger mode, mask bit,
//! and destination CPU.
//!
//! The registry is filled once during single-core boot and read-only
//! afterwards, so routing can iterate it without extra locking.

use spin::Once;

use super::isa::IrqTuple;

/// Standard physical base of the first I/O APIC.
pub const IOAPIC_PHYS_BASE: u64 = 0xFEC0_0000;

const MAX_IOAPICS: usize = 8;

// Register indices.
const IOAPICID: u32 = 0x00;
const IOAPICVER: u32 = 0x01;
/// Redirection table base; each pin uses two consecutive indices.
const IOREDTBL_BASE: u32 = 0x10;

// Redirection entry bits (low half).
const REDIR_POLARITY_LOW: u32 = 1 << 13;
const REDIR_TRIGGER_LEVEL: u32 = 1 << 15;
const REDIR_MASKED: u32 = 1 << 16;

/// One discovered I/O APIC.
pub struct IoApic {
    pub phys_addr: u64,
    pub id: u32,
    /// First IRQ line this controller owns.
    pub irq_base: u8,
    /// Number of redirection entries.
    pub irqs: u8,
    /// HHDM virtual base of the MMIO window.
    mmio_base: u64,
}

impl IoApic {
    /// True if this controller's line range contains `irq`
    /// (`irq_base <= irq < irq_base + irqs`).
    pub fn owns(&self, irq: u8) -> bool {
        irq >= self.irq_base && (irq as u32) < self.irq_base as u32 + self.irqs as u32
    }

    #[cfg(not(test))]
    unsafe fn read_reg(&self, index: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile(self.mmio_base as *mut u32, index);
            core::ptr::read_volatile((self.mmio_base + 0x10) as *const u32)
        }
    }

    #[cfg(not(test))]
    unsafe fn write_reg(&self, index: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile(self.mmio_base as *mut u32, index);
            core::ptr::write_volatile((self.mmio_base + 0x10) as *mut u32, value);
        }
    }
}

struct Registry {
    apics: [Option<IoApic>; MAX_IOAPICS],
}

static IOAPICS: Once<Registry> = Once::new();

/// Iterates over every discovered I/O APIC.
pub fn iter() -> impl Iterator<Item = &'static IoApic> {
    IOAPICS
        .get()
        .into_iter()
        .flat_map(|registry| registry.apics.iter().flatten())
}

/// Probes the standard controller at `IOAPIC_PHYS_BASE` and masks all of
/// its redirection entries so nothing fires before it is routed.
///
/// Platforms with more controllers or a non-zero GSI base describe them in
/// the MADT; the ACPI layer replaces this discovery when present.
#[cfg(not(test))]
pub fn init() {
    IOAPICS.call_once(|| {
        let mmio_base = crate::memory::address::PhysAddr::new(IOAPIC_PHYS_BASE)
            .to_virt()
            .as_u64();

        let mut apic = IoApic {
            phys_addr: IOAPIC_PHYS_BASE,
            id: 0,
            irq_base: 0,
            irqs: 0,
            mmio_base,
        };
        unsafe {
            apic.id = apic.read_reg(IOAPICID) >> 24;
            apic.irqs = (((apic.read_reg(IOAPICVER) >> 16) & 0xFF) + 1) as u8;

            for pin in 0..apic.irqs as u32 {
                let low_index = IOREDTBL_BASE + pin * 2;
                let low = apic.read_reg(low_index);
                apic.write_reg(low_index, low | REDIR_MASKED);
            }
        }

        let mut registry = Registry {
            apics: [const { None }; MAX_IOAPICS],
        };
        registry.apics[0] = Some(apic);
        registry
    });
}

#[cfg(test)]
pub(crate) fn init_for_tests() {
    IOAPICS.call_once(|| {
        let mut registry = Registry {
            apics: [const { None }; MAX_IOAPICS],
        };
        registry.apics[0] = Some(IoApic {
            phys_addr: IOAPIC_PHYS_BASE,
            id: 0,
            irq_base: 0,
            irqs: 24,
            mmio_base: 0,
        });
        registry
    });
}

/// Programs the redirection entry for `tuple.irq` to deliver `vector` to
/// the bootstrap CPU with the tuple's polarity and trigger mode, unmasked.
pub fn route(apic: &IoApic, tuple: &IrqTuple, vector: u8) {
    #[cfg(test)]
    {
        crate::testing::ioapic::record_route(apic.id, tuple.irq, vector);
    }
    #[cfg(not(test))]
    {
        use super::isa::{Polarity, Trigger};

        let pin = (tuple.irq - apic.irq_base) as u32;
        let low_index = IOREDTBL_BASE + pin * 2;

        let mut low = vector as u32;
        if tuple.polarity == Polarity::Low {
            low |= REDIR_POLARITY_LOW;
        }
        if tuple.trigger == Trigger::Level {
            low |= REDIR_TRIGGER_LEVEL;
        }

        unsafe {
            apic.write_reg(low_index + 1, 0); // destination: APIC id 0
            apic.write_reg(low_index, low);
        }
    }
}

/// Masks the redirection entry for `tuple.irq`. Idempotent.
pub fn mask(apic: &IoApic, tuple: &IrqTuple) {
    #[cfg(test)]
    {
        crate::testing::ioapic::record_mask(apic.id, tuple.irq);
    }
    #[cfg(not(test))]
    {
        let pin = (tuple.irq - apic.irq_base) as u32;
        let low_index = IOREDTBL_BASE + pin * 2;
        unsafe {
            let low = apic.read_reg(low_index);
            apic.write_reg(low_index, low | REDIR_MASKED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_includes_both_ends() {
        let apic = IoApic {
            phys_addr: IOAPIC_PHYS_BASE,
            id: 0,
            irq_base: 8,
            irqs: 16,
            mmio_base: 0,
        };
        assert!(apic.owns(8));
        assert!(apic.owns(23));
        assert!(!apic.owns(7));
        assert!(!apic.owns(24));
    }
}
