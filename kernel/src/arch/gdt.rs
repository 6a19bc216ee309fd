//! Global Descriptor Table (GDT) for x86_64.
//!
//! In long mode most of segmentation is disabled, but a GDT is still
//! required to define code/data segments for the two privilege rings and
//! to point at the TSS. The layout is fixed:
//!
//! - 0x00: null descriptor
//! - 0x08: kernel code       - 0x10: kernel data
//! - 0x18: user code         - 0x20: user data
//! - 0x28: TSS (16-byte system descriptor, spans two slots)
//!
//! Each CPU owns its own table inside its `CoreLocal`, because the TSS
//! descriptor differs per core.

use core::arch::asm;
use core::mem::size_of;

use super::smp;
use super::tss::Tss;

/// Fixed segment selectors (byte offsets into the GDT).
#[allow(dead_code)]
pub const SLTR_NULL: u16 = 0x00;
pub const SLTR_KERNEL_CODE: u16 = 0x08;
pub const SLTR_KERNEL_DATA: u16 = 0x10;
#[allow(dead_code)]
pub const SLTR_USER_CODE: u16 = 0x18;
#[allow(dead_code)]
pub const SLTR_USER_DATA: u16 = 0x20;
pub const SLTR_TSS: u16 = 0x28;

/// Code/data gates in the table.
const GDT_GATES: usize = 5;

/// Total slots: the gates plus two for the 16-byte TSS descriptor.
const GDT_ENTRIES: usize = GDT_GATES + 2;

// Access bytes: P | DPL | S | type.
const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
const ACCESS_TSS: u8 = 0x89; // present, 64-bit TSS (available)

// High nibble of the granularity byte: G = 4 KiB granularity,
// L = 64-bit code segment, DB = 32-bit default (data).
const FLAGS_LONG_CODE: u8 = 0xA0;
const FLAGS_DATA: u8 = 0xC0;

/// An 8-byte segment descriptor. The base is split across three fields and
/// the 20-bit limit across two, exactly as the CPU reads it.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct GdtGate {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8, // flags in the high nibble, limit bits 16-19 in the low
    base_high: u8,
}

impl GdtGate {
    const NULL: Self = Self::new(0, 0, 0, 0);

    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: ((limit >> 16) & 0x0F) as u8 | (flags & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    /// The upper half of a 16-byte system descriptor: bits 0-31 hold base
    /// bits 32-63, the rest is reserved.
    const fn system_high(base: u64) -> Self {
        Self {
            limit_low: ((base >> 32) & 0xFFFF) as u16,
            base_low: ((base >> 48) & 0xFFFF) as u16,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }
}

/// Pointer operand for the `lgdt` instruction: 16-bit limit, 64-bit base.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct GdtPointer {
    limit: u16,
    base: u64,
}

/// The per-CPU descriptor table.
#[repr(C, align(16))]
pub struct Gdt {
    gates: [GdtGate; GDT_ENTRIES],
}

impl Gdt {
    /// An all-null table; built properly by `new` during init.
    pub const fn zeroed() -> Self {
        Self {
            gates: [GdtGate::NULL; GDT_ENTRIES],
        }
    }

    /// Builds the table, with the TSS descriptor pointing at `tss`.
    pub fn new(tss: &Tss) -> Self {
        let tss_base = tss as *const Tss as u64;
        let tss_limit = (size_of::<Tss>() - 1) as u32;

        Self {
            gates: [
                GdtGate::NULL,
                GdtGate::new(0, 0xFFFFF, ACCESS_KERNEL_CODE, FLAGS_LONG_CODE),
                GdtGate::new(0, 0xFFFFF, ACCESS_KERNEL_DATA, FLAGS_DATA),
                GdtGate::new(0, 0xFFFFF, ACCESS_USER_CODE, FLAGS_LONG_CODE),
                GdtGate::new(0, 0xFFFFF, ACCESS_USER_DATA, FLAGS_DATA),
                GdtGate::new(tss_base as u32, tss_limit, ACCESS_TSS, 0),
                GdtGate::system_high(tss_base),
            ],
        }
    }

    /// Loads this table and switches to its segments: `lgdt`, a far return
    /// to reload CS with `SLTR_KERNEL_CODE`, then the data segment
    /// registers with `SLTR_KERNEL_DATA`.
    ///
    /// # Safety
    /// The table must stay valid for the lifetime of the CPU (it lives in
    /// the static per-CPU records, so it does).
    pub unsafe fn load(&self) {
        let ptr = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );

            // Reload CS by pushing the new selector and far-returning.
            asm!(
                "push {sel}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                sel = in(reg) SLTR_KERNEL_CODE as u64,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) SLTR_KERNEL_DATA,
                options(nostack, preserves_flags)
            );
        }
    }
}

/// Builds and installs the current CPU's GDT.
///
/// One-shot per CPU, not re-entrant. Panics if the per-CPU record has not
/// been installed yet.
pub fn init() {
    let core = smp::current();
    core.gdt = Gdt::new(&core.tss);
    unsafe { core.gdt.load() };
    log::debug!(
        "GDT loaded (cs={:#04x}, ds={:#04x}, tss={:#04x})",
        SLTR_KERNEL_CODE,
        SLTR_KERNEL_DATA,
        SLTR_TSS
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_as_u64(gate: GdtGate) -> u64 {
        // SAFETY: GdtGate is 8 packed bytes.
        unsafe { core::mem::transmute(gate) }
    }

    #[test]
    fn record_sizes_are_hardware_exact() {
        assert_eq!(size_of::<GdtGate>(), 8);
        assert_eq!(size_of::<GdtPointer>(), 10);
        assert_eq!(size_of::<Gdt>(), GDT_ENTRIES * 8);
    }

    #[test]
    fn selectors_are_consecutive_slots() {
        assert_eq!(SLTR_NULL, 0x00);
        assert_eq!(SLTR_KERNEL_CODE, 0x08);
        assert_eq!(SLTR_KERNEL_DATA, 0x10);
        assert_eq!(SLTR_USER_CODE, 0x18);
        assert_eq!(SLTR_USER_DATA, 0x20);
        assert_eq!(SLTR_TSS, 0x28);
    }

    #[test]
    fn code_and_data_gate_encoding() {
        let kcode = GdtGate::new(0, 0xFFFFF, ACCESS_KERNEL_CODE, FLAGS_LONG_CODE);
        let kdata = GdtGate::new(0, 0xFFFFF, ACCESS_KERNEL_DATA, FLAGS_DATA);
        let ucode = GdtGate::new(0, 0xFFFFF, ACCESS_USER_CODE, FLAGS_LONG_CODE);
        assert_eq!(gate_as_u64(kcode), 0x00AF_9A00_0000_FFFF);
        assert_eq!(gate_as_u64(kdata), 0x00CF_9200_0000_FFFF);
        assert_eq!(gate_as_u64(ucode), 0x00AF_FA00_0000_FFFF);
    }

    #[test]
    fn tss_descriptor_splits_base() {
        let base: u64 = 0xFFFF_8000_DEAD_B000;
        let limit = (size_of::<Tss>() - 1) as u32;
        let low = GdtGate::new(base as u32, limit, ACCESS_TSS, 0);
        let high = GdtGate::system_high(base);

        let low_bits = gate_as_u64(low);
        assert_eq!(low_bits & 0xFFFF, limit as u64); // limit 0-15
        assert_eq!((low_bits >> 16) & 0xFFFF, 0xB000); // base 0-15
        assert_eq!((low_bits >> 32) & 0xFF, 0xAD); // base 16-23
        assert_eq!((low_bits >> 40) & 0xFF, ACCESS_TSS as u64);
        assert_eq!((low_bits >> 56) & 0xFF, 0xDE); // base 24-31

        assert_eq!(gate_as_u64(high) & 0xFFFF_FFFF, 0xFFFF_8000);
    }
}
