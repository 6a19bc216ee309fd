//! Task State Segment (TSS) for x86_64.
//!
//! In long mode the TSS no longer stores register state for task switching;
//! it holds the RSP values used on privilege transitions, the Interrupt
//! Stack Table, and the I/O permission bitmap offset.

use core::arch::asm;
use core::mem::size_of;

use super::gdt::SLTR_TSS;
use super::smp;

/// The 64-bit Task State Segment, laid out exactly as the CPU reads it.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// Stack pointers for privilege transitions; RSP0 is used on a
    /// Ring 3 -> Ring 0 switch.
    pub rsp: [u64; 3],
    reserved1: u64,
    /// Interrupt Stack Table entries for guaranteed stack switches.
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset of the I/O permission bitmap from the TSS base. Set to
    /// `size_of::<Tss>()` to declare that no bitmap is present.
    pub iomap_base: u16,
}

impl Tss {
    /// A TSS with every field zeroed and the I/O bitmap disabled.
    pub const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }
}

/// Resets the current CPU's TSS and loads the task register with
/// `SLTR_TSS`.
///
/// The GDT must already be installed, with its TSS descriptor pointing at
/// this CPU's record. One-shot per CPU, not re-entrant.
pub fn init() {
    let core = smp::current();
    core.tss = Tss::new();

    unsafe {
        asm!(
            "ltr {sel:x}",
            sel = in(reg) SLTR_TSS,
            options(nostack, preserves_flags)
        );
    }
    log::debug!("TSS loaded for core {}", core.core_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_hardware_exact() {
        assert_eq!(size_of::<Tss>(), 104);
    }

    #[test]
    fn new_disables_iomap() {
        let tss = Tss::new();
        assert_eq!({ tss.iomap_base }, 104);
        assert_eq!({ tss.rsp }, [0; 3]);
        assert_eq!({ tss.ist }, [0; 7]);
    }
}
