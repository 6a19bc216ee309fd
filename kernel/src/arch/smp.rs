//! Per-CPU records.
//!
//! Each core owns a `CoreLocal` holding its TSS and GDT; the record is
//! published through the GS base MSR so `current()` is a single MSR read.
//! Only the bootstrap CPU is brought up here; application processors get
//! their slots when SMP bring-up installs them.

use core::ptr::addr_of_mut;

use x86_64::registers::model_specific::Msr;

use super::gdt::Gdt;
use super::tss::Tss;

/// Upper bound on supported cores.
pub const MAX_CORES: usize = 16;

const IA32_GS_BASE: u32 = 0xC000_0101;

/// Core-local data. `core_id` must stay at offset 0 for GS-relative reads.
#[repr(C)]
pub struct CoreLocal {
    pub core_id: u32,
    pub apic_id: u32,
    /// This core's TSS. The GDT's TSS descriptor points here.
    pub tss: Tss,
    /// This core's GDT.
    pub gdt: Gdt,
}

impl CoreLocal {
    const fn zeroed() -> Self {
        Self {
            core_id: 0,
            apic_id: 0,
            tss: Tss::new(),
            gdt: Gdt::zeroed(),
        }
    }
}

const ZEROED: CoreLocal = CoreLocal::zeroed();
static mut CORE_LOCALS: [CoreLocal; MAX_CORES] = [ZEROED; MAX_CORES];

/// Installs the bootstrap CPU's record: slot 0, published via GS base.
///
/// # Safety
/// Must be called exactly once, on the bootstrap CPU, before `current()`.
pub unsafe fn init_bsp() {
    unsafe {
        let record = addr_of_mut!(CORE_LOCALS[0]);
        (*record).core_id = 0;
        Msr::new(IA32_GS_BASE).write(record as u64);
    }
}

/// Returns the executing CPU's record.
///
/// Panics if no record has been installed on this core.
pub fn current() -> &'static mut CoreLocal {
    let record = unsafe { Msr::new(IA32_GS_BASE).read() } as *mut CoreLocal;
    if record.is_null() {
        panic!("per-CPU record not installed on this core");
    }
    unsafe { &mut *record }
}
