#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]

mod arch;
mod memory;
mod sync;
#[cfg(test)]
mod testing;
mod traps;
mod util;

use limine::request::{HhdmRequest, MemoryMapRequest};
use limine::BaseRevision;

/// Base revision supported by this kernel.
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Where Limine mapped all physical memory.
#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// The physical memory map.
#[used]
#[link_section = ".limine_requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Kernel entry point called by the Limine bootloader.
#[cfg(not(test))]
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    assert!(BASE_REVISION.is_supported());
    kmain()
}

#[cfg(not(test))]
fn kmain() -> ! {
    util::logger::init();
    log::info!("ember booting");

    let hhdm = HHDM_REQUEST
        .get_response()
        .expect("Limine HHDM response missing")
        .offset();
    unsafe { memory::address::init_hhdm(hhdm) };

    // Processor state first: per-CPU record, segments, task register,
    // interrupt descriptors.
    unsafe { arch::smp::init_bsp() };
    arch::gdt::init();
    arch::tss::init();
    traps::idt::init();

    // Memory: frames, then the kernel heap on top.
    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Limine memory map response missing")
        .entries();
    memory::pmm::init(memory_map);
    memory::heap::init();

    // Interrupt plumbing: sources, controllers, routing.
    traps::isa::init();
    traps::ic::init();
    traps::ioapic::init();
    traps::route::init();

    // The local APIC can deliver the spurious vector on its own, so it
    // needs a handler before the interrupt flag goes up. Every external
    // line stays masked until a driver routes it.
    if !traps::route::route_intr(traps::SPURIOUS, spurious_intr) {
        panic!("couldn't route the spurious interrupt handler");
    }

    arch::cpu::enable_interrupts();
    log::info!("boot complete");

    loop {
        arch::cpu::halt();
    }
}

/// The spurious vector carries no work, and dispatch already skips the
/// EOI for it; there is nothing to do beyond noting it happened.
#[cfg(not(test))]
fn spurious_intr(_state: &traps::IntrState) {
    log::trace!("spurious interrupt");
}
