// =============================================================================
// Ember — Kernel Panic Handler
// =============================================================================
//
// A kernel panic is fatal: it means an invariant inside the trusted
// computing base was violated. We print the message and location over
// serial and halt every core. No unwinding (panic = "abort").
// =============================================================================

#![cfg(not(test))]

use core::panic::PanicInfo;

use crate::arch::cpu;
use crate::kprintln;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kprintln!();
    kprintln!("==========================================================");
    kprintln!("  KERNEL PANIC");
    kprintln!("==========================================================");

    if let Some(location) = info.location() {
        kprintln!("  Location: {}:{}", location.file(), location.line());
    } else {
        kprintln!("  Location: <unknown>");
    }

    kprintln!("  Message: {}", info.message());
    kprintln!("==========================================================");

    cpu::halt_forever()
}
