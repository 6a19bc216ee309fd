//! Local interrupt masking.
//!
//! `IntrMask::lock` disables maskable interrupts on the current core and
//! remembers the prior state of RFLAGS.IF; dropping the guard restores it,
//! so nested masks compose correctly.
//!
//! Lock order: an `IntrMask` is always taken *before* any lock that an
//! interrupt handler on the same core may also take. Otherwise the handler
//! can re-enter the lock the interrupted code still holds and spin forever.

use crate::arch::cpu;

/// RAII guard for a masked-interrupt section on the current core.
pub struct IntrMask {
    was_enabled: bool,
}

impl IntrMask {
    /// Masks interrupts on the current core, saving the prior state.
    pub fn lock() -> Self {
        let was_enabled = cpu::interrupts_enabled();
        cpu::disable_interrupts();
        Self { was_enabled }
    }
}

impl Drop for IntrMask {
    fn drop(&mut self) {
        if self.was_enabled {
            cpu::enable_interrupts();
        }
    }
}
