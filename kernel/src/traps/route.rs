// =============================================================================
// Ember — Interrupt Routing
// =============================================================================
//
// Every CPU vector carries an intrusive singly-linked chain of handlers.
// Dispatch walks the chain under the read side of one process-wide rwlock,
// so concurrent dispatches never contend with each other and never touch
// an allocator. Registration and unregistration take the write side, and
// mask local interrupts first — a handler on the same core must not find
// the write lock held by the code it interrupted.
//
// Chain nodes are allocated from the kernel heap at registration time; a
// page per handler is a fine price for allocator-free dispatch.
//
// External IRQs land in the fixed vector window: vector = (irq % IRQS)
// + IRQ0. The owning I/O APIC is the one whose line range contains the
// IRQ; its redirection entry is programmed right after the handler is
// registered.
// =============================================================================

use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::memory::heap::{self, HeapFlags};
use crate::sync::intr::IntrMask;
use crate::sync::rwlock::RwLock;

use super::isa::IrqTuple;
use super::{ic, ioapic, IntrState, FAULT31, INTERRUPTS, IRQ0, IRQS, SPURIOUS};

/// A handler's identity is its code address; registering the same function
/// twice yields two chain entries.
pub type IntrHandler = fn(&IntrState);

struct HandlerNode {
    handler: IntrHandler,
    next: *mut HandlerNode,
}

struct HandlerTable {
    chains: [*mut HandlerNode; INTERRUPTS],
}

// SAFETY: chain nodes are only created/unlinked under the write lock and
// only traversed under the read lock.
unsafe impl Send for HandlerTable {}
unsafe impl Sync for HandlerTable {}

static HANDLERS: RwLock<HandlerTable> = RwLock::new(HandlerTable {
    chains: [ptr::null_mut(); INTERRUPTS],
});

/// Called by every interrupt entry stub.
///
/// Acknowledges the interrupt controller for everything above the fault
/// range except the spurious vector, then runs the vector's handlers
/// head-first. A vector with no handlers is fatal: it means the kernel
/// enabled an interrupt source nobody owns.
pub fn dispatch(state: &IntrState) {
    if state.id > FAULT31 && state.id != SPURIOUS {
        ic::ack(state.id);
    }

    let table = HANDLERS.read();
    let head = table.chains[state.id as usize];
    if head.is_null() {
        panic!("unhandled interrupt {:#04x}", state.id);
    }

    let mut node = head;
    while !node.is_null() {
        unsafe {
            ((*node).handler)(state);
            node = (*node).next;
        }
    }
}

/// Logs the interrupt controllers the routing layer will use.
pub fn init() {
    ic::print_info();
    for apic in ioapic::iter() {
        log::info!(
            " => using I/O APIC (at {:#018x}, id {:#04x}, irqs {}-{})",
            apic.phys_addr,
            apic.id,
            apic.irq_base,
            apic.irq_base as u32 + apic.irqs as u32 - 1
        );
    }
}

/// Conses a new handler node onto the vector's chain. Caller holds the
/// write lock.
fn route_locked(table: &mut HandlerTable, vector: u8, handler: IntrHandler) -> bool {
    let Some(raw) = heap::alloc(size_of::<HandlerNode>(), HeapFlags::W) else {
        return false;
    };

    let node = raw.as_ptr() as *mut HandlerNode;
    unsafe {
        ptr::write(
            node,
            HandlerNode {
                handler,
                next: table.chains[vector as usize],
            },
        );
    }
    table.chains[vector as usize] = node;
    true
}

/// Unlinks and frees the first node matching `handler`. A handler that was
/// never registered is silently ignored. Caller holds the write lock.
fn unroute_locked(table: &mut HandlerTable, vector: u8, handler: IntrHandler) {
    let mut prev: *mut HandlerNode = ptr::null_mut();
    let mut node = table.chains[vector as usize];
    while !node.is_null() {
        unsafe {
            if (*node).handler as usize == handler as usize {
                if prev.is_null() {
                    table.chains[vector as usize] = (*node).next;
                } else {
                    (*prev).next = (*node).next;
                }
                heap::free(NonNull::new_unchecked(node as *mut u8));
                return;
            }
            prev = node;
            node = (*node).next;
        }
    }
}

/// Registers `handler` on a CPU vector. Returns false if the chain node
/// cannot be allocated.
pub fn route_intr(vector: u8, handler: IntrHandler) -> bool {
    let _mask = IntrMask::lock();
    let mut table = HANDLERS.write();
    route_locked(&mut table, vector, handler)
}

/// Removes one occurrence of `handler` from a CPU vector's chain.
pub fn unroute_intr(vector: u8, handler: IntrHandler) {
    let _mask = IntrMask::lock();
    let mut table = HANDLERS.write();
    unroute_locked(&mut table, vector, handler);
}

/// Registers `handler` for an external IRQ and programs the owning I/O
/// APIC to deliver it. Returns false if no controller owns the line or the
/// chain node cannot be allocated; no state changes in either case.
pub fn route_irq(tuple: &IrqTuple, handler: IntrHandler) -> bool {
    let vector = IRQ0 + tuple.irq % IRQS;

    let _mask = IntrMask::lock();
    let mut table = HANDLERS.write();
    for apic in ioapic::iter() {
        if apic.owns(tuple.irq) {
            if !route_locked(&mut table, vector, handler) {
                return false;
            }
            ioapic::route(apic, tuple, vector);
            return true;
        }
    }
    false
}

/// Masks the IRQ at every controller owning it and removes `handler` from
/// the vector's chain. Masking twice is harmless, so overlapping
/// controller ranges only cost a redundant register write.
pub fn unroute_irq(tuple: &IrqTuple, handler: IntrHandler) {
    let vector = IRQ0 + tuple.irq % IRQS;

    let _mask = IntrMask::lock();
    let mut table = HANDLERS.write();
    for apic in ioapic::iter() {
        if apic.owns(tuple.irq) {
            ioapic::mask(apic, tuple);
        }
    }
    unroute_locked(&mut table, vector, handler);
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut table = HANDLERS.write();
    table.chains = [ptr::null_mut(); INTERRUPTS];
}
