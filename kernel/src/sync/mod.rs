// =============================================================================
// Ember — Kernel Synchronization Primitives
// =============================================================================
//
// Lock ordering rules:
//   1. `intr::IntrMask` is taken before any lock shared with an interrupt
//      handler (the routing rwlock).
//   2. Spinlocks are leaf locks; never hold one across an rwlock acquire.
// =============================================================================

pub mod intr;
pub mod rwlock;
pub mod spinlock;
