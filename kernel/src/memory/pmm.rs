// =============================================================================
// Ember — Physical Memory Manager
// =============================================================================
//
// Hands out 4 KiB physical frames. Free frames form an intrusive stack:
// each free frame's first 8 bytes (reached through the HHDM window) hold
// the physical address of the next free frame. alloc() pops, free()
// pushes, both O(1) under the module spinlock.
//
// Seeded once from the Limine memory map; only USABLE regions are added.
// Frame 0 is never handed out so a zero PhysAddr can mean "none".
// =============================================================================

#[cfg(not(test))]
use crate::kprintln;
#[cfg(not(test))]
use crate::memory::address::PAGE_SIZE;
#[cfg(not(test))]
use crate::memory::address::PhysAddr;
#[cfg(not(test))]
use crate::sync::spinlock::SpinLock;

// Under test the allocator is replaced by a counter-based fake with
// failure injection; see src/testing.rs.
#[cfg(test)]
pub use crate::testing::pmm::{alloc, free};

#[cfg(not(test))]
struct FrameStack {
    /// Physical address of the top free frame, zero when empty.
    head: u64,
    free_frames: usize,
}

#[cfg(not(test))]
static FRAMES: SpinLock<FrameStack> = SpinLock::new(FrameStack {
    head: 0,
    free_frames: 0,
});

#[cfg(not(test))]
impl FrameStack {
    fn push(&mut self, frame: PhysAddr) {
        // SAFETY: `frame` is an unused, HHDM-mapped physical frame; we own
        // its contents until it is popped again.
        unsafe { *frame.to_virt().as_mut_ptr::<u64>() = self.head };
        self.head = frame.as_u64();
        self.free_frames += 1;
    }

    fn pop(&mut self) -> Option<PhysAddr> {
        if self.head == 0 {
            return None;
        }
        let frame = PhysAddr::new(self.head);
        // SAFETY: the top frame holds the next link; see push().
        self.head = unsafe { *frame.to_virt().as_ptr::<u64>() };
        self.free_frames -= 1;
        Some(frame)
    }
}

/// Seeds the allocator from the Limine memory map.
///
/// Must run exactly once during single-core boot, after the HHDM offset is
/// known.
#[cfg(not(test))]
pub fn init(memory_map: &[&limine::memory_map::Entry]) {
    let mut frames = FRAMES.lock();
    for entry in memory_map {
        if entry.entry_type != limine::memory_map::EntryType::USABLE {
            continue;
        }
        let mut frame = entry.base;
        let end = entry.base + entry.length;
        while frame + PAGE_SIZE <= end {
            if frame != 0 {
                frames.push(PhysAddr::new(frame));
            }
            frame += PAGE_SIZE;
        }
    }
    kprintln!(
        "[pmm] {} free frames ({} MiB)",
        frames.free_frames,
        frames.free_frames as u64 * PAGE_SIZE / 1024 / 1024
    );
}

/// Allocates one 4 KiB frame. Contents are uninitialized.
#[cfg(not(test))]
pub fn alloc() -> Option<PhysAddr> {
    FRAMES.lock().pop()
}

/// Returns a frame to the allocator.
#[cfg(not(test))]
pub fn free(frame: PhysAddr) {
    debug_assert!(frame.is_page_aligned() && !frame.is_zero());
    FRAMES.lock().push(frame);
}
