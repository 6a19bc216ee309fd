//! Host-side test support.
//!
//! The hardware seams (pmm, vmm, local APIC, I/O APIC) swap to the
//! recording fakes below under `cfg(test)`, so the heap and the interrupt
//! routing logic run unmodified on the host. The "virtual" heap range used
//! by tests is an ordinary page-aligned host allocation, so header writes
//! through raw pointers hit real memory.
//!
//! Tests that touch process-wide state (the heap, the routing table, the
//! fake counters) take `serialize()` first.

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that share global kernel state.
pub fn serialize() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resets the memory fakes and re-initializes the global heap over a fresh
/// page-aligned host region of `pages` pages (header page included).
/// Returns the region's base, i.e. the root header address.
pub fn setup_heap(pages: usize) -> VirtAddr {
    pmm::reset();
    vmm::reset();

    let bytes = pages * PAGE_SIZE as usize;
    let layout = Layout::from_size_align(bytes, PAGE_SIZE as usize).unwrap();
    // Leaked on purpose: freed node headers may be inspected after a test.
    let region = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!region.is_null(), "test region allocation failed");

    let start = VirtAddr::new(region as u64);
    crate::memory::heap::init_for_tests(start, start + pages as u64 * PAGE_SIZE);
    start
}

/// Counter-based physical frame allocator with failure injection.
pub mod pmm {
    use super::*;

    struct State {
        next: u64,
        /// Remaining successful allocations; `None` means unlimited.
        remaining: Option<usize>,
        outstanding: HashSet<u64>,
    }

    static STATE: LazyLock<Mutex<State>> = LazyLock::new(|| {
        Mutex::new(State {
            next: 0x1000_0000,
            remaining: None,
            outstanding: HashSet::new(),
        })
    });

    pub fn reset() {
        let mut state = STATE.lock().unwrap();
        state.next = 0x1000_0000;
        state.remaining = None;
        state.outstanding.clear();
    }

    /// The next `n` allocations succeed; every one after that fails.
    pub fn fail_after(n: usize) {
        STATE.lock().unwrap().remaining = Some(n);
    }

    pub fn alloc() -> Option<PhysAddr> {
        let mut state = STATE.lock().unwrap();
        if let Some(remaining) = state.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        state.next += PAGE_SIZE;
        let frame = state.next;
        state.outstanding.insert(frame);
        Some(PhysAddr::new(frame))
    }

    pub fn free(frame: PhysAddr) {
        let mut state = STATE.lock().unwrap();
        assert!(
            state.outstanding.remove(&frame.as_u64()),
            "freed frame {} that was not outstanding",
            frame
        );
    }

    /// True when every outstanding frame is accounted for by a live
    /// mapping — i.e. nothing leaked and nothing was double-freed.
    pub fn all_frames_returned() -> bool {
        let outstanding = STATE.lock().unwrap().outstanding.clone();
        outstanding == super::vmm::mapped_frames()
    }
}

/// Hash-map page mapper.
pub mod vmm {
    use super::*;
    use crate::memory::vmm::PageTableFlags;

    static MAPPINGS: LazyLock<Mutex<HashMap<u64, u64>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    pub fn reset() {
        MAPPINGS.lock().unwrap().clear();
    }

    pub fn map(virt: VirtAddr, phys: PhysAddr, _flags: PageTableFlags) -> bool {
        let mut mappings = MAPPINGS.lock().unwrap();
        if mappings.contains_key(&virt.as_u64()) {
            return false;
        }
        mappings.insert(virt.as_u64(), phys.as_u64());
        true
    }

    pub fn unmap(virt: VirtAddr) -> Option<PhysAddr> {
        MAPPINGS
            .lock()
            .unwrap()
            .remove(&virt.as_u64())
            .map(PhysAddr::new)
    }

    pub fn is_mapped(virt: u64) -> bool {
        MAPPINGS.lock().unwrap().contains_key(&virt)
    }

    pub fn mapping_count() -> usize {
        MAPPINGS.lock().unwrap().len()
    }

    pub fn mapped_frames() -> HashSet<u64> {
        MAPPINGS.lock().unwrap().values().copied().collect()
    }
}

/// Interrupt-controller acknowledge log.
pub mod ic {
    use super::*;

    static ACKS: LazyLock<Mutex<Vec<u8>>> = LazyLock::new(|| Mutex::new(Vec::new()));

    pub fn reset() {
        ACKS.lock().unwrap().clear();
    }

    pub fn record_ack(vector: u8) {
        ACKS.lock().unwrap().push(vector);
    }

    pub fn acks() -> Vec<u8> {
        ACKS.lock().unwrap().clone()
    }
}

/// I/O APIC programming log: (apic id, irq, vector) routes and
/// (apic id, irq) masks.
pub mod ioapic {
    use super::*;

    static ROUTES: LazyLock<Mutex<Vec<(u32, u8, u8)>>> = LazyLock::new(|| Mutex::new(Vec::new()));
    static MASKS: LazyLock<Mutex<Vec<(u32, u8)>>> = LazyLock::new(|| Mutex::new(Vec::new()));

    pub fn reset() {
        ROUTES.lock().unwrap().clear();
        MASKS.lock().unwrap().clear();
    }

    pub fn record_route(apic_id: u32, irq: u8, vector: u8) {
        ROUTES.lock().unwrap().push((apic_id, irq, vector));
    }

    pub fn record_mask(apic_id: u32, irq: u8) {
        MASKS.lock().unwrap().push((apic_id, irq));
    }

    pub fn routes() -> Vec<(u32, u8, u8)> {
        ROUTES.lock().unwrap().clone()
    }

    pub fn masks() -> Vec<(u32, u8)> {
        MASKS.lock().unwrap().clone()
    }
}
