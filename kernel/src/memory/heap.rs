// =============================================================================
// Ember — Kernel Heap
// =============================================================================
//
// A page-granular, first-fit allocator over the contiguous virtual range
// [heap_start, VM_STACK_OFFSET), where heap_start is the 2 MiB-aligned end
// of the kernel image.
//
// Every region is described by a HeapNode living in the single page
// immediately before the region's data:
//
//     ... | header | data ............ | header | data ...... | ...
//           ^ node          ^ node.start..node.end
//
// The nodes form a doubly-linked list in ascending address order covering
// the whole heap range with no gaps: prev.end == header address, and
// header address + PAGE_SIZE == start. Adjacent FREE nodes are merged on
// free, so fragmentation only comes from live regions.
//
// States:
//   FREE      — header mapped, interior unmapped, available
//   RESERVED  — handed out by reserve(); the caller manages backing
//   ALLOCATED — handed out by alloc(); interior pages are mapped to
//               pmm-owned frames that free() must release
//
// Every entry point holds the single heap spinlock for the whole
// operation. The heap must not be used from interrupt context.
// =============================================================================

use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::memory::address::{VirtAddr, PAGE_SIZE};
use crate::memory::vmm::PageTableFlags;
use crate::memory::{align_up, pmm, vmm};
use crate::sync::spinlock::SpinLock;

bitflags! {
    /// Allocation flags for `alloc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// The region is writable.
        const W = 1 << 0;
        /// The region is executable.
        const X = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    Reserved,
    Allocated,
}

/// Region descriptor, stored in the page right before the region.
#[repr(C)]
struct HeapNode {
    prev: *mut HeapNode,
    next: *mut HeapNode,
    state: NodeState,
    /// First data page, inclusive. Always header address + PAGE_SIZE.
    start: VirtAddr,
    /// End of the data region, exclusive.
    end: VirtAddr,
}

/// Page-table flags for heap node headers.
const HEADER_FLAGS: PageTableFlags = PageTableFlags::WRITABLE.union(PageTableFlags::NO_EXECUTE);

struct Heap {
    root: *mut HeapNode,
}

// SAFETY: the node list is only touched while holding the HEAP spinlock.
unsafe impl Send for Heap {}

static HEAP: SpinLock<Heap> = SpinLock::new(Heap {
    root: ptr::null_mut(),
});

impl Heap {
    /// Creates the single root FREE node spanning the whole heap range.
    unsafe fn init(&mut self, start: VirtAddr, end: VirtAddr) -> Result<(), &'static str> {
        // The range must at least fit the root header and one data page.
        if start.as_u64() + 2 * PAGE_SIZE > end.as_u64() {
            return Err("no room for the kernel heap");
        }

        let root_phy = pmm::alloc().ok_or("no physical frame for the heap root node")?;
        if !vmm::map(start, root_phy, HEADER_FLAGS) {
            pmm::free(root_phy);
            return Err("couldn't map the heap root node");
        }

        let root = start.as_mut_ptr::<HeapNode>();
        unsafe {
            ptr::write(
                root,
                HeapNode {
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                    state: NodeState::Free,
                    start: start + PAGE_SIZE,
                    end,
                },
            );
        }
        self.root = root;
        Ok(())
    }

    /// First-fit search for a FREE node of at least `size` bytes, splitting
    /// off the surplus when it is worth a new header page. The chosen node
    /// is marked RESERVED.
    unsafe fn find_node(&mut self, size: u64) -> Option<NonNull<HeapNode>> {
        let mut cur = self.root;
        while !cur.is_null() {
            unsafe {
                if (*cur).state != NodeState::Free {
                    cur = (*cur).next;
                    continue;
                }

                let node_size = (*cur).end - (*cur).start;
                if node_size < size {
                    cur = (*cur).next;
                    continue;
                }

                // Splitting pays off only if the surplus covers the new
                // header page plus at least one data page. Failing to
                // split is not an error; the caller just gets the
                // oversized node.
                if node_size - size >= 2 * PAGE_SIZE {
                    split_node(cur, size);
                }

                (*cur).state = NodeState::Reserved;
            }
            return NonNull::new(cur);
        }
        None
    }

    /// Releases a node: unmaps ALLOCATED backing, marks it FREE, and
    /// merges with FREE neighbors in both directions.
    unsafe fn free_node(&mut self, node: *mut HeapNode) {
        unsafe {
            // Release the backing frames if alloc() created them. Pages
            // the rolled-back allocation never mapped return None.
            if (*node).state == NodeState::Allocated {
                let mut page = (*node).start;
                while page < (*node).end {
                    if let Some(phy) = vmm::unmap(page) {
                        pmm::free(phy);
                    }
                    page = page + PAGE_SIZE;
                }
            }

            (*node).state = NodeState::Free;

            // Absorb the next node if it is free; its header page goes
            // back to the pmm.
            let next = (*node).next;
            if !next.is_null() && (*next).state == NodeState::Free {
                (*node).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = node;
                }
                (*node).end = (*next).end;

                if let Some(phy) = vmm::unmap(VirtAddr::new(next as u64)) {
                    pmm::free(phy);
                }
            }

            // Absorb this node into a free predecessor; now it is this
            // node's own header page that goes back.
            let prev = (*node).prev;
            if !prev.is_null() && (*prev).state == NodeState::Free {
                (*prev).next = (*node).next;
                if !(*node).next.is_null() {
                    (*(*node).next).prev = prev;
                }
                (*prev).end = (*node).end;

                if let Some(phy) = vmm::unmap(VirtAddr::new(node as u64)) {
                    pmm::free(phy);
                }
            }
        }
    }

    /// Common path for reserve() and alloc().
    unsafe fn allocate(&mut self, size: usize, flags: HeapFlags, backed: bool) -> Option<NonNull<u8>> {
        // A zero-byte request still occupies one page.
        let size = align_up((size.max(1)) as u64, PAGE_SIZE);

        let node = unsafe { self.find_node(size)?.as_ptr() };

        if backed {
            unsafe {
                // ALLOCATED from here on, so a rollback through free_node
                // releases whatever the loop below managed to map.
                (*node).state = NodeState::Allocated;

                let mut map_flags = PageTableFlags::empty();
                if flags.contains(HeapFlags::W) {
                    map_flags |= PageTableFlags::WRITABLE;
                }
                if !flags.contains(HeapFlags::X) {
                    map_flags |= PageTableFlags::NO_EXECUTE;
                }

                let end = (*node).start + size;
                let mut page = (*node).start;
                while page < end {
                    let Some(phy) = pmm::alloc() else {
                        self.free_node(node);
                        return None;
                    };
                    if !vmm::map(page, phy, map_flags) {
                        pmm::free(phy);
                        self.free_node(node);
                        return None;
                    }
                    page = page + PAGE_SIZE;
                }
            }
        }

        // The usable region starts right after the header page.
        NonNull::new((node as *mut u8).wrapping_add(PAGE_SIZE as usize))
    }
}

/// Splits `node` at `size` bytes by conjuring a new FREE node whose header
/// sits at `node.start + size`. Needs one frame for the new header; if the
/// pmm or the mapping fails the node is simply left oversized.
unsafe fn split_node(node: *mut HeapNode, size: u64) {
    let Some(phy) = pmm::alloc() else { return };

    let header = VirtAddr::new(node as u64) + PAGE_SIZE + size;
    if !vmm::map(header, phy, HEADER_FLAGS) {
        pmm::free(phy);
        return;
    }

    let new = header.as_mut_ptr::<HeapNode>();
    unsafe {
        ptr::write(
            new,
            HeapNode {
                prev: node,
                next: (*node).next,
                state: NodeState::Free,
                start: header + PAGE_SIZE,
                end: (*node).end,
            },
        );

        (*node).end = header;
        (*node).next = new;
        if !(*new).next.is_null() {
            (*(*new).next).prev = new;
        }
    }
}

/// Initializes the heap over [2 MiB-aligned kernel image end,
/// VM_STACK_OFFSET). Panics if the root node cannot be created; a kernel
/// without a heap cannot boot.
#[cfg(not(test))]
pub fn init() {
    use crate::memory::address::HUGE_PAGE_SIZE;
    use crate::memory::VM_STACK_OFFSET;

    extern "C" {
        static _end: u8;
    }

    let image_end = unsafe { &_end as *const u8 as u64 };
    let start = VirtAddr::new(align_up(image_end, HUGE_PAGE_SIZE));
    let end = VirtAddr::new(VM_STACK_OFFSET);

    let mut heap = HEAP.lock();
    unsafe { heap.init(start, end) }.unwrap_or_else(|msg| panic!("heap: {}", msg));
    log::info!("kernel heap spans {} - {}", start, end);
}

/// Reserves a page-aligned virtual region of at least `size` bytes without
/// any physical backing; the caller manages its own frames.
///
/// Returns the address right after the region's header page, or `None` if
/// the heap is exhausted.
pub fn reserve(size: usize) -> Option<NonNull<u8>> {
    let mut heap = HEAP.lock();
    unsafe { heap.allocate(size, HeapFlags::empty(), false) }
}

/// Allocates a page-aligned region of at least `size` bytes, backed by
/// freshly mapped pmm frames. `W` makes it writable; without `X` it is
/// mapped no-execute.
///
/// On pmm or vmm failure every page mapped so far is rolled back and
/// `None` is returned.
pub fn alloc(size: usize, flags: HeapFlags) -> Option<NonNull<u8>> {
    let mut heap = HEAP.lock();
    unsafe { heap.allocate(size, flags, true) }
}

/// Releases a region previously returned by `reserve` or `alloc`.
pub fn free(ptr: NonNull<u8>) {
    let mut heap = HEAP.lock();
    let node = (ptr.as_ptr() as u64 - PAGE_SIZE) as *mut HeapNode;
    unsafe { heap.free_node(node) };
}

#[cfg(test)]
pub(crate) fn init_for_tests(start: VirtAddr, end: VirtAddr) {
    let mut heap = HEAP.lock();
    heap.root = ptr::null_mut();
    unsafe { heap.init(start, end) }.expect("test heap init failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    /// Walks the node list and returns (state, start, end) per node,
    /// asserting the structural invariants along the way.
    fn snapshot() -> Vec<(NodeState, u64, u64)> {
        let heap = HEAP.lock();
        let mut nodes = Vec::new();
        let mut cur = heap.root;
        let mut prev: *mut HeapNode = ptr::null_mut();
        while !cur.is_null() {
            unsafe {
                assert_eq!((*cur).prev, prev, "broken back link");
                assert_eq!(
                    (*cur).start.as_u64(),
                    cur as u64 + PAGE_SIZE,
                    "header page must immediately precede the region"
                );
                if !prev.is_null() {
                    assert_eq!(
                        (*prev).end.as_u64(),
                        cur as u64,
                        "gap between adjacent nodes"
                    );
                }
                nodes.push(((*cur).state, (*cur).start.as_u64(), (*cur).end.as_u64()));
                prev = cur;
                cur = (*cur).next;
            }
        }
        nodes
    }

    fn assert_no_adjacent_free() {
        let nodes = snapshot();
        for pair in nodes.windows(2) {
            assert!(
                !(pair[0].0 == NodeState::Free && pair[1].0 == NodeState::Free),
                "adjacent FREE nodes survived a free"
            );
        }
    }

    #[test]
    fn reserve_free_reuse_same_address() {
        let _guard = testing::serialize();
        let start = testing::setup_heap(64);

        let p = reserve(8192).expect("reserve failed");
        assert_eq!(p.as_ptr() as u64 % PAGE_SIZE, 0);
        assert_eq!(p.as_ptr() as u64, start.as_u64() + PAGE_SIZE);

        free(p);
        let again = reserve(8192).expect("second reserve failed");
        assert_eq!(again.as_ptr(), p.as_ptr());
    }

    #[test]
    fn zero_byte_request_rounds_to_one_page() {
        let _guard = testing::serialize();
        testing::setup_heap(64);

        let p = alloc(0, HeapFlags::empty()).expect("alloc failed");
        let nodes = snapshot();
        assert_eq!(nodes[0].0, NodeState::Allocated);
        assert_eq!(nodes[0].2 - nodes[0].1, PAGE_SIZE);
        free(p);
    }

    #[test]
    fn split_happens_exactly_at_two_page_slack() {
        let _guard = testing::serialize();
        // Region: root header + 4 data pages.
        testing::setup_heap(5);

        // Slack after a 2-page reservation is exactly 2 pages: split.
        let p = reserve(2 * PAGE_SIZE as usize).expect("reserve failed");
        assert_eq!(snapshot().len(), 2);
        free(p);

        // 3-page reservation leaves 1 page of slack: no split.
        let p = reserve(3 * PAGE_SIZE as usize).expect("reserve failed");
        assert_eq!(snapshot().len(), 1);
        free(p);
    }

    #[test]
    fn alloc_maps_and_free_releases_every_frame() {
        let _guard = testing::serialize();
        testing::setup_heap(64);

        let p = alloc(3 * PAGE_SIZE as usize, HeapFlags::W).expect("alloc failed");
        let base = p.as_ptr() as u64;
        for page in 0..3 {
            assert!(testing::vmm::is_mapped(base + page * PAGE_SIZE));
        }

        // Backed pages are writable for real in the test process.
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 3 * PAGE_SIZE as usize) };

        free(p);
        for page in 0..3 {
            assert!(!testing::vmm::is_mapped(base + page * PAGE_SIZE));
        }
        assert!(testing::pmm::all_frames_returned());
        assert_no_adjacent_free();
    }

    #[test]
    fn alloc_rolls_back_on_frame_exhaustion() {
        let _guard = testing::serialize();
        testing::setup_heap(64);
        let mapped_before = testing::vmm::mapping_count();

        // Enough frames for the split header plus 3 of the 4 data pages.
        testing::pmm::fail_after(4);
        let result = alloc(4 * PAGE_SIZE as usize, HeapFlags::W);
        assert!(result.is_none());

        // No partial mapping survives the rollback.
        assert_eq!(testing::vmm::mapping_count(), mapped_before);
        assert!(testing::pmm::all_frames_returned());
        assert_no_adjacent_free();
    }

    #[test]
    fn neighbors_coalesce_into_root() {
        let _guard = testing::serialize();
        let start = testing::setup_heap(64);
        let initial_end = snapshot()[0].2;

        let p1 = reserve(PAGE_SIZE as usize).expect("reserve p1");
        let p2 = reserve(PAGE_SIZE as usize).expect("reserve p2");
        assert_eq!(snapshot().len(), 3);

        free(p1);
        free(p2);

        let nodes = snapshot();
        assert_eq!(nodes.len(), 1, "coalescing must leave a single node");
        assert_eq!(nodes[0].0, NodeState::Free);
        assert_eq!(nodes[0].1, start.as_u64() + PAGE_SIZE);
        assert_eq!(nodes[0].2, initial_end);
        assert!(testing::pmm::all_frames_returned());
    }

    #[test]
    fn free_regions_after_alloc_are_a_superset() {
        let _guard = testing::serialize();
        testing::setup_heap(64);
        let free_before: Vec<_> = snapshot()
            .into_iter()
            .filter(|n| n.0 == NodeState::Free)
            .collect();

        let p = alloc(2 * PAGE_SIZE as usize, HeapFlags::W | HeapFlags::X).expect("alloc");
        free(p);

        let free_after: Vec<_> = snapshot()
            .into_iter()
            .filter(|n| n.0 == NodeState::Free)
            .collect();
        for region in &free_before {
            assert!(
                free_after
                    .iter()
                    .any(|a| a.1 <= region.1 && region.2 <= a.2),
                "free region {:?} lost after alloc/free round trip",
                region
            );
        }
    }

    #[test]
    fn exhausted_heap_returns_none() {
        let _guard = testing::serialize();
        // Root header + 4 data pages; nothing can hold 8 pages.
        testing::setup_heap(5);
        assert!(reserve(8 * PAGE_SIZE as usize).is_none());
    }
}
