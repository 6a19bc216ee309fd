// =============================================================================
// Ember — Virtual Memory Manager
// =============================================================================
//
// Map and unmap single 4 KiB pages in the active address space by walking
// the 4-level page-table hierarchy (PML4 -> PDPT -> PD -> PT) through the
// HHDM window. Intermediate tables are allocated from the pmm on demand.
//
// The interface is deliberately narrow:
//   map(virt, phys, flags) -> bool       false on exhaustion / conflict
//   unmap(virt) -> Option<PhysAddr>      the frame that was mapped, if any
//
// unmap never frees the returned frame; the caller decides (it may be
// MMIO, or owned by the heap).
// =============================================================================

use bitflags::bitflags;

bitflags! {
    /// x86_64 page-table entry flags. Restrictions apply at the leaf;
    /// intermediate entries stay permissive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const HUGE_PAGE  = 1 << 7;
        const GLOBAL     = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

// Under test, map/unmap are a recording hash-map fake; see src/testing.rs.
#[cfg(test)]
pub use crate::testing::vmm::{map, unmap};

#[cfg(not(test))]
mod walk {
    use core::ptr;

    use super::PageTableFlags;
    use crate::memory::address::{PhysAddr, VirtAddr};
    use crate::memory::pmm;
    use crate::sync::spinlock::SpinLock;

    /// Mask for the 40-bit physical frame number in an entry (bits 12-51).
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// A single 8-byte page-table entry.
    #[derive(Clone, Copy)]
    #[repr(transparent)]
    struct Entry(u64);

    impl Entry {
        fn is_present(self) -> bool {
            self.0 & PageTableFlags::PRESENT.bits() != 0
        }

        fn is_huge(self) -> bool {
            self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
        }

        fn addr(self) -> PhysAddr {
            PhysAddr::new(self.0 & ADDR_MASK)
        }
    }

    /// One 4 KiB table: 512 entries.
    #[repr(C, align(4096))]
    struct Table {
        entries: [Entry; 512],
    }

    /// Serializes all page-table mutation. Leaf lock; nothing else is
    /// taken while it is held.
    static TABLE_LOCK: SpinLock<()> = SpinLock::new(());

    fn active_pml4() -> PhysAddr {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        PhysAddr::new(frame.start_address().as_u64())
    }

    unsafe fn table_mut(phys: PhysAddr) -> *mut Table {
        phys.to_virt().as_mut_ptr::<Table>()
    }

    /// Returns the table an entry points at, allocating and wiring a
    /// zeroed one if the entry is empty.
    unsafe fn next_table(entry: *mut Entry) -> Option<PhysAddr> {
        unsafe {
            if (*entry).is_present() {
                if (*entry).is_huge() {
                    return None;
                }
                return Some((*entry).addr());
            }
            let table_phys = pmm::alloc()?;
            ptr::write_bytes(table_mut(table_phys), 0, 1);
            // Intermediate entries stay permissive; the leaf restricts.
            (*entry).0 = table_phys.as_u64()
                | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits();
            Some(table_phys)
        }
    }

    /// Maps `virt` to `phys` with `flags` (PRESENT is implied).
    ///
    /// Returns false if an intermediate table cannot be allocated, a huge
    /// page is in the way, or `virt` is already mapped.
    pub fn map(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> bool {
        debug_assert!(virt.is_page_aligned() && phys.is_page_aligned());
        let _guard = TABLE_LOCK.lock();
        let [pt_i, pd_i, pdpt_i, pml4_i] = virt.page_table_indices();

        unsafe {
            let pml4 = table_mut(active_pml4());
            let Some(pdpt_phys) = next_table(&mut (*pml4).entries[pml4_i as usize]) else {
                return false;
            };
            let pdpt = table_mut(pdpt_phys);
            let Some(pd_phys) = next_table(&mut (*pdpt).entries[pdpt_i as usize]) else {
                return false;
            };
            let pd = table_mut(pd_phys);
            let Some(pt_phys) = next_table(&mut (*pd).entries[pd_i as usize]) else {
                return false;
            };
            let pt = table_mut(pt_phys);
            let leaf = &mut (*pt).entries[pt_i as usize];
            if leaf.is_present() {
                return false;
            }
            leaf.0 = phys.as_u64() | (flags | PageTableFlags::PRESENT).bits();
        }
        true
    }

    /// Unmaps `virt`, returning the frame it was mapped to. Pages that
    /// were never mapped return `None`.
    pub fn unmap(virt: VirtAddr) -> Option<PhysAddr> {
        debug_assert!(virt.is_page_aligned());
        let _guard = TABLE_LOCK.lock();
        let [pt_i, pd_i, pdpt_i, pml4_i] = virt.page_table_indices();

        let phys = unsafe {
            let pml4 = table_mut(active_pml4());
            let pml4_entry = (*pml4).entries[pml4_i as usize];
            if !pml4_entry.is_present() {
                return None;
            }
            let pdpt_entry = (*table_mut(pml4_entry.addr())).entries[pdpt_i as usize];
            if !pdpt_entry.is_present() || pdpt_entry.is_huge() {
                return None;
            }
            let pd_entry = (*table_mut(pdpt_entry.addr())).entries[pd_i as usize];
            if !pd_entry.is_present() || pd_entry.is_huge() {
                return None;
            }
            let pt = table_mut(pd_entry.addr());
            let leaf = &mut (*pt).entries[pt_i as usize];
            if !leaf.is_present() {
                return None;
            }
            let phys = leaf.addr();
            leaf.0 = 0;
            phys
        };

        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
        Some(phys)
    }
}

#[cfg(not(test))]
pub use walk::{map, unmap};
