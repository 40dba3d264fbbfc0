//! Address walks: guest-physical through EPT, guest-virtual through the
//! guest's own 4-level paging, and their composition.
//!
//! Both walks return `None` as soon as an entry lacks its present bits: any
//! of R/W/X for an EPT entry, bit 0 for a guest entry. Guest PDPTEs and PDEs
//! with the page-size bit terminate the walk early, contributing 30 or 21
//! low bits of the virtual address.

use super::ept::{pd_index, pdpt_index, pml4_index, pt_index, EptPointer, ENTRY_ADDR_MASK};
use crate::memory::{Gpa, Gva, HostMemory, Hpa, Hva};

const PAGE_OFFSET_MASK: u64 = 0xfff;
const HUGE_1G_OFFSET_MASK: u64 = (1 << 30) - 1;
const HUGE_2M_OFFSET_MASK: u64 = (1 << 21) - 1;

const GUEST_ENTRY_PRESENT: u64 = 1 << 0;
const GUEST_ENTRY_PAGE_SIZE: u64 = 1 << 7;

fn read_entry<M: HostMemory>(mem: &M, table: Hpa, index: usize) -> u64 {
    let table = mem.phys_to_virt(table);
    // Safety: the table frame is owned by the hierarchy being walked and is
    // mapped by the host linear map.
    unsafe { *table.as_ptr::<u64>().add(index) }
}

/// Walks EPT: guest-physical to host-physical.
pub(crate) fn ept_translate<M: HostMemory>(mem: &M, eptp: EptPointer, gpa: Gpa) -> Option<Hpa> {
    let addr = gpa.u64();
    let mut table = eptp.pml4();
    for index in [
        pml4_index(addr),
        pdpt_index(addr),
        pd_index(addr),
        pt_index(addr),
    ] {
        let entry = read_entry(mem, table, index);
        if entry & 0b111 == 0 {
            return None;
        }
        table = Hpa::new(entry & ENTRY_ADDR_MASK);
    }
    Some(table.add(addr & PAGE_OFFSET_MASK))
}

/// Guest-physical to host-virtual, for reading guest memory from the host.
pub(crate) fn gpa_to_hva<M: HostMemory>(mem: &M, eptp: EptPointer, gpa: Gpa) -> Option<Hva> {
    ept_translate(mem, eptp, gpa).map(|hpa| mem.phys_to_virt(hpa))
}

/// Walks the guest's 4-level paging: guest-virtual to guest-physical.
///
/// Each guest table is itself reached through EPT. Only 64-bit paging is
/// understood, which is all this hypervisor ever runs.
pub(crate) fn gva_to_gpa<M: HostMemory>(
    mem: &M,
    eptp: EptPointer,
    guest_cr3: u64,
    gva: Gva,
) -> Option<Gpa> {
    let addr = gva.u64();
    let read = |table_gpa: u64, index: usize| -> Option<u64> {
        let hva = gpa_to_hva(mem, eptp, Gpa::new(table_gpa))?;
        // Safety: the translated frame lies inside guest memory owned by the
        // VMM for the VM's whole lifetime.
        Some(unsafe { *hva.as_ptr::<u64>().add(index) })
    };

    let pml4e = read(guest_cr3 & ENTRY_ADDR_MASK, pml4_index(addr))?;
    if pml4e & GUEST_ENTRY_PRESENT == 0 {
        return None;
    }

    let pdpte = read(pml4e & ENTRY_ADDR_MASK, pdpt_index(addr))?;
    if pdpte & GUEST_ENTRY_PRESENT == 0 {
        return None;
    }
    if pdpte & GUEST_ENTRY_PAGE_SIZE != 0 {
        return Some(Gpa::new((pdpte & ENTRY_ADDR_MASK) + (addr & HUGE_1G_OFFSET_MASK)));
    }

    let pde = read(pdpte & ENTRY_ADDR_MASK, pd_index(addr))?;
    if pde & GUEST_ENTRY_PRESENT == 0 {
        return None;
    }
    if pde & GUEST_ENTRY_PAGE_SIZE != 0 {
        return Some(Gpa::new((pde & ENTRY_ADDR_MASK) + (addr & HUGE_2M_OFFSET_MASK)));
    }

    let pte = read(pde & ENTRY_ADDR_MASK, pt_index(addr))?;
    if pte & GUEST_ENTRY_PRESENT == 0 {
        return None;
    }
    Some(Gpa::new((pte & ENTRY_ADDR_MASK) + (addr & PAGE_OFFSET_MASK)))
}

/// Guest-virtual to host-virtual: the composition of the two walks.
pub(crate) fn gva_to_hva<M: HostMemory>(
    mem: &M,
    eptp: EptPointer,
    guest_cr3: u64,
    gva: Gva,
) -> Option<Hva> {
    let gpa = gva_to_gpa(mem, eptp, guest_cr3, gva)?;
    gpa_to_hva(mem, eptp, gpa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::vmx::ept::EptMapping;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    /// Builds an EPT over arena-backed "guest memory" so guest page tables
    /// can actually be written and walked. Returns the mapping and the HVA
    /// of guest-physical 0.
    fn guest_memory(mem: &FakeMemory, pages: usize) -> (EptMapping<'_, FakeMemory>, Hva) {
        let base = mem.alloc_pages(pages).unwrap();
        let host_start = mem.virt_to_phys(base);
        let host_end = Hpa::new(host_start.u64() + pages as u64 * 0x1000);
        let ept = EptMapping::build(mem, host_start, host_end, Gpa::new(0)).unwrap();
        (ept, base)
    }

    fn write_guest_u64(guest_base: Hva, gpa: u64, index: usize, value: u64) {
        unsafe {
            *guest_base.add(gpa).as_mut_ptr::<u64>().add(index) = value;
        }
    }

    #[test]
    fn huge_1g_pdpte_terminates_the_walk() {
        let mem = FakeMemory::new(64);
        let (ept, guest) = guest_memory(&mem, 16);

        // CR3 at 0x1000, PML4[0] -> 0x2000, PDPT[1] huge, mapping the
        // second gigabyte of virtual space onto GPA 0x3000000.
        write_guest_u64(guest, 0x1000, 0, 0x2007);
        write_guest_u64(guest, 0x2000, 1, 0x300_0087);

        assert_eq!(
            gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(0x4000_0123)),
            Some(Gpa::new(0x300_0123))
        );
        assert_eq!(
            gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(GIB + GIB - 1)),
            Some(Gpa::new(0x300_0000 + GIB - 1))
        );
        // The neighboring PDPT entry is absent.
        assert_eq!(gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(2 * GIB)), None);
    }

    #[test]
    fn huge_2m_pde_terminates_the_walk() {
        let mem = FakeMemory::new(64);
        let (ept, guest) = guest_memory(&mem, 16);

        write_guest_u64(guest, 0x1000, 0, 0x2007);
        write_guest_u64(guest, 0x2000, 0, 0x3007);
        // PD[3]: 2 MiB page at GPA 0xc00000.
        write_guest_u64(guest, 0x3000, 3, 0xc0_0087);

        for delta in [0u64, 0x123, MIB, 2 * MIB - 1] {
            assert_eq!(
                gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(3 * 2 * MIB + delta)),
                Some(Gpa::new(0xc0_0000 + delta)),
                "delta {delta:#x}"
            );
        }
        assert_eq!(
            gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(4 * 2 * MIB)),
            None
        );
    }

    #[test]
    fn four_level_walk_reaches_the_page() {
        let mem = FakeMemory::new(64);
        let (ept, guest) = guest_memory(&mem, 16);

        write_guest_u64(guest, 0x1000, 0, 0x2007);
        write_guest_u64(guest, 0x2000, 0, 0x3007);
        write_guest_u64(guest, 0x3000, 0, 0x4007);
        write_guest_u64(guest, 0x4000, 5, 0x5003);

        assert_eq!(
            gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(0x5abc)),
            Some(Gpa::new(0x5abc))
        );
        // Non-present PTE.
        assert_eq!(gva_to_gpa(&mem, ept.eptp(), 0x1000, Gva::new(0x6000)), None);
    }

    #[test]
    fn gva_to_hva_composes_both_walks() {
        let mem = FakeMemory::new(64);
        let (ept, guest) = guest_memory(&mem, 16);

        write_guest_u64(guest, 0x1000, 0, 0x2007);
        write_guest_u64(guest, 0x2000, 0, 0x3007);
        write_guest_u64(guest, 0x3000, 0, 0x4007);
        write_guest_u64(guest, 0x4000, 7, 0x6003);

        let hva = gva_to_hva(&mem, ept.eptp(), 0x1000, Gva::new(0x7010)).unwrap();
        assert_eq!(hva, guest.add(0x6010));
        // A GPA outside guest memory translates through the guest walk but
        // fails the EPT walk.
        write_guest_u64(guest, 0x4000, 8, 0xdead_d003);
        assert!(gva_to_hva(&mem, ept.eptp(), 0x1000, Gva::new(0x8000)).is_none());
    }
}
