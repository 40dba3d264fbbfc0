//! Extended page tables: guest-physical to host-physical translation.
//!
//! The builder produces the 4-level hierarchy KVM's nested-VMX layer expects:
//! write-back EPTP memory type, a page-walk length of 4 (encoded as 3) and no
//! accessed/dirty flags. One call maps a contiguous host-physical range at a
//! chosen guest-physical base with 4 KiB leaves carrying R/W/X, the
//! write-back memory type and ignore-PAT. A single PML4 entry (512 GiB) is
//! the most one mapping may span.

use super::VmmError;
use crate::memory::{Gpa, HostMemory, Hpa, Hva, PageBlock, PAGE_SIZE};
use bitfield::bitfield;

pub(crate) const ENTRIES_PER_TABLE: usize = 512;

const EPT_MEMORY_TYPE_WB: u64 = 6;
const GIB: u64 = 1 << 30;
const MAX_MAPPING_BYTES: u64 = 512 * GIB;

/// Address bits of a paging entry, any level.
pub(crate) const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitfield! {
    /// An entry of any EPT level.
    ///
    /// Interior entries use only the permission bits and the frame number;
    /// leaves additionally carry the memory type and the ignore-PAT flag.
    /// See: Table 29-6. Format of an EPT Page-Table Entry that Maps a 4-KByte
    ///      Page
    #[derive(Clone, Copy, Default)]
    pub struct EptEntry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub pfn, set_pfn: 51, 12;
}

impl EptEntry {
    /// An entry pointing at the next, lower table.
    fn interior(next_table: Hpa) -> Self {
        let mut entry = Self::default();
        entry.set_read(true);
        entry.set_write(true);
        entry.set_execute(true);
        entry.set_pfn(next_table.u64() >> 12);
        entry
    }

    /// A leaf mapping one host frame, cacheable write-back.
    fn leaf(frame: Hpa) -> Self {
        let mut entry = Self::interior(frame);
        entry.set_memory_type(EPT_MEMORY_TYPE_WB);
        entry.set_ignore_pat(true);
        entry
    }

    /// EPT presence: any of read, write or execute.
    pub(crate) fn present(self) -> bool {
        self.0 & 0b111 != 0
    }
}

bitfield! {
    /// The EPTP field of the VMCS: the PML4 frame packed with walk
    /// attributes.
    /// See: 25.6.11 Extended-Page-Table Pointer (EPTP)
    #[derive(Clone, Copy, Default)]
    pub struct EptPointer(u64);
    impl Debug;
    pub memory_type, set_memory_type: 2, 0;
    pub walk_length, set_walk_length: 5, 3;
    pub enable_dirty_flags, set_enable_dirty_flags: 6;
    pub pfn, set_pfn: 51, 12;
}

impl EptPointer {
    pub(crate) fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn pml4(self) -> Hpa {
        Hpa::new(self.pfn() << 12)
    }
}

/// Index of `addr` within each level of a 4-level hierarchy; the same 9-bit
/// splits the host's own paging uses.
pub(crate) fn pml4_index(addr: u64) -> usize {
    (addr >> 39) as usize & 0x1ff
}

pub(crate) fn pdpt_index(addr: u64) -> usize {
    (addr >> 30) as usize & 0x1ff
}

pub(crate) fn pd_index(addr: u64) -> usize {
    (addr >> 21) as usize & 0x1ff
}

pub(crate) fn pt_index(addr: u64) -> usize {
    (addr >> 12) as usize & 0x1ff
}

fn table_mut<'t>(page: Hva) -> &'t mut [EptEntry; ENTRIES_PER_TABLE] {
    // Safety: `page` is a private zeroed page owned by a PageBlock of the
    // hierarchy, and any bit pattern is a valid EptEntry.
    unsafe { &mut *page.as_mut_ptr() }
}

/// An EPT hierarchy mapping one contiguous host range, alive as long as the
/// tables must stay owned.
//
// Fields are declared in reverse acquisition order: dropping them releases
// the page-table pages back to the pool last-allocated-first.
pub(crate) struct EptMapping<'a, M: HostMemory> {
    page_tables: PageBlock<'a, M>,
    page_dirs: PageBlock<'a, M>,
    pdpt: PageBlock<'a, M>,
    pml4: PageBlock<'a, M>,
    eptp: EptPointer,
}

impl<'a, M: HostMemory> EptMapping<'a, M> {
    /// Maps `[host_start, host_end)` at `guest_start` so that
    /// `guest_start + k` translates to `host_start + k` for every page of
    /// the range.
    ///
    /// `guest_start` does not have to be directory- or table-aligned; the
    /// first table is filled starting at the corresponding offset.
    pub(crate) fn build(
        mem: &'a M,
        host_start: Hpa,
        host_end: Hpa,
        guest_start: Gpa,
    ) -> Result<Self, VmmError> {
        let size = host_end.u64().wrapping_sub(host_start.u64());
        if size == 0 || size > MAX_MAPPING_BYTES || host_end < host_start {
            return Err(VmmError::InvalidMappingSize);
        }

        let pml4 = PageBlock::alloc(mem, 1).ok_or(VmmError::OutOfMemory)?;
        let pdpt = PageBlock::alloc(mem, 1).ok_or(VmmError::OutOfMemory)?;

        let guest_last = guest_start.u64() + size - 1;
        let pdpt_off = pdpt_index(guest_start.u64());
        // Tables needed, counted over the guest index span so a misaligned
        // `guest_start` gets its extra trailing table.
        let n_pd = ((guest_last >> 30) - (guest_start.u64() >> 30) + 1) as usize;
        let n_pt = ((guest_last >> 21) - (guest_start.u64() >> 21) + 1) as usize;
        // A mapping never spans PML4 entries here.
        if pdpt_off + n_pd >= ENTRIES_PER_TABLE {
            return Err(VmmError::PageDirectoryOverflow);
        }

        let page_dirs = PageBlock::alloc(mem, n_pd).ok_or(VmmError::OutOfMemory)?;
        let page_tables = PageBlock::alloc(mem, n_pt).ok_or(VmmError::OutOfMemory)?;

        table_mut(pml4.page(0))[pml4_index(guest_start.u64())] =
            EptEntry::interior(mem.virt_to_phys(pdpt.page(0)));

        let mut host = host_start.u64();
        // Running offsets into the current directory and table. Only the
        // first of each starts mid-table; every following one starts at 0.
        let mut pd_off = pd_index(guest_start.u64());
        let mut pte_off = pt_index(guest_start.u64());
        let mut pt_no = 0;
        'fill: for dir in 0..n_pd {
            table_mut(pdpt.page(0))[pdpt_off + dir] =
                EptEntry::interior(mem.virt_to_phys(page_dirs.page(dir)));

            let pd = table_mut(page_dirs.page(dir));
            while pd_off < ENTRIES_PER_TABLE {
                pd[pd_off] = EptEntry::interior(mem.virt_to_phys(page_tables.page(pt_no)));

                let pt = table_mut(page_tables.page(pt_no));
                for entry in pt.iter_mut().skip(pte_off) {
                    *entry = EptEntry::leaf(Hpa::new(host));
                    host += PAGE_SIZE;
                    if host >= host_end.u64() {
                        break 'fill;
                    }
                }
                pte_off = 0;
                pd_off += 1;
                pt_no += 1;
            }
            pd_off = 0;
        }

        let mut eptp = EptPointer::default();
        eptp.set_memory_type(EPT_MEMORY_TYPE_WB); // imposed by KVM when nested
        eptp.set_walk_length(3); // 4 levels, encoded as length minus one
        eptp.set_enable_dirty_flags(false);
        eptp.set_pfn(mem.virt_to_phys(pml4.page(0)).u64() >> 12);

        Ok(Self {
            page_tables,
            page_dirs,
            pdpt,
            pml4,
            eptp,
        })
    }

    pub(crate) fn eptp(&self) -> EptPointer {
        self.eptp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::vmx::translate::ept_translate;

    const MIB: u64 = 1 << 20;

    fn entry_at(mem: &FakeMemory, table: Hpa, index: usize) -> EptEntry {
        let table = mem.phys_to_virt(table);
        unsafe { *table.as_ptr::<EptEntry>().add(index) }
    }

    #[test]
    fn maps_200_mib_at_guest_zero() {
        let mem = FakeMemory::new(128);
        let host_start = Hpa::new(0x2_0000_0000);
        let host_end = Hpa::new(0x2_0c80_0000);
        let ept = EptMapping::build(&mem, host_start, host_end, Gpa::new(0)).unwrap();

        // One PML4 entry, one PDPT entry, 100 page directories entries.
        let pml4 = ept.eptp.pml4();
        assert!(entry_at(&mem, pml4, 0).present());
        let pdpt = Hpa::new(entry_at(&mem, pml4, 0).pfn() << 12);
        assert!(entry_at(&mem, pdpt, 0).present());
        assert!(!entry_at(&mem, pdpt, 1).present());
        let pd = Hpa::new(entry_at(&mem, pdpt, 0).pfn() << 12);
        for i in 0..100 {
            assert!(entry_at(&mem, pd, i).present(), "pde {i}");
        }
        assert!(!entry_at(&mem, pd, 100).present());

        assert_eq!(
            ept_translate(&mem, ept.eptp(), Gpa::new(0x0012_3000)),
            Some(Hpa::new(0x2_0012_3000))
        );
        // Low 12 bits pass through untranslated.
        assert_eq!(
            ept_translate(&mem, ept.eptp(), Gpa::new(0x0012_3456)),
            Some(Hpa::new(0x2_0012_3456))
        );
        // First and last mapped page.
        assert_eq!(
            ept_translate(&mem, ept.eptp(), Gpa::new(0)),
            Some(host_start)
        );
        assert_eq!(
            ept_translate(&mem, ept.eptp(), Gpa::new(200 * MIB - 1)),
            Some(Hpa::new(host_end.u64() - 1))
        );
    }

    #[test]
    fn leaves_carry_rwx_writeback_ignore_pat() {
        let mem = FakeMemory::new(16);
        let ept = EptMapping::build(
            &mem,
            Hpa::new(0x10_0000),
            Hpa::new(0x50_0000),
            Gpa::new(0),
        )
        .unwrap();

        let pml4 = ept.eptp.pml4();
        let pdpt = Hpa::new(entry_at(&mem, pml4, 0).pfn() << 12);
        let pd = Hpa::new(entry_at(&mem, pdpt, 0).pfn() << 12);
        let pt = Hpa::new(entry_at(&mem, pd, 0).pfn() << 12);
        for i in 0..ENTRIES_PER_TABLE {
            let leaf = entry_at(&mem, pt, i);
            assert!(leaf.read() && leaf.write() && leaf.execute());
            assert_eq!(leaf.memory_type(), 6);
            assert!(leaf.ignore_pat());
        }
    }

    #[test]
    fn out_of_range_is_not_translated() {
        let mem = FakeMemory::new(32);
        let guest_base = Gpa::new(GIB);
        let ept = EptMapping::build(
            &mem,
            Hpa::new(0x10_0000),
            Hpa::new(0x10_0000 + 4 * MIB),
            guest_base,
        )
        .unwrap();

        assert!(ept_translate(&mem, ept.eptp(), Gpa::new(guest_base.u64() - 1)).is_none());
        assert!(ept_translate(&mem, ept.eptp(), Gpa::new(guest_base.u64() + 4 * MIB)).is_none());
        assert!(ept_translate(&mem, ept.eptp(), Gpa::new(0)).is_none());
    }

    #[test]
    fn oversized_and_empty_mappings_are_rejected_without_allocating() {
        let mem = FakeMemory::new(8);
        assert!(matches!(
            EptMapping::build(
                &mem,
                Hpa::new(0),
                Hpa::new(513 * GIB),
                Gpa::new(0),
            ),
            Err(VmmError::InvalidMappingSize)
        ));
        assert_eq!(mem.live_pages(), 0);

        assert!(matches!(
            EptMapping::build(&mem, Hpa::new(0x1000), Hpa::new(0x1000), Gpa::new(0)),
            Err(VmmError::InvalidMappingSize)
        ));
        assert_eq!(mem.live_pages(), 0);
    }

    #[test]
    fn pdpt_overflow_is_rejected_and_unwinds() {
        let mem = FakeMemory::new(8);
        // 4 GiB mapped at the last PDPT slot of the PML4 entry spills over.
        let guest_base = Gpa::new(511 * GIB);
        assert!(matches!(
            EptMapping::build(&mem, Hpa::new(0), Hpa::new(4 * GIB), guest_base),
            Err(VmmError::PageDirectoryOverflow)
        ));
        assert_eq!(mem.live_pages(), 0);
    }

    #[test]
    fn unaligned_guest_base_starts_mid_table() {
        let mem = FakeMemory::new(32);
        // 3 MiB base: page-directory offset 1, page-table offset 256.
        let guest_base = Gpa::new(3 * MIB);
        let host_start = Hpa::new(0x4000_0000);
        let ept = EptMapping::build(
            &mem,
            host_start,
            Hpa::new(host_start.u64() + 4 * MIB),
            guest_base,
        )
        .unwrap();

        for k in [0, 0x1000, MIB - 0x1000, MIB, 2 * MIB, 4 * MIB - 0x1000] {
            assert_eq!(
                ept_translate(&mem, ept.eptp(), guest_base.add(k)),
                Some(host_start.add(k)),
                "offset {k:#x}"
            );
        }
        assert!(ept_translate(&mem, ept.eptp(), Gpa::new(guest_base.u64() - 0x1000)).is_none());
        assert!(ept_translate(&mem, ept.eptp(), guest_base.add(4 * MIB)).is_none());
    }

    #[test]
    fn allocation_failure_frees_everything() {
        // Room for PML4 + PDPT but not for the directories and tables.
        let mem = FakeMemory::new(3);
        assert!(matches!(
            EptMapping::build(
                &mem,
                Hpa::new(0),
                Hpa::new(8 * MIB),
                Gpa::new(0),
            ),
            Err(VmmError::OutOfMemory)
        ));
        assert_eq!(mem.live_pages(), 0);
    }
}
