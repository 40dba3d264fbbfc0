//! The guest builder: turns a bzImage and an initramfs into a runnable
//! 64-bit guest.
//!
//! The 64-bit Linux boot protocol wants the protected-mode kernel at its
//! preferred load address, a `boot_params` page describing the machine, a
//! GDT with the `__BOOT_CS`/`__BOOT_DS` descriptors, and identity paging
//! covering the load address. Entry is at the 64-bit entry point, 0x200
//! past the load address, with RSI pointing at `boot_params`.
//!
//! See Documentation/arch/x86/boot.rst in the kernel tree for the header
//! fields consumed here.

use crate::{
    config::{guest_layout, GUEST_CMDLINE},
    memory::{Gpa, HUGE_PAGE_SIZE},
    vmx::{
        guest::{
            ControlRegisters, DescriptorTable, GuestRegisters, GuestState, MsrState, Segment,
            Segments, SEGMENT_UNUSABLE,
        },
        Vmm, VmmError,
    },
};
use log::info;

// Offsets into the bzImage setup header (and the same offsets inside the
// zero page, where the header is replicated).
const SETUP_SECTS: usize = 0x1f1;
const BOOT_FLAG: usize = 0x1fe;
const HEADER_MAGIC: usize = 0x202;
const PROTOCOL_VERSION: usize = 0x206;
const TYPE_OF_LOADER: usize = 0x210;
const RAMDISK_IMAGE: usize = 0x218;
const RAMDISK_SIZE: usize = 0x21c;
const HEADER_END: usize = 0x201;
const CMD_LINE_PTR: usize = 0x228;
const XLOADFLAGS: usize = 0x236;
const E820_ENTRIES: usize = 0x1e8;
const E820_TABLE: usize = 0x2d0;

const BOOT_FLAG_MAGIC: u16 = 0xaa55;
const HDRS_MAGIC: u32 = 0x5372_6448; // "HdrS"
const XLF_KERNEL_64: u16 = 1 << 0;
const LOADER_TYPE_UNDEFINED: u8 = 0xff;

const E820_RAM: u32 = 1;

// Descriptors for __BOOT_CS (0x10) and __BOOT_DS (0x18): flat 64-bit code
// and flat data, both with the accessed bit pre-set as VM-entry demands.
const GDT_CODE64: u64 = 0x00af_9b00_0000_ffff;
const GDT_DATA: u64 = 0x00cf_9300_0000_ffff;
const BOOT_CS: u16 = 0x10;
const BOOT_DS: u16 = 0x18;

const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;
const EFER_LME_LMA: u64 = (1 << 8) | (1 << 10);
const CR0_PE_MP_ET_NE_PG: u64 = 0x8000_0033;
const CR4_PAE: u64 = 1 << 5;
const DR7_DEFAULT: u64 = 0x400;

fn get_u8(image: &[u8], offset: usize) -> u8 {
    image[offset]
}

fn get_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(image[offset..offset + 2].try_into().unwrap())
}

fn get_u32(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
}

fn put_u8(bytes: &mut [u8], offset: usize, value: u8) {
    bytes[offset] = value;
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Validates the bzImage and returns the offset of its protected-mode
/// payload.
fn payload_offset(image: &[u8]) -> Result<usize, VmmError> {
    if image.len() < 0x1000 {
        return Err(VmmError::BadGuestImage("image too short for a bzImage"));
    }
    if get_u16(image, BOOT_FLAG) != BOOT_FLAG_MAGIC || get_u32(image, HEADER_MAGIC) != HDRS_MAGIC {
        return Err(VmmError::BadGuestImage("missing bzImage header magic"));
    }
    if get_u16(image, PROTOCOL_VERSION) < 0x020c {
        return Err(VmmError::BadGuestImage("boot protocol older than 2.12"));
    }
    if get_u16(image, XLOADFLAGS) & XLF_KERNEL_64 == 0 {
        return Err(VmmError::BadGuestImage("no 64-bit entry point"));
    }

    // Zero means the legacy default of four setup sectors.
    let mut setup_sects = get_u8(image, SETUP_SECTS) as usize;
    if setup_sects == 0 {
        setup_sects = 4;
    }
    let offset = (setup_sects + 1) * 512;
    if offset >= image.len() {
        return Err(VmmError::BadGuestImage("setup sectors beyond image end"));
    }
    Ok(offset)
}

fn copy_into_guest(vmm: &mut Vmm, gpa: u64, bytes: &[u8], what: &'static str) -> Result<(), VmmError> {
    vmm.guest_slice(Gpa::new(gpa), bytes.len())
        .ok_or(VmmError::BadGuestImage(what))?
        .copy_from_slice(bytes);
    Ok(())
}

/// Builds the zero page: the replicated setup header with the loader's
/// answers filled in, plus the e820 map of the guest's memory.
fn build_zero_page(vmm: &mut Vmm, image: &[u8], initrd_len: u32) -> Result<(), VmmError> {
    let guest_mem_size = vmm.guest_mem_size();
    let zero_page = vmm
        .guest_slice(Gpa::new(guest_layout::ZERO_PAGE), 0x1000)
        .ok_or(VmmError::BadGuestImage("zero page outside guest memory"))?;

    let header_len = 0x202 + get_u8(image, HEADER_END) as usize - SETUP_SECTS;
    zero_page[SETUP_SECTS..SETUP_SECTS + header_len]
        .copy_from_slice(&image[SETUP_SECTS..SETUP_SECTS + header_len]);

    put_u8(zero_page, TYPE_OF_LOADER, LOADER_TYPE_UNDEFINED);
    put_u32(zero_page, CMD_LINE_PTR, guest_layout::CMDLINE as u32);
    put_u32(zero_page, RAMDISK_IMAGE, guest_layout::INITRD as u32);
    put_u32(zero_page, RAMDISK_SIZE, initrd_len);

    // Two usable ranges: the low conventional memory and everything from
    // 1 MiB to the end of guest memory.
    let entries: [(u64, u64, u32); 2] = [
        (0, 0x9_fc00, E820_RAM),
        (0x10_0000, guest_mem_size - 0x10_0000, E820_RAM),
    ];
    for (i, (addr, size, typ)) in entries.iter().enumerate() {
        let at = E820_TABLE + i * 20;
        put_u64(zero_page, at, *addr);
        put_u64(zero_page, at + 8, *size);
        put_u32(zero_page, at + 16, *typ);
    }
    put_u8(zero_page, E820_ENTRIES, entries.len() as u8);
    Ok(())
}

/// Identity paging for the guest's first gigabyte: one PML4 entry, one PDPT
/// entry, one directory of 2 MiB pages. The kernel replaces it the moment
/// it builds its own.
fn build_guest_paging(vmm: &mut Vmm) -> Result<(), VmmError> {
    const PRESENT_RW: u64 = 0x3;
    const PRESENT_RW_PS: u64 = 0x83;

    let pml4 = vmm
        .guest_slice(Gpa::new(guest_layout::PML4), 0x1000)
        .ok_or(VmmError::BadGuestImage("page tables outside guest memory"))?;
    put_u64(pml4, 0, guest_layout::PDPT | PRESENT_RW);

    let pdpt = vmm
        .guest_slice(Gpa::new(guest_layout::PDPT), 0x1000)
        .ok_or(VmmError::BadGuestImage("page tables outside guest memory"))?;
    put_u64(pdpt, 0, guest_layout::PD | PRESENT_RW);

    let pd = vmm
        .guest_slice(Gpa::new(guest_layout::PD), 0x1000)
        .ok_or(VmmError::BadGuestImage("page tables outside guest memory"))?;
    for i in 0..512u64 {
        put_u64(pd, i as usize * 8, i * HUGE_PAGE_SIZE | PRESENT_RW_PS);
    }
    Ok(())
}

fn build_guest_gdt(vmm: &mut Vmm) -> Result<u32, VmmError> {
    let entries = [0u64, 0, GDT_CODE64, GDT_DATA];
    let gdt = vmm
        .guest_slice(Gpa::new(guest_layout::GDT), entries.len() * 8)
        .ok_or(VmmError::BadGuestImage("GDT outside guest memory"))?;
    for (i, entry) in entries.iter().enumerate() {
        put_u64(gdt, i * 8, *entry);
    }
    Ok((entries.len() * 8 - 1) as u32)
}

/// The `setup_guest` collaborator: writes the boot objects into guest
/// memory and composes the initial register state.
pub(crate) fn setup_guest(vmm: &mut Vmm) -> Result<(), VmmError> {
    let image = vmm.guest_image.bytes();
    let initrd = vmm.guest_initrd.bytes();

    let payload_at = payload_offset(image)?;
    let payload = &image[payload_at..];
    if guest_layout::KERNEL + payload.len() as u64 > guest_layout::INITRD {
        return Err(VmmError::BadGuestImage("kernel payload overlaps initrd"));
    }
    copy_into_guest(vmm, guest_layout::KERNEL, payload, "kernel outside guest memory")?;
    copy_into_guest(vmm, guest_layout::INITRD, initrd, "initrd outside guest memory")?;

    let mut cmdline = [0u8; 256];
    let cmdline_bytes = GUEST_CMDLINE.as_bytes();
    cmdline[..cmdline_bytes.len()].copy_from_slice(cmdline_bytes);
    copy_into_guest(vmm, guest_layout::CMDLINE, &cmdline, "cmdline outside guest memory")?;

    build_zero_page(vmm, image, initrd.len() as u32)?;
    build_guest_paging(vmm)?;
    let gdt_limit = build_guest_gdt(vmm)?;

    let entry = guest_layout::KERNEL + 0x200;
    info!(
        "guest: {} KiB kernel at {:#x}, {} KiB initrd at {:#x}, entry {entry:#x}",
        payload.len() / 1024,
        guest_layout::KERNEL,
        initrd.len() / 1024,
        guest_layout::INITRD,
    );

    let code = Segment {
        selector: BOOT_CS,
        base: 0,
        limit: 0xffff_ffff,
        access: 0xa09b,
    };
    let data = Segment {
        selector: BOOT_DS,
        base: 0,
        limit: 0xffff_ffff,
        access: 0xc093,
    };
    vmm.guest_state = GuestState {
        regs: GuestRegisters {
            rip: entry,
            rsp: guest_layout::STACK_TOP,
            rsi: guest_layout::ZERO_PAGE,
            rflags: 0x2,
            ..GuestRegisters::default()
        },
        control: ControlRegisters {
            cr0: CR0_PE_MP_ET_NE_PG,
            cr3: guest_layout::PML4,
            cr4: CR4_PAE,
        },
        segments: Segments {
            cs: code,
            ds: data,
            es: data,
            ss: data,
            fs: data,
            gs: data,
            // A usable 64-bit TSS is mandatory for entry even though the
            // kernel installs its own before ever task-switching.
            tr: Segment {
                selector: 0,
                base: 0,
                limit: 0x67,
                access: 0x8b,
            },
            ldtr: Segment {
                selector: 0,
                base: 0,
                limit: 0,
                access: SEGMENT_UNUSABLE,
            },
        },
        gdtr: DescriptorTable {
            base: guest_layout::GDT,
            limit: gdt_limit,
        },
        idtr: DescriptorTable { base: 0, limit: 0 },
        msr: MsrState {
            pat: PAT_DEFAULT,
            efer: EFER_LME_LMA,
            ..MsrState::default()
        },
        dr7: DR7_DEFAULT,
        vmcs_link: u64::MAX,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_bzimage(setup_sects: u8, version: u16, xloadflags: u16) -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];
        image[SETUP_SECTS] = setup_sects;
        image[BOOT_FLAG..BOOT_FLAG + 2].copy_from_slice(&BOOT_FLAG_MAGIC.to_le_bytes());
        image[HEADER_MAGIC..HEADER_MAGIC + 4].copy_from_slice(&HDRS_MAGIC.to_le_bytes());
        image[PROTOCOL_VERSION..PROTOCOL_VERSION + 2].copy_from_slice(&version.to_le_bytes());
        image[XLOADFLAGS..XLOADFLAGS + 2].copy_from_slice(&xloadflags.to_le_bytes());
        image
    }

    #[test]
    fn payload_follows_the_setup_sectors() {
        let image = minimal_bzimage(2, 0x020f, XLF_KERNEL_64);
        assert_eq!(payload_offset(&image).unwrap(), 3 * 512);
        // Zero setup_sects means the legacy default of four.
        let image = minimal_bzimage(0, 0x020f, XLF_KERNEL_64);
        assert_eq!(payload_offset(&image).unwrap(), 5 * 512);
    }

    #[test]
    fn non_bootable_images_are_rejected() {
        let mut image = minimal_bzimage(2, 0x020f, XLF_KERNEL_64);
        image[BOOT_FLAG] = 0;
        assert!(payload_offset(&image).is_err());

        let image = minimal_bzimage(2, 0x020f, 0);
        assert!(matches!(
            payload_offset(&image),
            Err(VmmError::BadGuestImage("no 64-bit entry point"))
        ));

        let image = minimal_bzimage(2, 0x0200, XLF_KERNEL_64);
        assert!(payload_offset(&image).is_err());

        // setup_sects pointing past the end of the image.
        let image = minimal_bzimage(0xff, 0x020f, XLF_KERNEL_64);
        assert!(payload_offset(&image).is_err());
    }
}
