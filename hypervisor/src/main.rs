#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This kernel must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod config;
mod linux;
mod logger;
mod memory;
#[cfg(not(test))]
mod panic;
mod vmx;
mod x86_instructions;

#[cfg(not(test))]
mod boot {
    //! The multiboot2 boot surface: the assembly bring-up and the walk of
    //! the boot information structure. Host test builds bring their own
    //! runtime, so none of this exists there.

    use crate::{allocator, linux, logger, memory::Hpa, vmx, vmx::Span};
    use log::{debug, error, info};
    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

    // The multiboot2 header and the 32-bit entry that climbs into long mode
    // before calling kernel_main.
    core::arch::global_asm!(include_str!("boot.S"), options(att_syntax));

    extern "C" {
        /// End of the kernel image, defined by the linker script.
        static __kernel_end: u8;
    }

    /// The Rust entry point, reached from `boot.S` in long mode with
    /// interrupts masked and the low 4 GiB identity-mapped.
    #[no_mangle]
    extern "C" fn kernel_main(magic: u32, mbi_addr: u32) -> ! {
        logger::init_uart_logger();
        info!("mhv loaded");

        if magic != multiboot2::MAGIC {
            panic!("not loaded by a multiboot2 bootloader: magic {magic:#x}");
        }
        let boot_info =
            unsafe { BootInformation::load(mbi_addr as usize as *const BootInformationHeader) }
                .expect("malformed multiboot2 information structure");

        let (linux_image, initramfs) = find_guest_modules(&boot_info);
        debug!(
            "modules: bzImage {:#x}-{:#x}, initramfs {:#x}-{:#x}",
            linux_image.start.u64(),
            linux_image.end.u64(),
            initramfs.start.u64(),
            initramfs.end.u64()
        );

        init_page_pool(&boot_info);

        if !vmx::has_vmx_support() {
            panic!("VMX is not supported or not enabled by firmware on this CPU");
        }

        match vmx::run_guest(linux_image, initramfs, linux::setup_guest) {
            Err(err) => {
                error!("VMM initialization failed: {err}");
                panic!("VMM initialization failed");
            }
            Ok(never) => match never {},
        }
    }

    /// Finds the "linux" and "initramfs" boot modules by substring match on
    /// their command lines.
    fn find_guest_modules(boot_info: &BootInformation<'_>) -> (Span, Span) {
        let mut linux_image = None;
        let mut initramfs = None;
        for module in boot_info.module_tags() {
            let cmdline = module.cmdline().unwrap_or("");
            let span = Span {
                start: allocator::phys_to_virt(Hpa::new(u64::from(module.start_address()))),
                end: allocator::phys_to_virt(Hpa::new(u64::from(module.end_address()))),
            };
            if cmdline.contains("linux") {
                linux_image = Some(span);
            } else if cmdline.contains("initramfs") {
                initramfs = Some(span);
            }
        }
        match (linux_image, initramfs) {
            (Some(linux_image), Some(initramfs)) => (linux_image, initramfs),
            _ => panic!("bzImage or initramfs module missing from the boot command line"),
        }
    }

    /// Seeds the page pool with the largest usable region of the memory
    /// map, clipped below the kernel image, the boot modules and the 4 GiB
    /// identity map.
    fn init_page_pool(boot_info: &BootInformation<'_>) {
        const IDENTITY_MAP_END: u64 = 4 << 30;

        let memory_map = boot_info
            .memory_map_tag()
            .expect("no memory map in the multiboot2 information");

        // Nothing below the end of the kernel, the boot information or any
        // module is ever handed out.
        let mut reserved_end = unsafe { core::ptr::addr_of!(__kernel_end) as u64 };
        reserved_end = reserved_end.max(boot_info.end_address() as u64);
        for module in boot_info.module_tags() {
            reserved_end = reserved_end.max(u64::from(module.end_address()));
        }

        let mut best: Option<(u64, u64)> = None;
        for area in memory_map.memory_areas() {
            if MemoryAreaType::from(area.typ()) != MemoryAreaType::Available {
                continue;
            }
            let start = area.start_address().max(reserved_end);
            let end = area.end_address().min(IDENTITY_MAP_END);
            if start >= end {
                continue;
            }
            if best.map_or(true, |(s, e)| end - start > e - s) {
                best = Some((start, end));
            }
        }

        let (start, end) = best.expect("no usable memory above the kernel image");
        allocator::init(Hpa::new(start), Hpa::new(end));
    }
}

/// Computes how many pages are needed for the given bytes.
fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> 12) + usize::from((size & PAGE_MASK) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_pages() {
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(0x1000), 1);
        assert_eq!(size_to_pages(0x1001), 2);
        assert_eq!(size_to_pages(0x4000), 4);
    }
}
