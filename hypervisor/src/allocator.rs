//! The module containing the physical page pool and the global allocator.
//!
//! The pool is a single contiguous region of usable RAM picked from the
//! multiboot2 memory map, handed out by a bump pointer. Frees are honored
//! only in reverse allocation order; anything else is leaked. That is
//! exactly the shape the bring-up path needs: resources unwind as a ladder,
//! and on the success path nothing is ever freed because the machine belongs
//! to the VM from then on.
//!
//! The boot code identity-maps the low 4 GiB with 2 MiB pages, so the linear
//! map is identity with a zero offset and the pool is clipped to 4 GiB.

use crate::{
    memory::{HostMemory, Hpa, Hva, HUGE_PAGE_SIZE, PAGE_SIZE},
    size_to_pages,
};
use core::alloc::{GlobalAlloc, Layout};
use log::{debug, warn};
use spin::Mutex;

/// Offset of the host linear map. The boot identity map makes it zero.
const PHYS_OFFSET: u64 = 0;

pub(crate) fn phys_to_virt(pa: Hpa) -> Hva {
    Hva::new(pa.u64() + PHYS_OFFSET)
}

pub(crate) fn virt_to_phys(va: Hva) -> Hpa {
    Hpa::new(va.u64() - PHYS_OFFSET)
}

struct Pool {
    next: u64,
    end: u64,
}

static POOL: Mutex<Pool> = Mutex::new(Pool { next: 0, end: 0 });

/// Seeds the pool with the physical range `[start, end)`. Called exactly once
/// before the first allocation.
pub(crate) fn init(start: Hpa, end: Hpa) {
    let mut pool = POOL.lock();
    assert!(pool.next == 0, "page pool initialized twice");
    pool.next = start.u64().next_multiple_of(PAGE_SIZE);
    pool.end = end.u64() & !(PAGE_SIZE - 1);
    debug!(
        "page pool: {:#x} - {:#x} ({} KiB)",
        pool.next,
        pool.end,
        (pool.end - pool.next) / 1024
    );
}

fn alloc_aligned(bytes: u64, align: u64) -> Option<Hva> {
    let mut pool = POOL.lock();
    let at = pool.next.next_multiple_of(align);
    if at + bytes > pool.end {
        return None;
    }
    pool.next = at + bytes;
    drop(pool);

    let va = phys_to_virt(Hpa::new(at));
    // The pool hands out zeroed memory; previous owners may have dirtied it.
    unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, bytes as usize) };
    Some(va)
}

fn release(at: Hva, bytes: u64) {
    let mut pool = POOL.lock();
    let pa = virt_to_phys(at).u64();
    if pa + bytes == pool.next {
        pool.next = pa;
    } else {
        // Out-of-order free. Only unwinding paths free at all, and those run
        // in reverse allocation order, so this is not expected to fire.
        warn!("leaking {bytes} bytes at {at:?} freed out of order");
    }
}

/// Zero-sized handle to the kernel page pool.
pub(crate) struct KernelMemory;

/// The instance borrowed by every allocation ladder in the kernel.
pub(crate) static KERNEL_MEMORY: KernelMemory = KernelMemory;

impl HostMemory for KernelMemory {
    fn alloc_pages(&self, n: usize) -> Option<Hva> {
        alloc_aligned(n as u64 * PAGE_SIZE, PAGE_SIZE)
    }

    fn release_pages(&self, at: Hva, n: usize) {
        release(at, n as u64 * PAGE_SIZE);
    }

    fn alloc_huge_pages(&self, n: usize) -> Option<Hva> {
        alloc_aligned(n as u64 * HUGE_PAGE_SIZE, HUGE_PAGE_SIZE)
    }

    fn release_huge_pages(&self, at: Hva, n: usize) {
        release(at, n as u64 * HUGE_PAGE_SIZE);
    }

    fn virt_to_phys(&self, va: Hva) -> Hpa {
        virt_to_phys(va)
    }

    fn phys_to_virt(&self, pa: Hpa) -> Hva {
        phys_to_virt(pa)
    }
}

/// The global allocator. Everything is served in whole pages; the few heap
/// objects this kernel makes (the host GDT clone and its TSS) live forever,
/// so the waste is irrelevant.
struct PageBackedAllocator;

unsafe impl GlobalAlloc for PageBackedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() as u64 > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        KERNEL_MEMORY
            .alloc_pages(size_to_pages(layout.size().max(1)))
            .map_or(core::ptr::null_mut(), Hva::as_mut_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        KERNEL_MEMORY.release_pages(Hva::new(ptr as u64), size_to_pages(layout.size().max(1)));
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: PageBackedAllocator = PageBackedAllocator;
