//! Address-space vocabulary and the memory services the VMX code consumes.
//!
//! Four address spaces are in play and must never be mixed up: host-virtual
//! ([`Hva`]), host-physical ([`Hpa`]), guest-virtual ([`Gva`]) and
//! guest-physical ([`Gpa`]). Each is a distinct newtype so that handing an
//! address to the wrong translation step does not compile.
//!
//! [`HostMemory`] abstracts the page allocator and the linear map
//! (virtual-physical conversion is identity plus a fixed offset established
//! by the boot code). The kernel implementation lives in `allocator.rs`;
//! tests substitute an in-memory arena.

use core::fmt;

/// The size of a page managed by the page allocator and mapped by EPT leaves.
pub(crate) const PAGE_SIZE: u64 = 4096;

/// The size of a huge page handed out by [`HostMemory::alloc_huge_pages`].
pub(crate) const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

macro_rules! address_kind {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub(crate) struct $name(u64);

        impl $name {
            pub(crate) const fn new(addr: u64) -> Self {
                Self(addr)
            }

            pub(crate) const fn u64(self) -> u64 {
                self.0
            }

            pub(crate) const fn add(self, offset: u64) -> Self {
                Self(self.0 + offset)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

address_kind!(
    /// A host-virtual address, dereferenceable by the hypervisor.
    Hva
);
address_kind!(
    /// A host-physical address, the only kind stored inside EPT entries.
    Hpa
);
address_kind!(
    /// A guest-virtual address, resolved through the guest's own paging.
    Gva
);
address_kind!(
    /// A guest-physical address, resolved through EPT.
    Gpa
);

impl Hva {
    pub(crate) const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub(crate) const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// Page allocation and the host linear map.
///
/// Pages returned by the allocation methods are naturally aligned, physically
/// contiguous within a single call, and zeroed. Release must be called with
/// exactly the values a matching allocation returned.
pub(crate) trait HostMemory {
    /// Allocates `n` contiguous 4 KiB pages.
    fn alloc_pages(&self, n: usize) -> Option<Hva>;

    /// Returns `n` pages previously obtained from [`Self::alloc_pages`].
    fn release_pages(&self, at: Hva, n: usize);

    /// Allocates `n` contiguous 2 MiB pages.
    fn alloc_huge_pages(&self, n: usize) -> Option<Hva>;

    /// Returns huge pages previously obtained from
    /// [`Self::alloc_huge_pages`].
    fn release_huge_pages(&self, at: Hva, n: usize);

    fn virt_to_phys(&self, va: Hva) -> Hpa;

    fn phys_to_virt(&self, pa: Hpa) -> Hva;
}

/// A block of pages owned until dropped.
///
/// The orchestrator acquires resources as a ladder of these; dropping them in
/// reverse declaration order is what releases everything on a partial
/// failure, superseding goto-style unwinding labels.
pub(crate) struct PageBlock<'a, M: HostMemory> {
    mem: &'a M,
    at: Hva,
    pages: usize,
}

impl<'a, M: HostMemory> PageBlock<'a, M> {
    pub(crate) fn alloc(mem: &'a M, pages: usize) -> Option<Self> {
        let at = mem.alloc_pages(pages)?;
        Some(Self { mem, at, pages })
    }

    pub(crate) fn base(&self) -> Hva {
        self.at
    }

    pub(crate) fn base_phys(&self) -> Hpa {
        self.mem.virt_to_phys(self.at)
    }

    /// The `i`-th 4 KiB page of the block.
    pub(crate) fn page(&self, i: usize) -> Hva {
        debug_assert!(i < self.pages);
        self.at.add(i as u64 * PAGE_SIZE)
    }
}

impl<M: HostMemory> Drop for PageBlock<'_, M> {
    fn drop(&mut self) {
        self.mem.release_pages(self.at, self.pages);
    }
}

/// Like [`PageBlock`], for physically contiguous 2 MiB pages.
pub(crate) struct HugePageBlock<'a, M: HostMemory> {
    mem: &'a M,
    at: Hva,
    pages: usize,
}

impl<'a, M: HostMemory> HugePageBlock<'a, M> {
    pub(crate) fn alloc(mem: &'a M, pages: usize) -> Option<Self> {
        let at = mem.alloc_huge_pages(pages)?;
        Some(Self { mem, at, pages })
    }

    pub(crate) fn base(&self) -> Hva {
        self.at
    }

    pub(crate) fn size(&self) -> u64 {
        self.pages as u64 * HUGE_PAGE_SIZE
    }
}

impl<M: HostMemory> Drop for HugePageBlock<'_, M> {
    fn drop(&mut self) {
        self.mem.release_huge_pages(self.at, self.pages);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory stand-in for the page allocator and linear map, backing
    //! the EPT and translation tests. Host-physical addresses are arena
    //! offsets rebased to [`FakeMemory::PHYS_BASE`] so that page-frame
    //! numbers survive the shift-by-12 round trip.

    use super::{HostMemory, Hpa, Hva, HUGE_PAGE_SIZE, PAGE_SIZE};
    use core::cell::Cell;

    #[repr(C, align(4096))]
    struct ArenaPage([u8; PAGE_SIZE as usize]);

    pub(crate) struct FakeMemory {
        arena: Box<[ArenaPage]>,
        next: Cell<usize>,
        live_pages: Cell<isize>,
    }

    impl FakeMemory {
        pub(crate) const PHYS_BASE: u64 = 0x1_0000_0000;

        pub(crate) fn new(pages: usize) -> Self {
            let mut arena = Vec::with_capacity(pages);
            arena.resize_with(pages, || ArenaPage([0; PAGE_SIZE as usize]));
            Self {
                arena: arena.into_boxed_slice(),
                next: Cell::new(0),
                live_pages: Cell::new(0),
            }
        }

        /// Net pages currently held by callers.
        pub(crate) fn live_pages(&self) -> isize {
            self.live_pages.get()
        }

        fn arena_base(&self) -> u64 {
            self.arena.as_ptr() as u64
        }

        fn bump(&self, pages: usize, align_pages: usize) -> Option<Hva> {
            let mut first = self.next.get();
            let align = (self.arena_base() as usize / PAGE_SIZE as usize + first) % align_pages;
            if align != 0 {
                first += align_pages - align;
            }
            if first + pages > self.arena.len() {
                return None;
            }
            self.next.set(first + pages);
            self.live_pages.set(self.live_pages.get() + pages as isize);
            Some(Hva::new(self.arena_base() + first as u64 * PAGE_SIZE))
        }
    }

    impl HostMemory for FakeMemory {
        fn alloc_pages(&self, n: usize) -> Option<Hva> {
            self.bump(n, 1)
        }

        fn release_pages(&self, _at: Hva, n: usize) {
            self.live_pages.set(self.live_pages.get() - n as isize);
        }

        fn alloc_huge_pages(&self, n: usize) -> Option<Hva> {
            self.bump(n * (HUGE_PAGE_SIZE / PAGE_SIZE) as usize, 512)
        }

        fn release_huge_pages(&self, _at: Hva, n: usize) {
            self.live_pages
                .set(self.live_pages.get() - (n * (HUGE_PAGE_SIZE / PAGE_SIZE) as usize) as isize);
        }

        fn virt_to_phys(&self, va: Hva) -> Hpa {
            Hpa::new(va.u64() - self.arena_base() + Self::PHYS_BASE)
        }

        fn phys_to_virt(&self, pa: Hpa) -> Hva {
            Hva::new(pa.u64() - Self::PHYS_BASE + self.arena_base())
        }
    }
}
