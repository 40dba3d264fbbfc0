//! The VMX subsystem: probing, bring-up, and the launch of the single guest.
//!
//! The orchestration here follows the order the hardware demands: capability
//! MSRs are snapshotted, control regions allocated and stamped, CR0/CR4
//! brought within the VMX-fixed bits, host state captured, guest memory
//! mapped under EPT, the guest image composed, and only then
//! VMXON -> VMCLEAR -> VMPTRLD -> field writes -> VMLAUNCH. Acquired resources
//! form a ladder of owned guards; any failure unwinds them in reverse by
//! plain drop order, with VMXOFF issued if and only if VMXON succeeded.

pub(crate) mod ept;
pub(crate) mod guest;
pub(crate) mod host;
pub(crate) mod msrs;
pub(crate) mod run;
pub(crate) mod translate;
pub(crate) mod vmcs;

use self::{
    ept::{EptMapping, EptPointer},
    guest::GuestState,
    host::HostState,
    msrs::VmxMsrs,
    vmcs::VmxRegions,
};
use crate::{
    allocator::{KernelMemory, KERNEL_MEMORY},
    config::GUEST_MEMORY_HUGE_PAGES,
    memory::{Gpa, HostMemory, Hva, HugePageBlock, PageBlock},
    x86_instructions::{cr0, cr0_write, cr4, cr4_write, rdmsr},
};
use core::{convert::Infallible, fmt};
use log::{debug, info};
use x86::{
    controlregs::{Cr0, Cr4},
    cpuid::CpuId,
};

/// Everything that can go wrong between probing and launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmmError {
    /// The page pool could not satisfy an allocation.
    OutOfMemory,
    /// An EPT mapping request was empty or above 512 GiB.
    InvalidMappingSize,
    /// An EPT mapping would spill past the single PML4 entry supported.
    PageDirectoryOverflow,
    /// The supplied kernel image cannot be booted.
    BadGuestImage(&'static str),
    /// A VMX instruction failed with an invalid pointer (CF set).
    VmxFailInvalid,
    /// A VMX instruction failed with a valid VMCS (ZF set); carries the
    /// VM-instruction-error number.
    VmxFailValid(u32),
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidMappingSize => write!(f, "mapping empty or larger than 512 GiB"),
            Self::PageDirectoryOverflow => write!(f, "mapping spills past one PML4 entry"),
            Self::BadGuestImage(why) => write!(f, "bad guest image: {why}"),
            Self::VmxFailInvalid => write!(f, "VMX instruction failed: invalid pointer"),
            Self::VmxFailValid(err) => write!(f, "VMX instruction failed: error {err}"),
        }
    }
}

/// Whether this processor can reach VMX root operation: the CPUID feature
/// bit, and firmware having locked the feature-control MSR with VMXON
/// permitted outside SMX. The MSR is never written here; an unlocked or
/// disabled configuration is the firmware's last word.
pub(crate) fn has_vmx_support() -> bool {
    const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
    const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

    if !CpuId::new()
        .get_feature_info()
        .is_some_and(|f| f.has_vmx())
    {
        return false;
    }
    let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
    feature_control & FEATURE_CONTROL_LOCK != 0
        && feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX != 0
}

/// A span of host-virtual memory, such as a boot module.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Span {
    pub(crate) start: Hva,
    pub(crate) end: Hva,
}

impl Span {
    pub(crate) fn len(&self) -> usize {
        (self.end.u64() - self.start.u64()) as usize
    }

    pub(crate) fn bytes(&self) -> &'static [u8] {
        // Safety: spans cover boot modules, which sit below the page pool
        // and stay mapped and untouched for the lifetime of the kernel.
        unsafe { core::slice::from_raw_parts(self.start.as_ptr(), self.len()) }
    }
}

/// The collaborator that writes the initial guest image into guest memory
/// and fills in [`Vmm::guest_state`].
pub(crate) type GuestBuilder = fn(&mut Vmm) -> Result<(), VmmError>;

/// The one record tying the whole VM together. Lives on the stack of
/// [`run_guest`] for as long as the guest does; the exit stub finds it
/// through the back-pointer on the exit stack.
//
// Owning fields are declared in reverse acquisition order so that an
// unwinding drop releases them last-acquired-first.
pub(crate) struct Vmm {
    msr_bitmap: PageBlock<'static, KernelMemory>,
    ept: EptMapping<'static, KernelMemory>,
    guest_mem: HugePageBlock<'static, KernelMemory>,
    host_state: HostState,
    regions: VmxRegions<'static, KernelMemory>,
    msrs: VmxMsrs,
    pub(crate) guest_state: GuestState,
    pub(crate) guest_image: Span,
    pub(crate) guest_initrd: Span,
    setup_guest: GuestBuilder,
}

impl Vmm {
    pub(crate) fn eptp(&self) -> EptPointer {
        self.ept.eptp()
    }

    pub(crate) fn guest_mem_size(&self) -> u64 {
        self.guest_mem.size()
    }

    /// A mutable view of guest-physical memory, translated through EPT.
    /// Guest memory is one physically contiguous block, so a contiguous
    /// guest-physical range stays contiguous in host space.
    pub(crate) fn guest_slice(&mut self, gpa: Gpa, len: usize) -> Option<&mut [u8]> {
        if gpa.u64() + len as u64 > self.guest_mem.size() {
            return None;
        }
        let hva = translate::gpa_to_hva(&KERNEL_MEMORY, self.ept.eptp(), gpa)?;
        // Safety: bounds-checked above against the owned guest block.
        Some(unsafe { core::slice::from_raw_parts_mut(hva.as_mut_ptr(), len) })
    }
}

/// VMX root operation, left again on drop. Everything between VMXON and
/// VMLAUNCH hangs off this guard so a failed bring-up always executes
/// VMXOFF, and only then releases the regions the CPU was using.
struct VmxRoot(());

impl VmxRoot {
    fn enter(vmxon_region: crate::memory::Hpa) -> Result<Self, VmmError> {
        vmcs::vmxon(vmxon_region)?;
        Ok(Self(()))
    }
}

impl Drop for VmxRoot {
    fn drop(&mut self) {
        let _ = vmcs::vmxoff();
    }
}

/// Brings up the VMM and launches the guest. Returns only on failure.
pub(crate) fn run_guest(
    guest_image: Span,
    guest_initrd: Span,
    setup_guest: GuestBuilder,
) -> Result<Infallible, VmmError> {
    let mem = &KERNEL_MEMORY;

    let msrs = VmxMsrs::read();
    let regions = VmxRegions::alloc(mem, &msrs)?;

    // CR0 and CR4 must sit within the VMX-fixed bits before VMXON, and
    // CR4.VMXE gates the instruction itself.
    cr0_write(Cr0::from_bits_truncate(
        ((cr0().bits() as u64 | msrs.cr0_fixed0()) & msrs.cr0_fixed1()) as usize,
    ));
    let cr4_value = cr4().bits() as u64 | Cr4::CR4_ENABLE_VMX.bits() as u64;
    cr4_write(Cr4::from_bits_truncate(
        ((cr4_value | msrs.cr4_fixed0()) & msrs.cr4_fixed1()) as usize,
    ));

    let host_state = HostState::capture(mem)?;

    let guest_mem =
        HugePageBlock::alloc(mem, GUEST_MEMORY_HUGE_PAGES).ok_or(VmmError::OutOfMemory)?;
    let host_start = mem.virt_to_phys(guest_mem.base());
    let host_end = host_start.add(guest_mem.size());
    let ept = EptMapping::build(mem, host_start, host_end, Gpa::new(0))?;
    debug!(
        "guest memory: {} MiB at {:?}, EPTP {:#x}",
        guest_mem.size() >> 20,
        host_start,
        ept.eptp().value()
    );

    // One zeroed page: no RDMSR or WRMSR traps in any of the four 1 KiB
    // quadrants (read-low, read-high, write-low, write-high).
    let msr_bitmap = PageBlock::alloc(mem, 1).ok_or(VmmError::OutOfMemory)?;

    let mut vmm = Vmm {
        msr_bitmap,
        ept,
        guest_mem,
        host_state,
        regions,
        msrs,
        guest_state: GuestState::default(),
        guest_image,
        guest_initrd,
        setup_guest,
    };
    let build_guest = vmm.setup_guest;
    build_guest(&mut vmm)?;

    // The record is in its final home now; ABI with the exit stub.
    let vmm_ptr: *mut Vmm = &mut vmm;
    vmm.host_state.store_context(vmm_ptr);

    let vmx_root = VmxRoot::enter(vmm.regions.vmxon_region())?;
    // A fresh VMCS must be cleared before its first VMPTRLD; writing fields
    // is only defined against the current VMCS.
    vmcs::vmclear(vmm.regions.vmcs_region())?;
    vmcs::vmptrld(vmm.regions.vmcs_region())?;

    vmcs::write_exec_controls(
        &vmm.msrs,
        vmm.ept.eptp(),
        vmm.msr_bitmap.base_phys(),
        &vmm.guest_state.control,
    )?;
    vmcs::write_exit_controls(&vmm.msrs)?;
    vmcs::write_entry_controls(&vmm.msrs)?;
    vmcs::write_host_state(&vmm.host_state)?;
    vmcs::write_guest_state(&vmm.guest_state)?;

    info!("entering guest at RIP {:#x}", vmm.guest_state.regs.rip);
    let err = run::launch(&vmm.guest_state.regs);

    // VMLAUNCH came back: bring-up failed. The guard chain unwinds from
    // here, VMXOFF first.
    drop(vmx_root);
    Err(err)
}
