//! VMCS regions, VMX instruction wrappers and the VMCS field writer.
//!
//! Field programming is only legal between VMPTRLD and the next VMCLEAR;
//! the orchestrator guarantees that window. Every control word is adjusted
//! against the capability MSRs before it is written, so a request only ever
//! tightens what the CPU already allows.

use super::{
    ept::EptPointer,
    guest::{ControlRegisters, GuestState, Segment},
    host::HostState,
    msrs::{VmxControl, VmxMsrs},
    VmmError,
};
use crate::memory::{HostMemory, Hpa, PageBlock};
use x86::vmx::{vmcs, VmFail};

/// The VMXON region and the VMCS, allocated as one two-page block with the
/// revision identifier stamped at offset 0 of each page.
pub(crate) struct VmxRegions<'a, M: HostMemory> {
    block: PageBlock<'a, M>,
}

impl<'a, M: HostMemory> VmxRegions<'a, M> {
    pub(crate) fn alloc(mem: &'a M, msrs: &VmxMsrs) -> Result<Self, VmmError> {
        let block = PageBlock::alloc(mem, 2).ok_or(VmmError::OutOfMemory)?;
        let revision_id = msrs.revision_id();
        for page in 0..2 {
            // Safety: freshly allocated, page-aligned, exclusively owned.
            unsafe { *block.page(page).as_mut_ptr::<u32>() = revision_id };
        }
        Ok(Self { block })
    }

    /// The VMXON region, handed to the CPU for the lifetime of VMX root
    /// operation.
    pub(crate) fn vmxon_region(&self) -> Hpa {
        self.block.base_phys()
    }

    /// The VMCS. Opaque to software once loaded.
    pub(crate) fn vmcs_region(&self) -> Hpa {
        self.block.base_phys().add(crate::memory::PAGE_SIZE)
    }
}

fn vm_fail(fail: VmFail) -> VmmError {
    match fail {
        VmFail::VmFailInvalid => VmmError::VmxFailInvalid,
        VmFail::VmFailValid => {
            VmmError::VmxFailValid(vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32)
        }
    }
}

/// The wrapper of the VMXON instruction.
pub(crate) fn vmxon(region: Hpa) -> Result<(), VmmError> {
    // Safety: this kernel runs at CPL0 with the VMX fixed CR bits applied.
    unsafe { x86::bits64::vmx::vmxon(region.u64()) }.map_err(vm_fail)
}

/// The wrapper of the VMXOFF instruction.
pub(crate) fn vmxoff() -> Result<(), VmmError> {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(vm_fail)
}

/// The wrapper of the VMCLEAR instruction.
pub(crate) fn vmclear(region: Hpa) -> Result<(), VmmError> {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmclear(region.u64()) }.map_err(vm_fail)
}

/// The wrapper of the VMPTRLD instruction.
pub(crate) fn vmptrld(region: Hpa) -> Result<(), VmmError> {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrld(region.u64()) }.map_err(vm_fail)
}

/// The wrapper of the VMREAD instruction. Returns zero on error.
pub(crate) fn vmread(field: u32) -> u64 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// The wrapper of the VMWRITE instruction.
pub(crate) fn vmwrite<T: Into<u64>>(field: u32, value: T) -> Result<(), VmmError> {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmwrite(field, value.into()) }.map_err(vm_fail)
}

// Primary processor-based controls.
// See: Table 25-6. Definitions of Primary Processor-Based VM-Execution
//      Controls
const PROCBASED_CR3_LOAD_EXITING: u64 = 1 << 15;
const PROCBASED_UNCONDITIONAL_IO_EXITING: u64 = 1 << 24;
const PROCBASED_USE_MSR_BITMAPS: u64 = 1 << 28;
const PROCBASED_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;

// Secondary processor-based controls.
// See: Table 25-7. Definitions of Secondary Processor-Based VM-Execution
//      Controls
const PROCBASED2_ENABLE_EPT: u64 = 1 << 1;
const PROCBASED2_UNRESTRICTED_GUEST: u64 = 1 << 7;

// See: Table 25-13. Definitions of Primary VM-Exit Controls
const EXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
const EXIT_SAVE_IA32_EFER: u64 = 1 << 20;

// See: Table 25-18. Definitions of VM-Entry Controls
const ENTRY_LOAD_IA32_EFER: u64 = 1 << 15;

/// Everything except #UD and #PF traps to the host; those two the guest is
/// expected to handle itself.
const EXCEPTION_BITMAP: u32 =
    !((1 << x86::irq::INVALID_OPCODE_VECTOR) | (1 << x86::irq::PAGE_FAULT_VECTOR));

/// Programs the pin-based, processor-based and secondary controls, the
/// exception bitmap, the MSR bitmap address, the CR shadows and the EPTP.
pub(crate) fn write_exec_controls(
    msrs: &VmxMsrs,
    eptp: EptPointer,
    msr_bitmap: Hpa,
    guest_control: &ControlRegisters,
) -> Result<(), VmmError> {
    // No pin-based exits: interrupts stay masked on this host and NMIs are
    // not expected.
    vmwrite(
        vmcs::control::PINBASED_EXEC_CONTROLS,
        msrs.adjust(VmxControl::PinBased, 0),
    )?;
    vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        msrs.adjust(
            VmxControl::ProcessorBased,
            PROCBASED_USE_MSR_BITMAPS
                | PROCBASED_ACTIVATE_SECONDARY_CONTROLS
                | PROCBASED_CR3_LOAD_EXITING
                | PROCBASED_UNCONDITIONAL_IO_EXITING,
        ),
    )?;
    vmwrite(
        vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        msrs.adjust(
            VmxControl::ProcessorBased2,
            PROCBASED2_UNRESTRICTED_GUEST | PROCBASED2_ENABLE_EPT,
        ),
    )?;

    vmwrite(vmcs::control::EXCEPTION_BITMAP, EXCEPTION_BITMAP)?;
    vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap.u64())?;

    // Every CR0/CR4 bit is left to the guest: the shadow equals the initial
    // guest value and the mask claims none of the flexible bits for the
    // host beyond those the guest starts with.
    vmwrite(vmcs::control::CR0_READ_SHADOW, guest_control.cr0)?;
    vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, guest_control.cr0)?;
    vmwrite(vmcs::control::CR4_READ_SHADOW, guest_control.cr4)?;
    vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, guest_control.cr4)?;

    vmwrite(vmcs::control::EPTP_FULL, eptp.value())
}

/// Programs the VM-exit controls: return to a 64-bit host and save the
/// guest's EFER on the way out.
pub(crate) fn write_exit_controls(msrs: &VmxMsrs) -> Result<(), VmmError> {
    vmwrite(
        vmcs::control::VMEXIT_CONTROLS,
        msrs.adjust(
            VmxControl::VmExit,
            EXIT_HOST_ADDRESS_SPACE_SIZE | EXIT_SAVE_IA32_EFER,
        ),
    )
}

/// Programs the VM-entry controls. Long-mode entry follows from the EFER
/// value the entry loads.
pub(crate) fn write_entry_controls(msrs: &VmxMsrs) -> Result<(), VmmError> {
    vmwrite(
        vmcs::control::VMENTRY_CONTROLS,
        msrs.adjust(VmxControl::VmEntry, ENTRY_LOAD_IA32_EFER),
    )
}

/// Programs the host-state fields from the captured snapshot.
pub(crate) fn write_host_state(state: &HostState) -> Result<(), VmmError> {
    vmwrite(vmcs::host::CR0, state.control.cr0)?;
    vmwrite(vmcs::host::CR3, state.control.cr3)?;
    vmwrite(vmcs::host::CR4, state.control.cr4)?;

    vmwrite(vmcs::host::CS_SELECTOR, state.selectors.cs)?;
    vmwrite(vmcs::host::DS_SELECTOR, state.selectors.ds)?;
    vmwrite(vmcs::host::ES_SELECTOR, state.selectors.es)?;
    vmwrite(vmcs::host::SS_SELECTOR, state.selectors.ss)?;
    vmwrite(vmcs::host::FS_SELECTOR, state.selectors.fs)?;
    vmwrite(vmcs::host::GS_SELECTOR, state.selectors.gs)?;
    vmwrite(vmcs::host::TR_SELECTOR, state.selectors.tr)?;

    vmwrite(vmcs::host::TR_BASE, state.tr_base)?;
    vmwrite(vmcs::host::GDTR_BASE, state.gdtr_base)?;
    vmwrite(vmcs::host::IDTR_BASE, state.idtr_base)?;
    vmwrite(vmcs::host::FS_BASE, state.msr.fs_base)?;
    vmwrite(vmcs::host::GS_BASE, state.msr.gs_base)?;

    vmwrite(vmcs::host::IA32_SYSENTER_CS, state.msr.sysenter_cs)?;
    vmwrite(vmcs::host::IA32_SYSENTER_ESP, state.msr.sysenter_esp)?;
    vmwrite(vmcs::host::IA32_SYSENTER_EIP, state.msr.sysenter_eip)?;

    vmwrite(
        vmcs::host::IA32_PERF_GLOBAL_CTRL_FULL,
        state.msr.perf_global_ctrl,
    )?;
    vmwrite(vmcs::host::IA32_PAT_FULL, state.msr.pat)?;
    vmwrite(vmcs::host::IA32_EFER_FULL, state.msr.efer)?;

    vmwrite(vmcs::host::RSP, state.rsp)?;
    vmwrite(vmcs::host::RIP, state.rip)
}

// The four VMCS fields of a segment sit at a constant distance from its
// selector field, so one descriptor writer serves them all.
const SELECTOR_TO_LIMIT: u32 = vmcs::guest::ES_LIMIT - vmcs::guest::ES_SELECTOR;
const SELECTOR_TO_ACCESS: u32 = vmcs::guest::ES_ACCESS_RIGHTS - vmcs::guest::ES_SELECTOR;
const SELECTOR_TO_BASE: u32 = vmcs::guest::ES_BASE - vmcs::guest::ES_SELECTOR;

fn write_guest_segment(selector_field: u32, segment: &Segment) -> Result<(), VmmError> {
    vmwrite(selector_field, segment.selector)?;
    vmwrite(selector_field + SELECTOR_TO_LIMIT, segment.limit)?;
    vmwrite(selector_field + SELECTOR_TO_ACCESS, segment.access)?;
    vmwrite(selector_field + SELECTOR_TO_BASE, segment.base)
}

/// Programs the guest-state fields from the composed initial state.
pub(crate) fn write_guest_state(state: &GuestState) -> Result<(), VmmError> {
    vmwrite(vmcs::guest::CR0, state.control.cr0)?;
    vmwrite(vmcs::guest::CR3, state.control.cr3)?;
    vmwrite(vmcs::guest::CR4, state.control.cr4)?;

    write_guest_segment(vmcs::guest::CS_SELECTOR, &state.segments.cs)?;
    write_guest_segment(vmcs::guest::DS_SELECTOR, &state.segments.ds)?;
    write_guest_segment(vmcs::guest::ES_SELECTOR, &state.segments.es)?;
    write_guest_segment(vmcs::guest::SS_SELECTOR, &state.segments.ss)?;
    write_guest_segment(vmcs::guest::FS_SELECTOR, &state.segments.fs)?;
    write_guest_segment(vmcs::guest::GS_SELECTOR, &state.segments.gs)?;
    write_guest_segment(vmcs::guest::TR_SELECTOR, &state.segments.tr)?;
    write_guest_segment(vmcs::guest::LDTR_SELECTOR, &state.segments.ldtr)?;

    vmwrite(vmcs::guest::GDTR_BASE, state.gdtr.base)?;
    vmwrite(vmcs::guest::GDTR_LIMIT, state.gdtr.limit)?;
    vmwrite(vmcs::guest::IDTR_BASE, state.idtr.base)?;
    vmwrite(vmcs::guest::IDTR_LIMIT, state.idtr.limit)?;

    vmwrite(vmcs::guest::IA32_SYSENTER_CS, state.msr.sysenter_cs)?;
    vmwrite(vmcs::guest::IA32_SYSENTER_ESP, state.msr.sysenter_esp)?;
    vmwrite(vmcs::guest::IA32_SYSENTER_EIP, state.msr.sysenter_eip)?;

    vmwrite(vmcs::guest::IA32_PAT_FULL, state.msr.pat)?;
    vmwrite(vmcs::guest::IA32_EFER_FULL, state.msr.efer)?;
    vmwrite(vmcs::guest::IA32_BNDCFGS_FULL, state.msr.bndcfgs)?;
    vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, state.msr.debugctl)?;
    vmwrite(
        vmcs::guest::IA32_PERF_GLOBAL_CTRL_FULL,
        state.msr.perf_global_ctrl,
    )?;
    vmwrite(vmcs::guest::DR7, state.dr7)?;

    vmwrite(vmcs::guest::RFLAGS, state.regs.rflags)?;
    vmwrite(vmcs::guest::RSP, state.regs.rsp)?;
    vmwrite(vmcs::guest::RIP, state.regs.rip)?;

    // Active, nothing blocking events, no shadow VMCS.
    vmwrite(vmcs::guest::ACTIVITY_STATE, 0u32)?;
    vmwrite(vmcs::guest::INTERRUPTIBILITY_STATE, 0u32)?;
    vmwrite(vmcs::guest::LINK_PTR_FULL, state.vmcs_link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::vmx::msrs::NR_VMX_MSRS;

    #[test]
    fn segment_fields_sit_at_constant_offsets() {
        assert_eq!(SELECTOR_TO_LIMIT, 0x4000);
        assert_eq!(SELECTOR_TO_ACCESS, 0x4014);
        assert_eq!(SELECTOR_TO_BASE, 0x6006);
        // The same distances hold for every segment register.
        assert_eq!(
            vmcs::guest::TR_LIMIT,
            vmcs::guest::TR_SELECTOR + SELECTOR_TO_LIMIT
        );
        assert_eq!(
            vmcs::guest::LDTR_ACCESS_RIGHTS,
            vmcs::guest::LDTR_SELECTOR + SELECTOR_TO_ACCESS
        );
        assert_eq!(
            vmcs::guest::CS_BASE,
            vmcs::guest::CS_SELECTOR + SELECTOR_TO_BASE
        );
    }

    #[test]
    fn regions_carry_the_revision_id() {
        let mem = FakeMemory::new(4);
        let mut raw = [0u64; NR_VMX_MSRS];
        raw[0] = 0xdead_0000_8000_0004;
        let msrs = VmxMsrs::from_raw(raw);

        let regions = VmxRegions::alloc(&mem, &msrs).unwrap();
        for region in [regions.vmxon_region(), regions.vmcs_region()] {
            let word = unsafe { *mem.phys_to_virt(region).as_ptr::<u32>() };
            assert_eq!(word, 0x4);
            assert_eq!(word & 0x8000_0000, 0);
        }
        assert_eq!(
            regions.vmcs_region().u64(),
            regions.vmxon_region().u64() + 0x1000
        );
    }

    #[test]
    fn exception_bitmap_exempts_ud_and_pf() {
        assert_eq!(EXCEPTION_BITMAP & (1 << 6), 0);
        assert_eq!(EXCEPTION_BITMAP & (1 << 14), 0);
        assert_eq!(EXCEPTION_BITMAP | (1 << 6) | (1 << 14), u32::MAX);
    }
}
