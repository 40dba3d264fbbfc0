//! Host state loaded by the CPU on every VM-exit.
//!
//! Mostly a snapshot of the live registers, with two exceptions. The task
//! register: a multiboot2 entry leaves TR zero, which the VM-entry checks on
//! host state forbid, so a clone of the live GDT is grown by a TSS descriptor
//! and that TSS becomes the host TR. And RSP/RIP: exits land on a dedicated
//! stack with the instruction pointer at the exit stub.
//!
//! The word at the very top of that stack (host RSP points 32 bytes below
//! the stack end, and the word at host RSP) is the back-pointer to the
//! [`Vmm`] record. This is the ABI through which the exit stub finds its
//! context; it must not locate the VMM any other way.

use super::{
    guest::{ControlRegisters, MsrState},
    msrs::IA32_PERF_GLOBAL_CTRL,
    run::vm_exit_stub,
    VmmError,
};
use crate::{
    allocator::KernelMemory,
    memory::{PageBlock, PAGE_SIZE},
    x86_instructions::{
        cr0, cr3, cr4, rdmsr, read_cs, read_ds, read_es, read_fs, read_gs, read_ss, read_tr, sgdt,
        sidt,
    },
};
use alloc::{boxed::Box, vec::Vec};
use x86::{
    dtables::DescriptorTablePointer,
    msr,
    segmentation::{
        BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder, SegmentSelector,
    },
    Ring,
};

/// Bytes kept free above host RSP; the lowest of them holds the VMM
/// back-pointer.
const EXIT_STACK_RESERVED: u64 = 32;

/// The host segment selectors restored on VM-exit.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HostSelectors {
    pub(crate) cs: u16,
    pub(crate) ds: u16,
    pub(crate) es: u16,
    pub(crate) ss: u16,
    pub(crate) fs: u16,
    pub(crate) gs: u16,
    pub(crate) tr: u16,
}

pub(crate) struct HostState {
    pub(crate) control: ControlRegisters,
    pub(crate) selectors: HostSelectors,
    pub(crate) gdtr_base: u64,
    pub(crate) idtr_base: u64,
    pub(crate) tr_base: u64,
    pub(crate) msr: MsrState,
    pub(crate) rsp: u64,
    pub(crate) rip: u64,
    _gdt: HostGdt,
    _stack: PageBlock<'static, KernelMemory>,
}

impl HostState {
    pub(crate) fn capture(mem: &'static KernelMemory) -> Result<Self, VmmError> {
        let gdt = HostGdt::new();
        // STR reads back null under a fresh multiboot entry; the appended
        // TSS stands in whenever it does.
        let tr = match read_tr() {
            0 => gdt.tr,
            live => live,
        };

        let mut idtr = DescriptorTablePointer::<u64>::default();
        sidt(&mut idtr);

        let stack = PageBlock::alloc(mem, 1).ok_or(VmmError::OutOfMemory)?;
        let rsp = stack.base().u64() + PAGE_SIZE - EXIT_STACK_RESERVED;

        Ok(Self {
            control: ControlRegisters {
                cr0: cr0().bits() as u64,
                cr3: cr3(),
                cr4: cr4().bits() as u64,
            },
            selectors: HostSelectors {
                cs: read_cs(),
                ds: read_ds(),
                es: read_es(),
                ss: read_ss(),
                fs: read_fs(),
                gs: read_gs(),
                tr,
            },
            gdtr_base: gdt.base(),
            idtr_base: idtr.base as u64,
            tr_base: gdt.tss_base(),
            msr: MsrState {
                fs_base: rdmsr(msr::IA32_FS_BASE),
                gs_base: rdmsr(msr::IA32_GS_BASE),
                sysenter_cs: rdmsr(msr::IA32_SYSENTER_CS),
                sysenter_esp: rdmsr(msr::IA32_SYSENTER_ESP),
                sysenter_eip: rdmsr(msr::IA32_SYSENTER_EIP),
                perf_global_ctrl: rdmsr(IA32_PERF_GLOBAL_CTRL),
                pat: rdmsr(msr::IA32_PAT),
                efer: rdmsr(msr::IA32_EFER),
                debugctl: rdmsr(msr::IA32_DEBUGCTL),
                // MPX may be absent; there is no host BNDCFGS field anyway.
                bndcfgs: 0,
            },
            rsp,
            rip: vm_exit_stub as usize as u64,
            _gdt: gdt,
            _stack: stack,
        })
    }

    /// Plants the VMM back-pointer at the top of the exit stack.
    pub(crate) fn store_context(&mut self, vmm: *mut super::Vmm) {
        // Safety: rsp points into the owned exit stack page, 32 bytes below
        // its end.
        unsafe { *(self.rsp as *mut u64) = vmm as u64 };
    }
}

/// See: Figure 8-11. 64-Bit TSS Format
struct TaskStateSegment([u8; 104]);

/// A clone of the boot GDT with a TSS descriptor appended, giving the host
/// state a non-null TR. The CPU caches the TR base from the VMCS on exit and
/// never reads this table for it, but the descriptor is kept well-formed
/// regardless.
struct HostGdt {
    entries: Vec<u64>,
    tss: Box<TaskStateSegment>,
    tr: u16,
}

impl HostGdt {
    fn new() -> Self {
        let mut current = DescriptorTablePointer::<u64>::default();
        sgdt(&mut current);
        let live = unsafe {
            core::slice::from_raw_parts(current.base, (usize::from(current.limit) + 1) / 8)
        };

        let tss = Box::new(TaskStateSegment([0; 104]));
        let mut entries = Vec::with_capacity(live.len() + 2);
        entries.extend_from_slice(live);
        let tr_index = entries.len() as u16;
        entries.push(task_segment_descriptor(&tss));
        // Upper half of the 16-byte system descriptor; the TSS sits below
        // 4 GiB so it is all zeros.
        entries.push(0);

        Self {
            entries,
            tss,
            tr: SegmentSelector::new(tr_index, Ring::Ring0).bits(),
        }
    }

    fn base(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    fn tss_base(&self) -> u64 {
        core::ptr::from_ref::<TaskStateSegment>(&*self.tss) as u64
    }
}

/// Builds a segment descriptor for the task state segment.
fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = core::mem::size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let descriptor = <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(
        tss_base,
        tss_size - 1,
        true,
    )
    .present()
    .dpl(Ring::Ring0)
    .finish();
    // Safety: Descriptor is a plain 8-byte descriptor image.
    unsafe { core::mem::transmute::<Descriptor, u64>(descriptor) }
}
