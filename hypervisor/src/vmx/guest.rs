//! The initial guest state, as composed by the guest builder and programmed
//! into the VMCS by the field writer.

/// CR0, CR3 and CR4, for either side of a VM transition.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ControlRegisters {
    pub(crate) cr0: u64,
    pub(crate) cr3: u64,
    pub(crate) cr4: u64,
}

/// A GDTR or IDTR value.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DescriptorTable {
    pub(crate) base: u64,
    pub(crate) limit: u32,
}

/// A full segment descriptor as the VMCS wants it: selector, base, limit and
/// the packed access-rights word.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Segment {
    pub(crate) selector: u16,
    pub(crate) base: u64,
    pub(crate) limit: u32,
    pub(crate) access: u32,
}

/// The access-rights word marking a segment register as unusable.
pub(crate) const SEGMENT_UNUSABLE: u32 = 1 << 16;

/// Every segment register the guest carries, LDTR included.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Segments {
    pub(crate) cs: Segment,
    pub(crate) ds: Segment,
    pub(crate) es: Segment,
    pub(crate) ss: Segment,
    pub(crate) fs: Segment,
    pub(crate) gs: Segment,
    pub(crate) tr: Segment,
    pub(crate) ldtr: Segment,
}

/// The MSRs the CPU loads and saves across VM transitions.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MsrState {
    pub(crate) fs_base: u64,
    pub(crate) gs_base: u64,
    pub(crate) sysenter_cs: u64,
    pub(crate) sysenter_esp: u64,
    pub(crate) sysenter_eip: u64,
    pub(crate) perf_global_ctrl: u64,
    pub(crate) pat: u64,
    pub(crate) efer: u64,
    pub(crate) debugctl: u64,
    /// Guest only; there is no host BNDCFGS field.
    pub(crate) bndcfgs: u64,
}

/// The general-purpose register file.
///
/// The layout is an ABI shared with `run_vm.S`: the exit stub materializes
/// exactly this struct on the exit stack, and the launch path reads the
/// VMCS-unmanaged registers from it by offset. Keep it `repr(C)` and keep the
/// field order in sync with the push sequence in the stub.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct GuestRegisters {
    pub(crate) rip: u64,
    pub(crate) rflags: u64,
    pub(crate) rsp: u64,
    pub(crate) rbp: u64,
    pub(crate) rsi: u64,
    pub(crate) rdi: u64,
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
}

const _: () = assert!(core::mem::size_of::<GuestRegisters>() == 18 * 8);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, rbp) == 24);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, rsi) == 32);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, rdi) == 40);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, rbx) == 56);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, r8) == 80);

/// Everything the guest starts with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestState {
    pub(crate) regs: GuestRegisters,
    pub(crate) control: ControlRegisters,
    pub(crate) segments: Segments,
    pub(crate) gdtr: DescriptorTable,
    pub(crate) idtr: DescriptorTable,
    pub(crate) msr: MsrState,
    pub(crate) dr7: u64,
    /// The VMCS link pointer; all-ones while shadow VMCS stays unused.
    pub(crate) vmcs_link: u64,
}

impl Default for GuestState {
    fn default() -> Self {
        Self {
            regs: GuestRegisters::default(),
            control: ControlRegisters::default(),
            segments: Segments::default(),
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable::default(),
            msr: MsrState::default(),
            dr7: 0,
            vmcs_link: u64::MAX,
        }
    }
}
