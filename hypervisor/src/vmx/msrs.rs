//! Snapshot of the VMX capability MSR family.
//!
//! The CPU describes what a VMCS control field may hold through a family of
//! read-only capability MSRs starting at `IA32_VMX_BASIC`. They are read once
//! at bring-up into [`VmxMsrs`] and consulted from then on; nothing in the
//! VMX path touches the live MSRs again.

use crate::x86_instructions::rdmsr;
use x86::msr;

/// How many consecutive MSRs, starting at `IA32_VMX_BASIC` (0x480), make up
/// the capability family (through `IA32_VMX_VMFUNC`, 0x491).
pub(crate) const NR_VMX_MSRS: usize = 18;

// Not in the x86 crate's generated MSR list.
pub(crate) const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;

/// The VMCS control words whose allowed values are governed by a capability
/// MSR.
#[derive(Clone, Copy)]
pub(crate) enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// The raw capability words, indexed by MSR number offset from
/// `IA32_VMX_BASIC`.
pub(crate) struct VmxMsrs {
    raw: [u64; NR_VMX_MSRS],
}

impl VmxMsrs {
    /// Snapshots the whole family from the live CPU.
    pub(crate) fn read() -> Self {
        let mut raw = [0u64; NR_VMX_MSRS];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = rdmsr(msr::IA32_VMX_BASIC + i as u32);
        }
        Self { raw }
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: [u64; NR_VMX_MSRS]) -> Self {
        Self { raw }
    }

    /// The snapshotted value of the given capability MSR.
    pub(crate) fn get(&self, msr: u32) -> u64 {
        self.raw[(msr - msr::IA32_VMX_BASIC) as usize]
    }

    /// The VMCS revision identifier stamped into the VMXON and VMCS regions.
    /// Bits 30:0 of `IA32_VMX_BASIC`; bit 31 must read as zero in a region.
    pub(crate) fn revision_id(&self) -> u32 {
        self.get(msr::IA32_VMX_BASIC) as u32 & 0x7fff_ffff
    }

    pub(crate) fn cr0_fixed0(&self) -> u64 {
        self.get(msr::IA32_VMX_CR0_FIXED0)
    }

    pub(crate) fn cr0_fixed1(&self) -> u64 {
        self.get(msr::IA32_VMX_CR0_FIXED1)
    }

    pub(crate) fn cr4_fixed0(&self) -> u64 {
        self.get(msr::IA32_VMX_CR4_FIXED0)
    }

    pub(crate) fn cr4_fixed1(&self) -> u64 {
        self.get(msr::IA32_VMX_CR4_FIXED1)
    }

    /// Picks the capability MSR governing `control`.
    ///
    /// When `IA32_VMX_BASIC[55]` is set the TRUE variants report the allowed
    /// settings with the default1 class decoupled, and consulting only them
    /// is sufficient. There is no TRUE variant for the secondary controls.
    fn capability_of(&self, control: VmxControl) -> u64 {
        const VMX_BASIC_TRUE_CONTROLS_FLAG: u64 = 1 << 55;

        let has_true = (self.get(msr::IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS_FLAG) != 0;
        let msr = match (control, has_true) {
            (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
            (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
            (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
            (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
            (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
            (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
            (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        };
        self.get(msr)
    }

    /// Adjusts a requested control word against the capability MSR for
    /// `control` and returns the value to program into the VMCS.
    pub(crate) fn adjust(&self, control: VmxControl, requested: u64) -> u64 {
        apply_capability(requested, self.capability_of(control))
    }
}

/// The low 32 bits of a capability word are the bits that must be 1, the
/// high 32 bits the bits that may be 1:
///
///        Low bit (allowed 0)  High bit (allowed 1)  Meaning
/// Bit X  1                    1                     flexible
/// Bit X  1                    0                     fixed to 0
/// Bit X  0                    1                     fixed to 1
pub(crate) fn apply_capability(requested: u64, capability: u64) -> u64 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    u64::from((requested as u32 | allowed0) & allowed1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(must_be_1: u32, may_be_1: u32) -> u64 {
        u64::from(must_be_1) | (u64::from(may_be_1) << 32)
    }

    #[test]
    fn adjust_is_idempotent_and_bounded() {
        let requests = [0u64, 1, 0x16, 0xffff_ffff, 0x8000_0000, 0x0f0f_0f0f];
        // Hardware guarantees the must-be-1 bits are a subset of the
        // may-be-1 bits; only well-formed words appear here.
        let caps = [
            cap(0, 0),
            cap(0x16, 0xff),
            cap(0x401e_172d, 0xffff_ffff),
            cap(0x16, 0x401e_177f),
            cap(0xffff_ffff, 0xffff_ffff),
            cap(0, 0xffff_ffff),
        ];
        for &r in &requests {
            for &c in &caps {
                let once = apply_capability(r, c);
                assert_eq!(apply_capability(once, c), once);
                // Every must-be-1 bit is set, no must-be-0 bit is.
                assert_eq!(once as u32 & c as u32, c as u32);
                assert_eq!(once & !(c >> 32) & 0xffff_ffff, 0);
            }
        }
    }

    #[test]
    fn adjust_pin_based_example() {
        assert_eq!(apply_capability(0, cap(0x16, 0xff)), 0x16);
    }

    #[test]
    fn revision_id_clears_shadow_bit() {
        let mut raw = [0u64; NR_VMX_MSRS];
        raw[0] = 0x8001_2345;
        let msrs = VmxMsrs::from_raw(raw);
        assert_eq!(msrs.revision_id(), 0x1_2345);
        assert_eq!(msrs.revision_id() & 0x8000_0000, 0);
    }

    #[test]
    fn true_capability_msrs_win_when_advertised() {
        let mut raw = [0u64; NR_VMX_MSRS];
        raw[0] = 1 << 55;
        raw[(x86::msr::IA32_VMX_TRUE_PINBASED_CTLS - x86::msr::IA32_VMX_BASIC) as usize] =
            cap(0x1, 0xff);
        raw[(x86::msr::IA32_VMX_PINBASED_CTLS - x86::msr::IA32_VMX_BASIC) as usize] =
            cap(0x16, 0xff);
        let msrs = VmxMsrs::from_raw(raw);
        assert_eq!(msrs.adjust(VmxControl::PinBased, 0), 0x1);

        raw[0] = 0;
        let msrs = VmxMsrs::from_raw(raw);
        assert_eq!(msrs.adjust(VmxControl::PinBased, 0), 0x16);
    }
}
