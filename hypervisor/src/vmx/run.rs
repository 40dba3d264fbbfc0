//! Guest entry and the VM-exit dispatch.
//!
//! Launching hands the machine to the guest: on success control only comes
//! back through [`vm_exit_stub`], which rebuilds the register frame on the
//! dedicated exit stack and calls [`vm_exit_handler`]. The handler either
//! fixes things up and returns, letting the stub VMRESUME, or panics for
//! exits this hypervisor has no answer for.

use super::{
    guest::GuestRegisters,
    vmcs::{vmread, vmwrite},
    Vmm, VmmError,
};
use crate::x86_instructions::{inb, inl, inw, outb, outl, outw};
use core::arch::global_asm;
use log::trace;
use x86::{current::rflags::RFlags, vmx::vmcs};

global_asm!(include_str!("run_vm.S"));

extern "C" {
    fn launch_vm_regs(regs: *const GuestRegisters) -> u64;
    /// The exit trampoline; its address becomes the VMCS host RIP.
    pub(crate) fn vm_exit_stub();
}

// See: Table C-1. Basic Exit Reasons
const EXIT_REASON_EXCEPTION_OR_NMI: u16 = 0;
const EXIT_REASON_TRIPLE_FAULT: u16 = 2;
const EXIT_REASON_CPUID: u16 = 10;
const EXIT_REASON_CR_ACCESS: u16 = 28;
const EXIT_REASON_IO_INSTRUCTION: u16 = 30;
const EXIT_REASON_EPT_VIOLATION: u16 = 48;
const EXIT_REASON_EPT_MISCONFIG: u16 = 49;

/// Issues VMLAUNCH with the composed register file. Returns only on failure.
pub(crate) fn launch(regs: &GuestRegisters) -> VmmError {
    // Safety: a current VMCS is loaded with all fields programmed, and the
    // VMM back-pointer sits on the exit stack.
    let flags = RFlags::from_raw(unsafe { launch_vm_regs(regs) });
    if flags.contains(RFlags::FLAGS_ZF) {
        VmmError::VmxFailValid(vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32)
    } else {
        VmmError::VmxFailInvalid
    }
}

/// Called by the stub with the VMM back-pointer and the register frame.
#[no_mangle]
extern "C" fn vm_exit_handler(vmm: *mut Vmm, frame: *mut GuestRegisters) {
    // Safety: the stub passes the pointer planted at the top of the exit
    // stack before launch and a frame it just built below it. Both live
    // exactly as long as the VM runs.
    let (vmm, frame) = unsafe { (&mut *vmm, &mut *frame) };

    // Complete the frame with the VMCS-managed registers.
    frame.rip = vmread(vmcs::guest::RIP);
    frame.rsp = vmread(vmcs::guest::RSP);
    frame.rflags = vmread(vmcs::guest::RFLAGS);

    let reason = vmread(vmcs::ro::EXIT_REASON) as u16;
    match reason {
        EXIT_REASON_CPUID => handle_cpuid(frame),
        EXIT_REASON_CR_ACCESS => handle_cr_access(vmm, frame),
        EXIT_REASON_IO_INSTRUCTION => handle_io(frame),
        EXIT_REASON_EPT_VIOLATION => panic!(
            "EPT violation at GPA {:#x}, qualification {:#x}, guest RIP {:#x}",
            vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL),
            vmread(vmcs::ro::EXIT_QUALIFICATION),
            frame.rip,
        ),
        EXIT_REASON_EPT_MISCONFIG => panic!(
            "EPT misconfiguration at GPA {:#x}",
            vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL)
        ),
        EXIT_REASON_EXCEPTION_OR_NMI => panic!(
            "guest exception, interruption info {:#x}, guest RIP {:#x}",
            vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO),
            frame.rip,
        ),
        EXIT_REASON_TRIPLE_FAULT => panic!("guest triple fault at RIP {:#x}", frame.rip),
        _ => panic!(
            "unhandled VM-exit {reason} at guest RIP {:#x}, qualification {:#x}",
            frame.rip,
            vmread(vmcs::ro::EXIT_QUALIFICATION),
        ),
    }
}

/// The stub calls this when VMRESUME itself fails.
#[no_mangle]
extern "C" fn vm_resume_failed(flags: u64) -> ! {
    let flags = RFlags::from_raw(flags);
    if flags.contains(RFlags::FLAGS_ZF) {
        panic!(
            "VMRESUME failed with error {}",
            vmread(vmcs::ro::VM_INSTRUCTION_ERROR)
        );
    }
    panic!("VMRESUME failed with an invalid VMCS pointer");
}

/// Moves the guest past the instruction that exited.
fn advance_guest_rip(frame: &GuestRegisters) {
    let next = frame.rip + vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
    vmwrite(vmcs::guest::RIP, next).expect("VMCS is current");
}

/// CPUID exits unconditionally; answer with the host's leaves, minus the
/// VMX bit so the guest does not try to bring up a hypervisor of its own.
fn handle_cpuid(frame: &mut GuestRegisters) {
    const FEATURE_INFO_LEAF: u32 = 1;
    const FEATURE_VMX_BIT: u32 = 1 << 5;

    let leaf = frame.rax as u32;
    let sub_leaf = frame.rcx as u32;
    let mut result = unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) };
    if leaf == FEATURE_INFO_LEAF {
        result.ecx &= !FEATURE_VMX_BIT;
    }
    frame.rax = u64::from(result.eax);
    frame.rbx = u64::from(result.ebx);
    frame.rcx = u64::from(result.ecx);
    frame.rdx = u64::from(result.edx);
    advance_guest_rip(frame);
}

fn gpr_mut(frame: &mut GuestRegisters, index: u64) -> &mut u64 {
    match index {
        0 => &mut frame.rax,
        1 => &mut frame.rcx,
        2 => &mut frame.rdx,
        3 => &mut frame.rbx,
        4 => &mut frame.rsp,
        5 => &mut frame.rbp,
        6 => &mut frame.rsi,
        7 => &mut frame.rdi,
        8 => &mut frame.r8,
        9 => &mut frame.r9,
        10 => &mut frame.r10,
        11 => &mut frame.r11,
        12 => &mut frame.r12,
        13 => &mut frame.r13,
        14 => &mut frame.r14,
        _ => &mut frame.r15,
    }
}

/// Only CR3 loads are configured to exit; stores never trap. The new value
/// goes straight into the guest CR3 field, and the cached copy keeps the
/// guest-virtual walks current.
/// See: Table 28-3. Exit Qualification for Control-Register Accesses
fn handle_cr_access(vmm: &mut Vmm, frame: &mut GuestRegisters) {
    let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
    let cr = qualification & 0xf;
    let access = (qualification >> 4) & 0b11;
    let register = (qualification >> 8) & 0xf;
    assert!(
        cr == 3 && access == 0,
        "unexpected CR{cr} access exit, type {access}"
    );

    let value = *gpr_mut(frame, register);
    trace!("guest CR3 <- {value:#x}");
    vmwrite(vmcs::guest::CR3, value).expect("VMCS is current");
    vmm.guest_state.control.cr3 = value;
    advance_guest_rip(frame);
}

/// Unconditional I/O exiting is on; pass the access through to the real
/// port. The guest's serial console ends up on the host UART this way.
/// See: Table 28-5. Exit Qualification for I/O Instructions
fn handle_io(frame: &mut GuestRegisters) {
    let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
    let size = (qualification & 0b111) + 1;
    let is_in = qualification & (1 << 3) != 0;
    let is_string = qualification & (1 << 4) != 0;
    let port = (qualification >> 16) as u16;
    assert!(!is_string, "string I/O at port {port:#x} is not handled");

    if is_in {
        let value = match size {
            1 => u64::from(inb(port)),
            2 => u64::from(inw(port)),
            _ => u64::from(inl(port)),
        };
        // Only the accessed width of RAX is touched.
        let mask = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        frame.rax = (frame.rax & !mask) | (value & mask);
    } else {
        match size {
            1 => outb(port, frame.rax as u8),
            2 => outw(port, frame.rax as u16),
            _ => outl(port, frame.rax as u32),
        }
    }
    advance_guest_rip(frame);
}
