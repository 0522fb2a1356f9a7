//! VMX transition state
//!
//! The register save area shared between Rust and the entry/exit
//! trampolines, and the trampolines themselves. The VMCS host-state area
//! points RSP at the `VmxState` and RIP at `vmx_exit_entry`, so on every VM
//! exit the CPU lands in the trampoline with the save area addressable
//! relative to RSP.

use core::arch::global_asm;
use core::mem::offset_of;

use super::errors::{HvError, HvResult};

// Offsets into VmxState, kept in sync with the assembly below.
const HS_RSP: usize = 0x00;
const HS_RBP: usize = 0x08;
const HS_RBX: usize = 0x10;
const HS_R12: usize = 0x18;
const HS_R13: usize = 0x20;
const HS_R14: usize = 0x28;
const HS_R15: usize = 0x30;
const GS_RAX: usize = 0x38;
const GS_RCX: usize = 0x40;
const GS_RDX: usize = 0x48;
const GS_RBX: usize = 0x50;
const GS_RBP: usize = 0x58;
const GS_RSI: usize = 0x60;
const GS_RDI: usize = 0x68;
const GS_R8: usize = 0x70;
const GS_R9: usize = 0x78;
const GS_R10: usize = 0x80;
const GS_R11: usize = 0x88;
const GS_R12: usize = 0x90;
const GS_R13: usize = 0x98;
const GS_R14: usize = 0xA0;
const GS_R15: usize = 0xA8;
const GS_CR2: usize = 0xB0;

/// Host registers live across a VMX transition.
///
/// Only the callee-saved registers and the stack pointer need to survive:
/// `vmx_enter` is an extern "C" call, everything else is caller-saved.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HostState {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Guest general-purpose registers.
///
/// RIP, RSP, and RFLAGS are maintained by the hardware in the VMCS; CR2 is
/// not, so it is swapped here alongside the GPRs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestState {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cr2: u64,
}

/// The register save area of one vCPU.
///
/// The VMCS `HOST_RSP` field holds the address of this structure, which
/// therefore must not move while the VMCS is in use (it is kept in a `Box`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxState {
    pub host_state: HostState,
    pub guest_state: GuestState,
}

const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, rsp) == HS_RSP);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, rbp) == HS_RBP);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, rbx) == HS_RBX);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, r12) == HS_R12);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, r13) == HS_R13);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, r14) == HS_R14);
const _: () = assert!(offset_of!(VmxState, host_state) + offset_of!(HostState, r15) == HS_R15);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rax) == GS_RAX);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rcx) == GS_RCX);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rdx) == GS_RDX);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rbx) == GS_RBX);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rbp) == GS_RBP);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rsi) == GS_RSI);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, rdi) == GS_RDI);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r8) == GS_R8);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r9) == GS_R9);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r10) == GS_R10);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r11) == GS_R11);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r12) == GS_R12);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r13) == GS_R13);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r14) == GS_R14);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, r15) == GS_R15);
const _: () = assert!(offset_of!(VmxState, guest_state) + offset_of!(GuestState, cr2) == GS_CR2);

extern "C" {
    /// Entry trampoline: saves the host callee-saved registers into the
    /// state, loads the guest registers, and executes VMLAUNCH or VMRESUME.
    /// Returns 0 after a VM exit, non-zero if the VM entry itself failed.
    fn vmx_enter_trampoline(state: *mut VmxState, resuming: u64) -> u64;

    /// Exit trampoline: the address written to `HOST_RIP`. Saves the guest
    /// registers relative to RSP (which the hardware loaded with `HOST_RSP`,
    /// the `VmxState` address), restores the host registers, and returns to
    /// the caller of `vmx_enter_trampoline`.
    pub fn vmx_exit_entry();
}

/// Enters the guest, returning after one VM exit.
///
/// On a VM-entry failure the error is reported through the CPU flags and no
/// exit information is valid; the caller reads the VM-instruction error
/// field for the cause.
///
/// SAFETY: the current VMCS must be fully configured, with `HOST_RSP`
/// pointing at `state` and `HOST_RIP` at `vmx_exit_entry`. Interrupts must
/// be disabled.
pub unsafe fn vmx_enter(state: &mut VmxState, resuming: bool) -> HvResult {
    if vmx_enter_trampoline(state, resuming as u64) == 0 {
        Ok(())
    } else {
        Err(HvError::Internal)
    }
}

global_asm!(
    r#"
.set HS_RSP, 0x00
.set HS_RBP, 0x08
.set HS_RBX, 0x10
.set HS_R12, 0x18
.set HS_R13, 0x20
.set HS_R14, 0x28
.set HS_R15, 0x30
.set GS_RAX, 0x38
.set GS_RCX, 0x40
.set GS_RDX, 0x48
.set GS_RBX, 0x50
.set GS_RBP, 0x58
.set GS_RSI, 0x60
.set GS_RDI, 0x68
.set GS_R8,  0x70
.set GS_R9,  0x78
.set GS_R10, 0x80
.set GS_R11, 0x88
.set GS_R12, 0x90
.set GS_R13, 0x98
.set GS_R14, 0xA0
.set GS_R15, 0xA8
.set GS_CR2, 0xB0

// u64 vmx_enter_trampoline(VmxState* rdi, u64 resuming);
.global vmx_enter_trampoline
vmx_enter_trampoline:
    // Save the host callee-saved registers and stack pointer.
    mov [rdi + HS_RSP], rsp
    mov [rdi + HS_RBP], rbp
    mov [rdi + HS_RBX], rbx
    mov [rdi + HS_R12], r12
    mov [rdi + HS_R13], r13
    mov [rdi + HS_R14], r14
    mov [rdi + HS_R15], r15
    // Keep the state pointer recoverable if the VM entry fails.
    push rdi
    // Load the guest CR2, the hardware does not switch it.
    mov rax, [rdi + GS_CR2]
    mov cr2, rax
    // Pick VMLAUNCH or VMRESUME; MOVs below leave the flags untouched.
    test esi, esi
    // Load the guest registers, the state pointer (RDI) goes last.
    mov rax, [rdi + GS_RAX]
    mov rcx, [rdi + GS_RCX]
    mov rdx, [rdi + GS_RDX]
    mov rbx, [rdi + GS_RBX]
    mov rbp, [rdi + GS_RBP]
    mov rsi, [rdi + GS_RSI]
    mov r8,  [rdi + GS_R8]
    mov r9,  [rdi + GS_R9]
    mov r10, [rdi + GS_R10]
    mov r11, [rdi + GS_R11]
    mov r12, [rdi + GS_R12]
    mov r13, [rdi + GS_R13]
    mov r14, [rdi + GS_R14]
    mov r15, [rdi + GS_R15]
    mov rdi, [rdi + GS_RDI]
    jnz 1f
    vmlaunch
    jmp 2f
1:
    vmresume
2:
    // The VM entry failed: the host stack is still active, recover the
    // state pointer and restore the callee-saved registers.
    pop rdi
    mov rbp, [rdi + HS_RBP]
    mov rbx, [rdi + HS_RBX]
    mov r12, [rdi + HS_R12]
    mov r13, [rdi + HS_R13]
    mov r14, [rdi + HS_R14]
    mov r15, [rdi + HS_R15]
    mov eax, 1
    ret

.global vmx_exit_entry
vmx_exit_entry:
    // On VM exit the hardware loaded RSP with HOST_RSP, the VmxState
    // address. Save the guest registers relative to it; pushes are not an
    // option, RSP is not a stack here.
    mov [rsp + GS_RAX], rax
    mov [rsp + GS_RCX], rcx
    mov [rsp + GS_RDX], rdx
    mov [rsp + GS_RBX], rbx
    mov [rsp + GS_RBP], rbp
    mov [rsp + GS_RSI], rsi
    mov [rsp + GS_RDI], rdi
    mov [rsp + GS_R8],  r8
    mov [rsp + GS_R9],  r9
    mov [rsp + GS_R10], r10
    mov [rsp + GS_R11], r11
    mov [rsp + GS_R12], r12
    mov [rsp + GS_R13], r13
    mov [rsp + GS_R14], r14
    mov [rsp + GS_R15], r15
    mov rax, cr2
    mov [rsp + GS_CR2], rax
    // Restore the host registers; RSP goes last since it is the base.
    mov rbp, [rsp + HS_RBP]
    mov rbx, [rsp + HS_RBX]
    mov r12, [rsp + HS_R12]
    mov r13, [rsp + HS_R13]
    mov r14, [rsp + HS_R14]
    mov r15, [rsp + HS_R15]
    mov rsp, [rsp + HS_RSP]
    // Report the VM exit as a successful entry.
    xor eax, eax
    ret
"#
);
