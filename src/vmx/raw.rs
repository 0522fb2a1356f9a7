//! VMX instruction wrappers
//!
//! One thin unsafe function per VMX instruction the core needs. Nothing
//! here checks processor state or argument validity; callers like the
//! VMXON engine and the VMCS builder own those invariants and get typed
//! results back through [`HvResult`].
//!
//! VMX instructions report failure through CF and ZF rather than faulting,
//! so every wrapper converts the flags into a result immediately after the
//! instruction executes.

use core::arch::asm;

use x86_64::registers::rflags::RFlags;

use super::errors::{HvError, HvResult};

/// Enters VMX root operation.
///
/// `addr` is the physical address of the VMXON region: page aligned, at
/// least the size the basic capability MSR reports, revision identifier
/// already written to its first four bytes.
pub unsafe fn vmxon(addr: u64) -> HvResult {
    asm!("vmxon ({0})", in(reg) &addr, options(att_syntax));
    vmx_capture_status()
}

/// Leaves VMX root operation.
///
/// Only valid while the processor is in VMX operation; afterwards the
/// VMXON region may be reclaimed.
pub unsafe fn vmxoff() -> HvResult {
    asm!("vmxoff");
    vmx_capture_status()
}

/// Puts the VMCS at physical address `addr` into the clear state and
/// flushes any cached copy of it, dropping it as the current VMCS.
pub unsafe fn vmclear(addr: u64) -> HvResult {
    asm!("vmclear ({0})", in(reg) &addr, options(att_syntax));
    vmx_capture_status()
}

/// Installs the VMCS at physical address `addr` as the current VMCS of
/// this logical processor. Subsequent VMREAD/VMWRITE go to it until another
/// VMPTRLD or VMCLEAR replaces it.
pub unsafe fn vmptrld(addr: u64) -> HvResult {
    asm!("vmptrld ({0})", in(reg) &addr, options(att_syntax));
    vmx_capture_status()
}

/// Writes `value` into `field` of the current VMCS.
pub unsafe fn vmwrite(field: u64, value: u64) -> HvResult {
    asm!("vmwrite {1}, {0}", in(reg) field, in(reg) value, options(att_syntax));
    vmx_capture_status()
}

/// Reads `field` of the current VMCS.
///
/// With a loaded VMCS and a valid field encoding this cannot fail, so a
/// failure is a bug in the caller and is only checked in debug builds.
pub unsafe fn vmread(field: u64) -> u64 {
    let value: u64;
    asm!("vmread {0}, {1}", out(reg) value, in(reg) field, options(att_syntax));
    debug_assert_eq!(vmx_capture_status(), Ok(()));
    value
}

/// Converts the CF/ZF failure convention of the VMX instructions (Intel
/// SDM, Volume 3C, Section 30.2) into a result.
//  Must stay inlined: any call or prologue between the VMX instruction and
//  the flags read could clobber RFLAGS and turn a failure into a success.
#[inline(always)]
pub(crate) fn vmx_capture_status() -> HvResult {
    let flags = rflags_read();

    if flags.contains(RFlags::ZERO_FLAG) || flags.contains(RFlags::CARRY_FLAG) {
        Err(HvError::Internal)
    } else {
        Ok(())
    }
}

/// Reads RFLAGS without going through a function call, for the same
/// inlining reason as [`vmx_capture_status`].
#[inline(always)]
fn rflags_read() -> RFlags {
    let r: u64;

    unsafe {
        asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
    }
    RFlags::from_bits_truncate(r)
}
