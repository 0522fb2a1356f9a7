//! VM-exit handling
//!
//! Snapshot of the exit information fields, decoding of the I/O exit
//! qualification, and the dispatch table keyed by exit reason. Each handler
//! runs with the exiting VMCS loaded and interrupts disabled, and returns
//! whether the guest may be resumed.

use x86_64::instructions::interrupts;

use super::errors::{ExitReason, HvError, HvResult};
use super::fields::traits::*;
use super::fields::{GuestState32, GuestStateNat, Ro32, Ro64, RoNat};
use super::state::GuestState;
use crate::fifo::SerialFifo;

/// I/O port of the emulated UART data register.
const UART_IO_PORT: u16 = 0x3F8;

/// Maximum basic leaf for CPUID information.
const CPUID_BASE: u64 = 0;

// ————————————————————————————— Exit Information ——————————————————————————— //

/// Snapshot of the VM-exit information fields, read once per exit.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub exit_reason: ExitReason,
    pub exit_qualification: u64,
    pub interruption_information: u32,
    pub interruption_error_code: u32,
    pub instruction_length: u32,
    pub instruction_information: u32,
    pub guest_physical_address: u64,
    pub guest_linear_address: u64,
    pub guest_interruptibility_state: u32,
    pub guest_rip: u64,
}

impl ExitInfo {
    /// Reads the exit information from the current VMCS.
    ///
    /// SAFETY: the VMCS that took the exit must be loaded.
    pub unsafe fn read() -> Self {
        let exit_info = ExitInfo {
            exit_reason: ExitReason::from_u16(Ro32::ExitReason.vmread() as u16),
            exit_qualification: RoNat::ExitQualification.vmread() as u64,
            interruption_information: Ro32::InterruptionInfo.vmread(),
            interruption_error_code: Ro32::InterruptionErrCode.vmread(),
            instruction_length: Ro32::ExitInstructionLength.vmread(),
            instruction_information: Ro32::ExitInstructionInfo.vmread(),
            guest_physical_address: Ro64::GuestPhysAddr.vmread(),
            guest_linear_address: RoNat::GuestLinearAddr.vmread() as u64,
            guest_interruptibility_state: GuestState32::InterruptibilityState.vmread(),
            guest_rip: GuestStateNat::Rip.vmread() as u64,
        };

        log::trace!("exit reason: {:?}", exit_info.exit_reason);
        log::trace!("exit qualification: {:#x}", exit_info.exit_qualification);
        log::trace!("instruction length: {}", exit_info.instruction_length);
        log::trace!("guest rip: {:#x}", exit_info.guest_rip);
        exit_info
    }
}

/// Decoded exit qualification of an I/O instruction exit.
///
/// See Intel SDM, Volume 3C, Table 27-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoInfo {
    /// Access width in bytes, 1 through 4.
    pub bytes: u8,
    /// IN or INS rather than OUT or OUTS.
    pub input: bool,
    /// String instruction (INS/OUTS).
    pub string: bool,
    /// Instruction has a REP prefix.
    pub repeat: bool,
    /// The accessed port.
    pub port: u16,
}

impl IoInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        IoInfo {
            bytes: (qualification & 0b111) as u8 + 1,
            input: qualification & (1 << 3) != 0,
            string: qualification & (1 << 4) != 0,
            repeat: qualification & (1 << 5) != 0,
            port: (qualification >> 16) as u16,
        }
    }
}

// ———————————————————————————————— Handlers ———————————————————————————————— //

/// Moves the guest past the exiting instruction.
unsafe fn next_rip(exit_info: &ExitInfo) -> HvResult {
    GuestStateNat::Rip.vmwrite((exit_info.guest_rip + exit_info.instruction_length as u64) as usize)
}

unsafe fn handle_external_interrupt() -> HvResult {
    // Briefly open an interrupt window so the host can service the pending
    // interrupt that forced the exit.
    debug_assert!(!interrupts::are_enabled());
    interrupts::enable();
    interrupts::disable();
    Ok(())
}

unsafe fn handle_cpuid(exit_info: &ExitInfo, guest_state: &mut GuestState) -> HvResult {
    match guest_state.rax {
        CPUID_BASE => {
            next_rip(exit_info)?;
            let result = core::arch::x86_64::__cpuid(CPUID_BASE as u32);
            guest_state.rbx = result.ebx as u64;
            guest_state.rcx = result.ecx as u64;
            guest_state.rdx = result.edx as u64;
            // Maximum input value for basic CPUID information.
            guest_state.rax = 0;
            Ok(())
        }
        _ => Err(HvError::NotSupported),
    }
}

unsafe fn handle_io(
    exit_info: &ExitInfo,
    guest_state: &GuestState,
    serial_fifo: &SerialFifo,
) -> HvResult {
    next_rip(exit_info)?;

    // Only byte-stream writes to the UART data register are forwarded;
    // everything else is consumed with no effect.
    let io_info = IoInfo::from_qualification(exit_info.exit_qualification);
    if io_info.input || io_info.string || io_info.repeat || io_info.port != UART_IO_PORT {
        return Ok(());
    }
    let data = guest_state.rax.to_le_bytes();
    serial_fifo.write(&data[..io_info.bytes as usize])
}

/// Dispatches one VM exit to its handler.
///
/// SAFETY: the VMCS that took the exit must be loaded and interrupts must
/// be disabled.
pub(crate) unsafe fn handle_vmexit(
    guest_state: &mut GuestState,
    serial_fifo: &SerialFifo,
) -> HvResult {
    let exit_info = ExitInfo::read();

    match exit_info.exit_reason {
        ExitReason::ExternalInterrupt => handle_external_interrupt(),
        ExitReason::Cpuid => handle_cpuid(&exit_info, guest_state),
        ExitReason::IoInstruction => handle_io(&exit_info, guest_state, serial_fifo),
        ExitReason::Wrmsr => {
            // Writes to MSRs outside the bitmap's pass-through set are not
            // serviced yet.
            Err(HvError::NotSupported)
        }
        reason => {
            log::debug!("unhandled VM exit: {:?}", reason);
            Err(HvError::NotSupported)
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn io_info_decoding() {
        // OUT 0x3F8, AL: one byte, output, no string, no rep.
        let io_info = IoInfo::from_qualification(0x3F8 << 16);
        assert_eq!(io_info.bytes, 1);
        assert!(!io_info.input);
        assert!(!io_info.string);
        assert!(!io_info.repeat);
        assert_eq!(io_info.port, 0x3F8);

        // REP INSW to port 0x60.
        let io_info = IoInfo::from_qualification((0x60 << 16) | 0b111001);
        assert_eq!(io_info.bytes, 2);
        assert!(io_info.input);
        assert!(io_info.string);
        assert!(io_info.repeat);
        assert_eq!(io_info.port, 0x60);

        // Four byte access.
        let io_info = IoInfo::from_qualification(0b011);
        assert_eq!(io_info.bytes, 4);
        assert_eq!(io_info.port, 0);
    }
}
