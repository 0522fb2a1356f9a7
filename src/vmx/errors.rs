//! VMX error surface
//!
//! Every fallible operation of the hypervisor core returns one of a small
//! set of error classes; the detailed cause (which VM instruction failed,
//! which exit reason was unhandled) goes to the log.

/// An error returned by the hypervisor core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Page or array allocation failed.
    NoMemory,

    /// The CPU lacks a required capability, or the request exceeds one.
    NotSupported,

    /// The hardware is in a state incompatible with the request (control
    /// register fixed-bit violation, entering an unconfigured guest).
    BadState,

    /// The caller passed inconsistent or out-of-range arguments.
    InvalidArgs,

    /// A VMX instruction reported failure through the CPU flags.
    Internal,
}

pub type HvResult<T = ()> = Result<T, HvError>;

/// An error resulting from the execution of a VMX instruction.
///
/// Read from the VM-instruction error field for diagnosis after a failed
/// VMLAUNCH or VMRESUME. See Intel SDM Volume 3C, Section 30.4.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxInstructionError {
    /// VMCALL executed in VMX-root operation.
    VmCallRoot,
    /// VMCLEAR with invalid physical address.
    VmClearInvalid,
    /// VMCLEAR with VMXON pointer.
    VmClearVmxon,
    /// VMLAUNCH with non-clear VMCS.
    VmLaunchNonClear,
    /// VMRESUME with non-launched VMCS.
    VmResumeNonLaunched,
    /// VMRESUME after VMXOFF.
    VmResumeAfterVmxoff,
    /// VM entry with invalid control fields.
    VmEntryInvalidCtrlFields,
    /// VM entry with invalid host state.
    VmEntryInvalidHostState,
    /// VMPTRLD with invalid physical address.
    VmPtrldInvalidPhysAddr,
    /// VMPTRLD with VMXON pointer.
    VmPtrldVmxon,
    /// VMPTRLD with incorrect VMCS revision identifier.
    VmPtrldInvalidRevId,
    /// VMREAD/VMWRITE to unsupported component.
    VmAccessUnsupportedField,
    /// VMWRITE to read-only component.
    VmWriteToReadOnly,
    /// VMXON executed in VMX root operation.
    VmxonDuringVmxRoot,
    /// VM entry with invalid executive-VMCS pointer.
    VmEntryInvalidVmcs,
    /// VM entry with non-launched executive VMCS.
    VmEntryNonLaunched,
    /// VM entry with executive-VMCS pointer not VMXON pointer.
    VmEntryVmcsNotVmxon,
    /// VMCALL with non-clear VMCS.
    VmCallNonClearVmcs,
    /// VMCALL with invalid VM-exit control fields.
    VmCallInvalidExitCtrlFields,
    /// VMCALL with incorrect MSEG revision identifier.
    VmCallInvalidRevId,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM.
    VmxoffDualMonitor,
    /// VMCALL with invalid SMM-monitor features.
    VmCallInvalidSmmFeatures,
    /// VM entry with invalid VM-execution control fields in executive VMCS.
    VmEntryInvalidExecCtrlFields,
    /// VM entry with events blocked by MOV SS.
    VmEntryBlockedMovSS,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidInvEptInvPid,
    /// Unknown error.
    Unknown,
}

impl VmxInstructionError {
    pub fn from_u64(err: u64) -> VmxInstructionError {
        match err {
            1 => Self::VmCallRoot,
            2 => Self::VmClearInvalid,
            3 => Self::VmClearVmxon,
            4 => Self::VmLaunchNonClear,
            5 => Self::VmResumeNonLaunched,
            6 => Self::VmResumeAfterVmxoff,
            7 => Self::VmEntryInvalidCtrlFields,
            8 => Self::VmEntryInvalidHostState,
            9 => Self::VmPtrldInvalidPhysAddr,
            10 => Self::VmPtrldVmxon,
            11 => Self::VmPtrldInvalidRevId,
            12 => Self::VmAccessUnsupportedField,
            13 => Self::VmWriteToReadOnly,
            15 => Self::VmxonDuringVmxRoot,
            16 => Self::VmEntryInvalidVmcs,
            17 => Self::VmEntryNonLaunched,
            18 => Self::VmEntryVmcsNotVmxon,
            19 => Self::VmCallNonClearVmcs,
            20 => Self::VmCallInvalidExitCtrlFields,
            22 => Self::VmCallInvalidRevId,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmCallInvalidSmmFeatures,
            25 => Self::VmEntryInvalidExecCtrlFields,
            26 => Self::VmEntryBlockedMovSS,
            28 => Self::InvalidInvEptInvPid,
            _ => Self::Unknown,
        }
    }
}

/// The basic VM-exit reason.
///
/// See Intel SDM Volume 3D, Appendix C.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u16)]
pub enum ExitReason {
    /// An exception or NMI whose bit is set in the exception bitmap.
    Exception                       = 0,
    /// An external interrupt with "external-interrupt exiting" set.
    ExternalInterrupt               = 1,
    TripleFault                     = 2,
    InitSignal                      = 3,
    StartUpIpi                      = 4,
    IoSystemManagementInterrupt     = 5,
    OtherSmi                        = 6,
    InterruptWindow                 = 7,
    NmiWindow                       = 8,
    TaskSwitch                      = 9,
    /// Guest software attempted to execute CPUID.
    Cpuid                           = 10,
    Getsec                          = 11,
    Hlt                             = 12,
    Invd                            = 13,
    Invlpg                          = 14,
    Rdpmc                           = 15,
    Rdtsc                           = 16,
    Rsm                             = 17,
    Vmcall                          = 18,
    Vmclear                         = 19,
    Vmlaunch                        = 20,
    Vmptrld                         = 21,
    Vmptrst                         = 22,
    Vmread                          = 23,
    Vmresume                        = 24,
    Vmwrite                         = 25,
    Vmxoff                          = 26,
    Vmxon                           = 27,
    ControlRegisterAccess           = 28,
    MovDr                           = 29,
    /// Guest software attempted a port I/O instruction.
    IoInstruction                   = 30,
    Rdmsr                           = 31,
    /// Guest software attempted to execute WRMSR for an intercepted MSR.
    Wrmsr                           = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading        = 34,
    Mwait                           = 36,
    MonitorTrapFlag                 = 37,
    Monitor                         = 39,
    Pause                           = 40,
    VmEntryFailureMachineCheck      = 41,
    TprBelowThreshold               = 43,
    ApicAccess                      = 44,
    VirtualizedEoi                  = 45,
    AccessToGdtrOrIdtr              = 46,
    AccessToLdtrOrTr                = 47,
    EptViolation                    = 48,
    EptMisconfiguration             = 49,
    Invept                          = 50,
    Rdtscp                          = 51,
    VmxPreemptionTimerExpired       = 52,
    Invvpid                         = 53,
    Wbinvd                          = 54,
    Xsetbv                          = 55,
    ApicWrite                       = 56,
    Rdrand                          = 57,
    Invpcid                         = 58,
    Vmfunc                          = 59,
    Encls                           = 60,
    Rdseed                          = 61,
    PageModificationLogFull         = 62,
    Xsaves                          = 63,
    Xrstors                         = 64,
    /// An unknown exit reason.
    Unknown,
}

impl ExitReason {
    pub fn from_u16(reason: u16) -> Self {
        match reason {
            0 => Self::Exception,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            3 => Self::InitSignal,
            4 => Self::StartUpIpi,
            5 => Self::IoSystemManagementInterrupt,
            6 => Self::OtherSmi,
            7 => Self::InterruptWindow,
            8 => Self::NmiWindow,
            9 => Self::TaskSwitch,
            10 => Self::Cpuid,
            11 => Self::Getsec,
            12 => Self::Hlt,
            13 => Self::Invd,
            14 => Self::Invlpg,
            15 => Self::Rdpmc,
            16 => Self::Rdtsc,
            17 => Self::Rsm,
            18 => Self::Vmcall,
            19 => Self::Vmclear,
            20 => Self::Vmlaunch,
            21 => Self::Vmptrld,
            22 => Self::Vmptrst,
            23 => Self::Vmread,
            24 => Self::Vmresume,
            25 => Self::Vmwrite,
            26 => Self::Vmxoff,
            27 => Self::Vmxon,
            28 => Self::ControlRegisterAccess,
            29 => Self::MovDr,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::VmEntryFailureInvalidGuestState,
            34 => Self::VmEntryFailureMsrLoading,
            36 => Self::Mwait,
            37 => Self::MonitorTrapFlag,
            39 => Self::Monitor,
            40 => Self::Pause,
            41 => Self::VmEntryFailureMachineCheck,
            43 => Self::TprBelowThreshold,
            44 => Self::ApicAccess,
            45 => Self::VirtualizedEoi,
            46 => Self::AccessToGdtrOrIdtr,
            47 => Self::AccessToLdtrOrTr,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            50 => Self::Invept,
            51 => Self::Rdtscp,
            52 => Self::VmxPreemptionTimerExpired,
            53 => Self::Invvpid,
            54 => Self::Wbinvd,
            55 => Self::Xsetbv,
            56 => Self::ApicWrite,
            57 => Self::Rdrand,
            58 => Self::Invpcid,
            59 => Self::Vmfunc,
            60 => Self::Encls,
            61 => Self::Rdseed,
            62 => Self::PageModificationLogFull,
            63 => Self::Xsaves,
            64 => Self::Xrstors,
            _ => Self::Unknown,
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn exit_reason_roundtrip() {
        assert_eq!(ExitReason::from_u16(1), ExitReason::ExternalInterrupt);
        assert_eq!(ExitReason::from_u16(10), ExitReason::Cpuid);
        assert_eq!(ExitReason::from_u16(30), ExitReason::IoInstruction);
        assert_eq!(ExitReason::from_u16(32), ExitReason::Wrmsr);
        // Reserved encodings decode as unknown.
        assert_eq!(ExitReason::from_u16(35), ExitReason::Unknown);
        assert_eq!(ExitReason::from_u16(0x1234), ExitReason::Unknown);
    }

    #[test_case]
    fn instruction_error_decoding() {
        assert_eq!(
            VmxInstructionError::from_u64(4),
            VmxInstructionError::VmLaunchNonClear
        );
        assert_eq!(
            VmxInstructionError::from_u64(11),
            VmxInstructionError::VmPtrldInvalidRevId
        );
        assert_eq!(
            VmxInstructionError::from_u64(14),
            VmxInstructionError::Unknown
        );
    }
}
