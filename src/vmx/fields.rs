//! Typed VMCS field encodings
//!
//! The hardware addresses VMCS fields by a raw encoding (Intel SDM, Volume
//! 3D, Appendix B) and the access width is the field's property, not the
//! instruction's. Passing a raw `u64` everywhere would let a 32-bit control
//! be written with a 64-bit value and silently truncate, so each field
//! lives in an enum named after its area and width: `Ctrl16/32/64`,
//! `Ro32/64/Nat` for the exit-information fields, `GuestState*`, and
//! `HostState*`. A per-width trait (`VmcsField16` through
//! `VmcsFieldNatWidth`) supplies `vmread`/`vmwrite` taking exactly the
//! integer type the width allows, so a mismatched access does not compile.
//!
//! All accesses target whichever VMCS is current on this processor; hold an
//! `ActiveVmcs` scope while using them.

use super::raw;
use super::HvResult;

// ————————————————————————————————— Traits ————————————————————————————————— //

// Bring all traits into current scope
use traits::*;

pub mod traits {
    use super::*;

    /// Access to the 16-bit fields of the current VMCS.
    pub trait VmcsField16 {
        fn raw(&self) -> u32;

        unsafe fn vmwrite(&self, value: u16) -> HvResult {
            raw::vmwrite(self.raw() as u64, value as u64)
        }

        unsafe fn vmread(&self) -> u16 {
            raw::vmread(self.raw() as u64) as u16
        }
    }

    /// Access to the 32-bit fields of the current VMCS.
    pub trait VmcsField32 {
        fn raw(&self) -> u32;

        unsafe fn vmwrite(&self, value: u32) -> HvResult {
            raw::vmwrite(self.raw() as u64, value as u64)
        }

        unsafe fn vmread(&self) -> u32 {
            raw::vmread(self.raw() as u64) as u32
        }
    }

    /// Access to the 64-bit fields of the current VMCS.
    pub trait VmcsField64 {
        fn raw(&self) -> u32;

        unsafe fn vmwrite(&self, value: u64) -> HvResult {
            raw::vmwrite(self.raw() as u64, value)
        }

        unsafe fn vmread(&self) -> u64 {
            raw::vmread(self.raw() as u64)
        }
    }

    /// Access to the natural-width fields of the current VMCS, which are 64
    /// bits wide in 64-bit mode and carried as `usize` here.
    pub trait VmcsFieldNatWidth {
        fn raw(&self) -> u32;

        unsafe fn vmwrite(&self, value: usize) -> HvResult {
            raw::vmwrite(self.raw() as u64, value as u64)
        }

        unsafe fn vmread(&self) -> usize {
            raw::vmread(self.raw() as u64) as usize
        }
    }
}

// ————————————————————————————— Control Fields ————————————————————————————— //

/// 16-bit control fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ctrl16 {
    Vpid              = 0x00000000,
    PostedIntNotifVec = 0x00000002,
    EptpIndex         = 0x00000004,
}

impl VmcsField16 for Ctrl16 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 32-bit control fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Ctrl32 {
    PinBasedExecCtrls             = 0x00004000,
    PrimaryProcBasedExecCtrls     = 0x00004002,
    ExceptionBitmap               = 0x00004004,
    PageFaultErrCodeMask          = 0x00004006,
    PageFaultErrCodeMatch         = 0x00004008,
    Cr3TargetCount                = 0x0000400A,
    VmExitCtrls                   = 0x0000400C,
    VmExitMsrStoreCount           = 0x0000400E,
    VmExitMsrLoadCount            = 0x00004010,
    VmEntryCtrls                  = 0x00004012,
    VmEntryMsrLoadCount           = 0x00004014,
    VmEntryIntInfoField           = 0x00004016,
    VmEntryExceptErrCode          = 0x00004018,
    VmEntryInstrLength            = 0x0000401A,
    TprThreshold                  = 0x0000401C,
    SecondaryProcBasedExecCtrls   = 0x0000401E,
    PleGap                        = 0x00004020,
    PleWindow                     = 0x00004022,
}

impl VmcsField32 for Ctrl32 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 64-bit control fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ctrl64 {
    IoBitmapA           = 0x00002000,
    IoBitmapB           = 0x00002002,
    MsrBitmaps          = 0x00002004,
    VmExitMsrStoreAddr  = 0x00002006,
    VmExitMsrLoadAddr   = 0x00002008,
    VmEntryMsrLoadAddr  = 0x0000200A,
    ExecVmcsPtr         = 0x0000200C,
    TscOffset           = 0x00002010,
    VirtApicAddr        = 0x00002012,
    ApicAccessAddr      = 0x00002014,
    VmFuncCtrls         = 0x00002018,
    EptPtr              = 0x0000201A,
    EptpListAddr        = 0x00002024,
    XssExitBitmap       = 0x0000202C,
}

impl VmcsField64 for Ctrl64 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

// ———————————————————————————— Read-Only Fields ———————————————————————————— //

/// 32-bit read-only fields, filled in by the processor on VM exit.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ro32 {
    VmInstructionError     = 0x00004400,
    ExitReason             = 0x00004402,
    InterruptionInfo       = 0x00004404,
    InterruptionErrCode    = 0x00004406,
    IdtVectoringInfo       = 0x00004408,
    IdtVectoringErrCode    = 0x0000440A,
    ExitInstructionLength  = 0x0000440C,
    ExitInstructionInfo    = 0x0000440E,
}

impl VmcsField32 for Ro32 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 64-bit read-only fields, filled in by the processor on VM exit.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ro64 {
    GuestPhysAddr = 0x00002400,
}

impl VmcsField64 for Ro64 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// Natural-width read-only fields, filled in by the processor on VM exit.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RoNat {
    ExitQualification = 0x00006400,
    IoRcx             = 0x00006402,
    IoRsi             = 0x00006404,
    IoRdi             = 0x00006406,
    IoRip             = 0x00006408,
    GuestLinearAddr   = 0x0000640A,
}

impl VmcsFieldNatWidth for RoNat {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

// ——————————————————————————— Guest State Fields ——————————————————————————— //

/// 16-bit guest-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestState16 {
    EsSelector      = 0x00000800,
    CsSelector      = 0x00000802,
    SsSelector      = 0x00000804,
    DsSelector      = 0x00000806,
    FsSelector      = 0x00000808,
    GsSelector      = 0x0000080A,
    LdtrSelector    = 0x0000080C,
    TrSelector      = 0x0000080E,
    InterruptStatus = 0x00000810,
    PmlIndex        = 0x00000812,
}

impl VmcsField16 for GuestState16 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 32-bit guest-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestState32 {
    EsLimit                  = 0x00004800,
    CsLimit                  = 0x00004802,
    SsLimit                  = 0x00004804,
    DsLimit                  = 0x00004806,
    FsLimit                  = 0x00004808,
    GsLimit                  = 0x0000480A,
    LdtrLimit                = 0x0000480C,
    TrLimit                  = 0x0000480E,
    GdtrLimit                = 0x00004810,
    IdtrLimit                = 0x00004812,
    EsAccessRights           = 0x00004814,
    CsAccessRights           = 0x00004816,
    SsAccessRights           = 0x00004818,
    DsAccessRights           = 0x0000481A,
    FsAccessRights           = 0x0000481C,
    GsAccessRights           = 0x0000481E,
    LdtrAccessRights         = 0x00004820,
    TrAccessRights           = 0x00004822,
    InterruptibilityState    = 0x00004824,
    ActivityState            = 0x00004826,
    Smbase                   = 0x00004828,
    Ia32SysenterCs           = 0x0000482A,
    VmxPreemptionTimerValue  = 0x0000482E,
}

impl VmcsField32 for GuestState32 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 64-bit guest-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestState64 {
    VmcsLinkPtr   = 0x00002800,
    Ia32Debugctl  = 0x00002802,
    Ia32Pat       = 0x00002804,
    Ia32Efer      = 0x00002806,
    Pdpte0        = 0x0000280A,
    Pdpte1        = 0x0000280C,
    Pdpte2        = 0x0000280E,
    Pdpte3        = 0x00002810,
}

impl VmcsField64 for GuestState64 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// Natural-width guest-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestStateNat {
    Cr0                    = 0x00006800,
    Cr3                    = 0x00006802,
    Cr4                    = 0x00006804,
    EsBase                 = 0x00006806,
    CsBase                 = 0x00006808,
    SsBase                 = 0x0000680A,
    DsBase                 = 0x0000680C,
    FsBase                 = 0x0000680E,
    GsBase                 = 0x00006810,
    LdtrBase               = 0x00006812,
    TrBase                 = 0x00006814,
    GdtrBase               = 0x00006816,
    IdtrBase               = 0x00006818,
    Dr7                    = 0x0000681A,
    Rsp                    = 0x0000681C,
    Rip                    = 0x0000681E,
    Rflags                 = 0x00006820,
    PendingDebugExceptions = 0x00006822,
    Ia32SysenterEsp        = 0x00006824,
    Ia32SysenterEip        = 0x00006826,
}

impl VmcsFieldNatWidth for GuestStateNat {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

// ——————————————————————————— Host State Fields ———————————————————————————— //

/// 16-bit host-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostState16 {
    EsSelector = 0x00000C00,
    CsSelector = 0x00000C02,
    SsSelector = 0x00000C04,
    DsSelector = 0x00000C06,
    FsSelector = 0x00000C08,
    GsSelector = 0x00000C0A,
    TrSelector = 0x00000C0C,
}

impl VmcsField16 for HostState16 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 32-bit host-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostState32 {
    Ia32SysenterCs = 0x00004C00,
}

impl VmcsField32 for HostState32 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// 64-bit host-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostState64 {
    Ia32Pat  = 0x00002C00,
    Ia32Efer = 0x00002C02,
}

impl VmcsField64 for HostState64 {
    fn raw(&self) -> u32 {
        *self as u32
    }
}

/// Natural-width host-state fields.
#[rustfmt::skip]
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostStateNat {
    Cr0             = 0x00006C00,
    Cr3             = 0x00006C02,
    Cr4             = 0x00006C04,
    FsBase          = 0x00006C06,
    GsBase          = 0x00006C08,
    TrBase          = 0x00006C0A,
    GdtrBase        = 0x00006C0C,
    IdtrBase        = 0x00006C0E,
    Ia32SysenterEsp = 0x00006C10,
    Ia32SysenterEip = 0x00006C12,
    Rsp             = 0x00006C14,
    Rip             = 0x00006C16,
}

impl VmcsFieldNatWidth for HostStateNat {
    fn raw(&self) -> u32 {
        *self as u32
    }
}
