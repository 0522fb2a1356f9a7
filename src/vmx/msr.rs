//! VMX Model Specific Registers
//!
//! A collection of the model specific registers relevant to VMX.

pub use x86_64::registers::model_specific::Msr;

pub const FEATURE_CONTROL: Msr = Msr::new(0x3A);
pub const SYSENTER_CS: Msr = Msr::new(0x174);
pub const SYSENTER_ESP: Msr = Msr::new(0x175);
pub const SYSENTER_EIP: Msr = Msr::new(0x176);
pub const IA32_PAT: Msr = Msr::new(0x277);
pub const VMX_BASIC: Msr = Msr::new(0x480);
pub const VMX_PINBASED_CTLS: Msr = Msr::new(0x481);
pub const VMX_PROCBASED_CTLS: Msr = Msr::new(0x482);
pub const VMX_EXIT_CTLS: Msr = Msr::new(0x483);
pub const VMX_ENTRY_CTLS: Msr = Msr::new(0x484);
pub const VMX_MISC: Msr = Msr::new(0x485);
pub const VMX_CR0_FIXED0: Msr = Msr::new(0x486);
pub const VMX_CR0_FIXED1: Msr = Msr::new(0x487);
pub const VMX_CR4_FIXED0: Msr = Msr::new(0x488);
pub const VMX_CR4_FIXED1: Msr = Msr::new(0x489);
pub const VMX_PROCBASED_CTLS2: Msr = Msr::new(0x48B);
pub const VMX_EPT_VPID_CAP: Msr = Msr::new(0x48C);
pub const VMX_TRUE_PINBASED_CTLS: Msr = Msr::new(0x48D);
pub const VMX_TRUE_PROCBASED_CTLS: Msr = Msr::new(0x48E);
pub const VMX_TRUE_EXIT_CTLS: Msr = Msr::new(0x48F);
pub const VMX_TRUE_ENTRY_CTLS: Msr = Msr::new(0x490);
pub const IA32_EFER: Msr = Msr::new(0xC000_0080);
pub const IA32_STAR: Msr = Msr::new(0xC000_0081);
pub const IA32_LSTAR: Msr = Msr::new(0xC000_0082);
pub const IA32_FMASK: Msr = Msr::new(0xC000_0084);
pub const IA32_FS_BASE: Msr = Msr::new(0xC000_0100);
pub const IA32_GS_BASE: Msr = Msr::new(0xC000_0101);
pub const IA32_KERNEL_GS_BASE: Msr = Msr::new(0xC000_0102);

/// Lock bit of the feature control MSR, writes are rejected while set.
pub const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
/// VMXON enable bit (outside SMX operation) of the feature control MSR.
pub const FEATURE_CONTROL_VMXON: u64 = 1 << 2;

/// Raw MSR numbers, for the MSR bitmap and the MSR load/store lists which
/// encode MSRs by number rather than through an accessor.
pub const MSR_IA32_STAR: u32 = 0xC000_0081;
pub const MSR_IA32_LSTAR: u32 = 0xC000_0082;
pub const MSR_IA32_FMASK: u32 = 0xC000_0084;
pub const MSR_IA32_GS_BASE: u32 = 0xC000_0101;
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
