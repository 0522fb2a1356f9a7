//! Control-field and EPT bit sets
//!
//! Named bits for the values the VMCS builder assembles: the four
//! VM-execution/entry/exit control words, guest segment access rights, and
//! EPT entry flags. Each set mirrors one hardware-defined 32- or 64-bit
//! layout, so a control is requested by name and the capability-MSR
//! arithmetic in the builder works on `bits()` rather than magic numbers.

use bitflags::bitflags;

bitflags! {
    /// Pin-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.1.
    pub struct PinbasedControls: u32 {
        /// External-interrupt exiting.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMI exiting.
        const NMI_EXITING                = 1 << 3;
        /// Virtual NMIs.
        const VIRTUAL_NMIS               = 1 << 5;
        /// Activate VMX-preemption timer.
        const VMX_PREEMPTION_TIMER       = 1 << 6;
        /// Process posted interrupts.
        const POSTED_INTERRUPTS          = 1 << 7;
    }

    /// Primary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-6.
    pub struct PrimaryControls: u32 {
        /// Interrupt-window exiting.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// Use TSC offsetting.
        const USE_TSC_OFFSETTING       = 1 << 3;
        /// HLT exiting.
        const HLT_EXITING              = 1 << 7;
        /// INVLPG exiting.
        const INVLPG_EXITING           = 1 << 9;
        /// MWAIT exiting.
        const MWAIT_EXITING            = 1 << 10;
        /// RDPMC exiting.
        const RDPMC_EXITING            = 1 << 11;
        /// RDTSC exiting.
        const RDTSC_EXITING            = 1 << 12;
        /// CR3-load exiting.
        const CR3_LOAD_EXITING         = 1 << 15;
        /// CR3-store exiting.
        const CR3_STORE_EXITING        = 1 << 16;
        /// CR8-load exiting.
        const CR8_LOAD_EXITING         = 1 << 19;
        /// CR8-store exiting.
        const CR8_STORE_EXITING        = 1 << 20;
        /// Use TPR shadow.
        const USE_TPR_SHADOW           = 1 << 21;
        /// NMI-window exiting.
        const NMI_WINDOW_EXITING       = 1 << 22;
        /// MOV-DR exiting.
        const MOV_DR_EXITING           = 1 << 23;
        /// Unconditional I/O exiting.
        const UNCOND_IO_EXITING        = 1 << 24;
        /// Use I/O bitmaps.
        const USE_IO_BITMAPS           = 1 << 25;
        /// Monitor trap flag.
        const MONITOR_TRAP_FLAG        = 1 << 27;
        /// Use MSR bitmaps.
        const USE_MSR_BITMAPS          = 1 << 28;
        /// MONITOR exiting.
        const MONITOR_EXITING          = 1 << 29;
        /// PAUSE exiting.
        const PAUSE_EXITING            = 1 << 30;
        /// Activate secondary controls.
        const SECONDARY_CONTROLS       = 1 << 31;
    }

    /// Secondary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-7.
    pub struct SecondaryControls: u32 {
        /// Virtualize APIC accesses.
        const VIRTUALIZE_APIC          = 1 << 0;
        /// Enable EPT.
        const ENABLE_EPT               = 1 << 1;
        /// Descriptor-table exiting.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// Enable RDTSCP.
        const ENABLE_RDTSCP            = 1 << 3;
        /// Virtualize x2APIC mode.
        const VIRTUALIZE_X2APIC        = 1 << 4;
        /// Enable VPID.
        const ENABLE_VPID              = 1 << 5;
        /// WBINVD exiting.
        const WBINVD_EXITING           = 1 << 6;
        /// Unrestricted guest.
        const UNRESTRICTED_GUEST       = 1 << 7;
        /// Enable VM functions.
        const ENABLE_VM_FUNCTIONS      = 1 << 13;
        /// VMCS shadowing.
        const VMCS_SHADOWING           = 1 << 14;
        /// Enable XSAVES and XRSTORS.
        const ENABLE_XSAVES_XRSTORS    = 1 << 20;
    }

    /// VM-exit controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.7.
    pub struct ExitControls: u32 {
        /// Save debug controls.
        const SAVE_DEBUG_CONTROLS        = 1 << 2;
        /// Host address-space size.
        const HOST_ADDRESS_SPACE_SIZE    = 1 << 9;
        /// Load IA32_PERF_GLOBAL_CTRL.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        /// Acknowledge interrupt on exit.
        const ACK_INTERRUPT_ON_EXIT      = 1 << 15;
        /// Save IA32_PAT.
        const SAVE_IA32_PAT              = 1 << 18;
        /// Load IA32_PAT.
        const LOAD_IA32_PAT              = 1 << 19;
        /// Save IA32_EFER.
        const SAVE_IA32_EFER             = 1 << 20;
        /// Load IA32_EFER.
        const LOAD_IA32_EFER             = 1 << 21;
        /// Save VMX-preemption timer.
        const SAVE_VMX_PREEMPTION_TIMER  = 1 << 22;
    }

    /// VM-entry controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.8.
    pub struct EntryControls: u32 {
        /// Load debug controls.
        const LOAD_DEBUG_CONTROLS     = 1 << 2;
        /// IA-32e mode guest.
        const IA32E_MODE_GUEST        = 1 << 9;
        /// Entry to SMM.
        const ENTRY_TO_SMM            = 1 << 10;
        /// Deactivate dual-monitor treatment.
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        /// Load IA32_PAT.
        const LOAD_IA32_PAT           = 1 << 14;
        /// Load IA32_EFER.
        const LOAD_IA32_EFER          = 1 << 15;
    }

    /// Guest segment access rights, as stored in the VMCS.
    ///
    /// The type bits are generic over the descriptor class: for data
    /// segments A/W/E are accessed, writable, and expand-down; for code
    /// segments they are accessed, readable, and conforming.
    ///
    /// See Intel SDM, Volume 3C, Section 24.4.1.
    pub struct SegmentAccessRights: u32 {
        const TYPE_A   = 1 << 0;
        const TYPE_W   = 1 << 1;
        const TYPE_E   = 1 << 2;
        const TYPE_CODE = 1 << 3;
        /// Descriptor type (0 = system, 1 = code or data).
        const S        = 1 << 4;
        /// Segment present.
        const P        = 1 << 7;
        /// Available for use by system software.
        const AVL      = 1 << 12;
        /// 64-bit mode active (for CS only).
        const L        = 1 << 13;
        /// Default operation size.
        const DB       = 1 << 14;
        /// Granularity.
        const G        = 1 << 15;
        /// Segment unusable (not loaded).
        const UNUSABLE = 1 << 16;

        /// System-segment type of a busy 64-bit TSS.
        const TSS_BUSY = Self::TYPE_A.bits | Self::TYPE_W.bits | Self::TYPE_CODE.bits;
    }

    /// Flags of an EPT entry.
    ///
    /// The memory type bits are only meaningful in leaf entries.
    ///
    /// See Intel SDM, Volume 3C, Section 28.2.2.
    pub struct EptEntryFlags: u64 {
        /// Read access.
        const READ               = 1 << 0;
        /// Write access.
        const WRITE              = 1 << 1;
        /// Supervisor-mode instruction fetch.
        const SUPERVISOR_EXECUTE = 1 << 2;
        /// Write-back memory type (leaf entries, bits 5:3 = 6).
        const MEMORY_TYPE_WB     = 6 << 3;
        /// Maps a page rather than a table (for L2 and L3 entries).
        const PAGE               = 1 << 7;
        /// Accessed flag.
        const ACCESSED           = 1 << 8;
        /// Dirty flag.
        const DIRTY              = 1 << 9;
        /// User-mode instruction fetch.
        const USER_EXECUTE       = 1 << 10;
    }
}
