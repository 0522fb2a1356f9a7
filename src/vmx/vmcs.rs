//! VMCS construction and guest execution
//!
//! One [`VmcsPerCpu`] per logical processor holds the VMCS region, the MSR
//! bitmap and load/store areas, and the register save area shared with the
//! entry trampoline. [`GuestContext`] owns the per-CPU records of one guest
//! together with its physical address space and serial sink.
//!
//! Loading a VMCS installs it as the current VMCS of the logical processor;
//! an interrupt that switches to another VMCS in the middle of an access
//! silently corrupts state. Every access therefore goes through the
//! [`ActiveVmcs`] scope, which keeps interrupts disabled from VMPTRLD until
//! the scope ends, including the time spent inside the guest.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::instructions::interrupts;
use x86_64::instructions::tables::{sgdt, sidt};
use x86_64::registers::control::{Cr0, Cr0Flags, Cr3, Cr4, Cr4Flags};

use super::bitmaps::{
    EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
    SegmentAccessRights,
};
use super::errors::{HvError, HvResult, VmxInstructionError};
use super::exits;
use super::fields::traits::*;
use super::fields::{
    Ctrl16, Ctrl32, Ctrl64, GuestState32, GuestState64, GuestStateNat, HostState16, HostState32,
    HostState64, HostStateNat, Ro32,
};
use super::state::{self, VmxState};
use super::{
    cr_fixed_bits_invalid, curr_cpu_num, max_num_cpus, msr, percpu_exec, raw,
    GuestPhysicalAddressSpace, HostPhysAddr, HypervisorContext, MiscInfo, VmxBasicInfo, VmxPage,
    PAGE_SIZE, VMX_MEMORY_TYPE_WRITE_BACK,
};
use crate::fifo::SerialFifo;
use crate::memory::SharedFrameAllocator;
use crate::{gdt, interrupts as host_interrupts};

/// Sentinel for a guest CR3 or entry point that was not configured yet.
const UNSET: usize = usize::MAX;

/// Reserved bits of RFLAGS that read as one.
const RFLAGS_RESERVED_ONES: usize = 1 << 1;

/// Number of entries of the host MSR load-on-exit list.
const HOST_MSR_LIST_COUNT: u32 = 4;

/// Number of entries of the guest store-on-exit / load-on-entry list.
const GUEST_MSR_LIST_COUNT: u32 = 1;

// ————————————————————————————— Scoped VMCS Load ——————————————————————————— //

/// Scope during which a VMCS is the current VMCS of this processor.
///
/// Interrupts are disabled for the whole scope so that nothing can replace
/// the current VMCS; they are re-enabled when the scope is dropped.
pub struct ActiveVmcs<'a> {
    _page: &'a VmxPage,
}

impl<'a> ActiveVmcs<'a> {
    pub fn load(page: &'a VmxPage) -> HvResult<Self> {
        debug_assert!(interrupts::are_enabled());
        interrupts::disable();
        match unsafe { raw::vmptrld(page.phys().as_u64()) } {
            Ok(()) => Ok(ActiveVmcs { _page: page }),
            Err(err) => {
                interrupts::enable();
                Err(err)
            }
        }
    }
}

impl<'a> Drop for ActiveVmcs<'a> {
    fn drop(&mut self) {
        debug_assert!(!interrupts::are_enabled());
        interrupts::enable();
    }
}

// ————————————————————————— Control Field Protocol ————————————————————————— //

/// Computes the value of a VMCS control field.
///
/// The capability MSR reports `allowed_0` (must-be-one bits) in its low half
/// and `allowed_1` (may-be-one bits) in its high half. Every requested `set`
/// bit must be allowed to be one, every requested `clear` bit allowed to be
/// zero, and the two must not overlap.
fn compute_control(true_msr: u64, old_msr: u64, set: u32, clear: u32) -> HvResult<u32> {
    let allowed_0 = true_msr as u32;
    let allowed_1 = (true_msr >> 32) as u32;
    if (allowed_1 & set) != set {
        return Err(HvError::NotSupported);
    }
    if (!allowed_0 & clear) != clear {
        return Err(HvError::NotSupported);
    }
    if (set & clear) != 0 {
        return Err(HvError::InvalidArgs);
    }

    // Reference Volume 3, Section 31.5.1, Algorithm 3, Part C. If the
    // control can be either 0 or 1 (flexible), and the control is unknown,
    // then refer to the old MSR to find the default value.
    let flexible = allowed_0 ^ allowed_1;
    let unknown = flexible & !(set | clear);
    let defaults = unknown & old_msr as u32;
    Ok(allowed_0 | defaults | set)
}

/// Configures a control field of the current VMCS.
unsafe fn set_control(
    controls: Ctrl32,
    true_msr: u64,
    old_msr: u64,
    set: u32,
    clear: u32,
) -> HvResult {
    let value = compute_control(true_msr, old_msr, set, clear).map_err(|err| {
        log::debug!("can not configure vmcs controls {:?}", controls);
        err
    })?;
    controls.vmwrite(value)
}

// —————————————————————————————— EPT Pointer ——————————————————————————————— //

/// Encodes the EPT pointer for `pml4_address`.
fn ept_pointer(pml4_address: HostPhysAddr) -> u64 {
    debug_assert!(pml4_address.is_page_aligned());
    // Physical address of the PML4 page, page aligned.
    pml4_address.as_u64()
        // Use write back memory.
        | VMX_MEMORY_TYPE_WRITE_BACK
        // Page walk length of 4 (defined as N minus 1).
        | (3 << 3)
        // Accessed and dirty flags are enabled.
        | (1 << 6)
}

// ——————————————————————————————— MSR Areas ———————————————————————————————— //

/// An entry of an MSR load/store area, as laid out by the hardware.
///
/// See Volume 3, Section 24.7.2.
#[repr(C)]
#[derive(Clone, Copy)]
struct MsrListEntry {
    msr: u32,
    _reserved: u32,
    value: u64,
}

const _: () = assert!(core::mem::size_of::<MsrListEntry>() == 16);

/// Conservative bound on load/store list entries. The recommended maximum is
/// reported by the MISC capability MSR in units of 512 entries, but Section
/// 24.7.2 also recommends at most 512 bytes per list; take the minimum.
const MSR_LIST_MAX: usize = 512 / core::mem::size_of::<MsrListEntry>();

fn edit_msr_list(msr_list_page: &mut VmxPage, index: usize, msr: u32, value: u64) {
    assert!(index < MSR_LIST_MAX);
    // SAFETY: the page exclusively owns its frame and the index is in
    // bounds.
    let entry = unsafe { &mut *(msr_list_page.kva() as *mut MsrListEntry).add(index) };
    *entry = MsrListEntry {
        msr,
        _reserved: 0,
        value,
    };
}

/// Clears the read and write intercept bits for `msr`, so that guest
/// accesses pass through.
///
/// From Volume 3, Section 24.6.9: the read bitmaps occupy the low 2 KiB of
/// the page (low MSRs at offset 0, high MSRs at 1 KiB), the write bitmaps
/// the high 2 KiB.
fn ignore_msr(msr_bitmaps: &mut [u8], msr: u32) {
    let base = if msr >= 0xC000_0000 { 1 << 10 } else { 0 };
    let msr_low = (msr & 0x1FFF) as usize;
    let msr_byte = msr_low / 8;
    let msr_bit = msr_low % 8;

    // Ignore reads to the MSR.
    msr_bitmaps[base + msr_byte] &= !(1 << msr_bit);

    // Ignore writes to the MSR.
    msr_bitmaps[base + (2 << 10) + msr_byte] &= !(1 << msr_bit);
}

fn read_cr3_raw() -> u64 {
    let (frame, flags) = Cr3::read_raw();
    frame.start_address().as_u64() | flags as u64
}

// ————————————————————————————— Per-CPU VMCS ——————————————————————————————— //

/// Per-CPU VMCS state of one guest.
struct VmcsPerCpu {
    page: VmxPage,
    msr_bitmaps_page: VmxPage,
    host_msr_page: VmxPage,
    guest_msr_page: VmxPage,
    /// Register save area; boxed so its address stays stable, `HOST_RSP`
    /// points at it.
    vmx_state: Box<VmxState>,
    /// False until the first successful entry, VMLAUNCH versus VMRESUME.
    do_resume: bool,
}

impl VmcsPerCpu {
    fn init(allocator: &SharedFrameAllocator, vmx_info: &VmxBasicInfo) -> HvResult<Self> {
        let mut page = VmxPage::alloc(allocator, vmx_info, 0)?;
        page.set_revision_id(vmx_info.revision_id);
        // Start out intercepting every MSR.
        let msr_bitmaps_page = VmxPage::alloc(allocator, vmx_info, 0xFF)?;
        let host_msr_page = VmxPage::alloc(allocator, vmx_info, 0)?;
        let guest_msr_page = VmxPage::alloc(allocator, vmx_info, 0)?;
        Ok(VmcsPerCpu {
            page,
            msr_bitmaps_page,
            host_msr_page,
            guest_msr_page,
            vmx_state: Box::new(VmxState::default()),
            do_resume: false,
        })
    }

    /// Releases the hardware binding of the VMCS region.
    fn clear(&mut self) -> HvResult {
        unsafe { raw::vmclear(self.page.phys().as_u64()) }
    }

    /// Builds the VMCS. Must run pinned to the CPU that owns this record.
    fn setup(&mut self, pml4_address: HostPhysAddr, cpu_num: usize) -> HvResult {
        self.clear()?;

        let _vmcs = ActiveVmcs::load(&self.page)?;

        unsafe {
            // Setup secondary processor-based VMCS controls.
            set_control(
                Ctrl32::SecondaryProcBasedExecCtrls,
                msr::VMX_PROCBASED_CTLS2.read(),
                0,
                (
                    // Enable use of extended page tables.
                    SecondaryControls::ENABLE_EPT
                    // Enable use of RDTSCP instruction.
                    | SecondaryControls::ENABLE_RDTSCP
                    // Associate cached translations of linear addresses
                    // with a virtual processor ID.
                    | SecondaryControls::ENABLE_VPID
                    // Enable use of XSAVES and XRSTORS instructions.
                    | SecondaryControls::ENABLE_XSAVES_XRSTORS
                )
                    .bits(),
                0,
            )?;

            // Setup pin-based VMCS controls.
            set_control(
                Ctrl32::PinBasedExecCtrls,
                msr::VMX_TRUE_PINBASED_CTLS.read(),
                msr::VMX_PINBASED_CTLS.read(),
                (
                    // External interrupts cause a VM exit.
                    PinbasedControls::EXTERNAL_INTERRUPT_EXITING
                    // Non-maskable interrupts cause a VM exit.
                    | PinbasedControls::NMI_EXITING
                )
                    .bits(),
                0,
            )?;

            // Setup primary processor-based VMCS controls.
            set_control(
                Ctrl32::PrimaryProcBasedExecCtrls,
                msr::VMX_TRUE_PROCBASED_CTLS.read(),
                msr::VMX_PROCBASED_CTLS.read(),
                (
                    // Enable VM exit on IO instructions.
                    PrimaryControls::UNCOND_IO_EXITING
                    // Enable use of MSR bitmaps.
                    | PrimaryControls::USE_MSR_BITMAPS
                    // Enable secondary processor-based controls.
                    | PrimaryControls::SECONDARY_CONTROLS
                )
                    .bits(),
                (
                    // Disable VM exit on CR3 load.
                    PrimaryControls::CR3_LOAD_EXITING
                    // Disable VM exit on CR3 store.
                    | PrimaryControls::CR3_STORE_EXITING
                )
                    .bits(),
            )?;

            // Setup VM-exit VMCS controls.
            set_control(
                Ctrl32::VmExitCtrls,
                msr::VMX_TRUE_EXIT_CTLS.read(),
                msr::VMX_EXIT_CTLS.read(),
                (
                    // Logical processor is in 64-bit mode after VM exit.
                    ExitControls::HOST_ADDRESS_SPACE_SIZE
                    // Save the guest IA32_PAT MSR on exit.
                    | ExitControls::SAVE_IA32_PAT
                    // Load the host IA32_PAT MSR on exit.
                    | ExitControls::LOAD_IA32_PAT
                    // Save the guest IA32_EFER MSR on exit.
                    | ExitControls::SAVE_IA32_EFER
                    // Load the host IA32_EFER MSR on exit.
                    | ExitControls::LOAD_IA32_EFER
                )
                    .bits(),
                0,
            )?;

            // Setup VM-entry VMCS controls.
            set_control(
                Ctrl32::VmEntryCtrls,
                msr::VMX_TRUE_ENTRY_CTLS.read(),
                msr::VMX_ENTRY_CTLS.read(),
                (
                    // After VM entry, logical processor is in IA-32e mode.
                    EntryControls::IA32E_MODE_GUEST
                    // Load the guest IA32_PAT MSR on entry.
                    | EntryControls::LOAD_IA32_PAT
                    // Load the guest IA32_EFER MSR on entry.
                    | EntryControls::LOAD_IA32_EFER
                )
                    .bits(),
                0,
            )?;

            // From Volume 3, Section 24.6.3: a set bit means the exception
            // causes a VM exit. From Volume 3, Section 25.2: with bit 14 set
            // and mask and match both zero, every page fault exits.
            Ctrl32::ExceptionBitmap.vmwrite(!0)?;
            Ctrl32::PageFaultErrCodeMask.vmwrite(0)?;
            Ctrl32::PageFaultErrCodeMatch.vmwrite(0)?;

            // From Volume 3, Section 26.2.1.1: with "enable VPID" set the
            // VPID field must not be 0000H. EPT already keeps translations
            // apart per guest, so per-CPU tags are enough.
            Ctrl16::Vpid.vmwrite(cpu_num as u16 + 1)?;

            Ctrl64::EptPtr.vmwrite(ept_pointer(pml4_address))?;

            // Setup MSR handling: everything exits except the GS bases,
            // which the hardware cannot swap for us any other way.
            ignore_msr(self.msr_bitmaps_page.as_bytes_mut(), msr::MSR_IA32_GS_BASE);
            ignore_msr(
                self.msr_bitmaps_page.as_bytes_mut(),
                msr::MSR_IA32_KERNEL_GS_BASE,
            );
            Ctrl64::MsrBitmaps.vmwrite(self.msr_bitmaps_page.phys().as_u64())?;

            let misc_info = MiscInfo::read();
            if HOST_MSR_LIST_COUNT > misc_info.msr_list_limit
                || HOST_MSR_LIST_COUNT as usize > MSR_LIST_MAX
            {
                return Err(HvError::NotSupported);
            }

            edit_msr_list(
                &mut self.host_msr_page,
                0,
                msr::MSR_IA32_STAR,
                msr::IA32_STAR.read(),
            );
            edit_msr_list(
                &mut self.host_msr_page,
                1,
                msr::MSR_IA32_LSTAR,
                msr::IA32_LSTAR.read(),
            );
            edit_msr_list(
                &mut self.host_msr_page,
                2,
                msr::MSR_IA32_FMASK,
                msr::IA32_FMASK.read(),
            );
            // Index 3, IA32_KERNEL_GS_BASE, is refreshed on every entry.
            Ctrl64::VmExitMsrLoadAddr.vmwrite(self.host_msr_page.phys().as_u64())?;
            Ctrl32::VmExitMsrLoadCount.vmwrite(HOST_MSR_LIST_COUNT)?;

            edit_msr_list(&mut self.guest_msr_page, 0, msr::MSR_IA32_KERNEL_GS_BASE, 0);
            Ctrl64::VmExitMsrStoreAddr.vmwrite(self.guest_msr_page.phys().as_u64())?;
            Ctrl32::VmExitMsrStoreCount.vmwrite(GUEST_MSR_LIST_COUNT)?;
            Ctrl64::VmEntryMsrLoadAddr.vmwrite(self.guest_msr_page.phys().as_u64())?;
            Ctrl32::VmEntryMsrLoadCount.vmwrite(GUEST_MSR_LIST_COUNT)?;

            setup_host_state(&self.vmx_state)?;
            setup_guest_state()?;
        }

        Ok(())
    }

    /// Enters the guest and handles exactly one VM exit.
    ///
    /// Must run pinned to the CPU that owns this record.
    fn enter(&mut self, cr3: usize, entry: usize, serial_fifo: &SerialFifo) -> HvResult {
        let _vmcs = ActiveVmcs::load(&self.page)?;

        unsafe {
            // FS is used for thread-local storage, save for this thread.
            HostStateNat::FsBase.vmwrite(msr::IA32_FS_BASE.read() as usize)?;
            // CR3 is used to maintain the virtual address space.
            HostStateNat::Cr3.vmwrite(read_cr3_raw() as usize)?;
            // Kernel GS stores the user-space GS within the kernel; the
            // calling thread may change between entries, refresh every time.
            edit_msr_list(
                &mut self.host_msr_page,
                3,
                msr::MSR_IA32_KERNEL_GS_BASE,
                msr::IA32_KERNEL_GS_BASE.read(),
            );

            if !self.do_resume {
                GuestStateNat::Cr3.vmwrite(cr3)?;
                GuestStateNat::Rip.vmwrite(entry)?;
            } else {
                log::trace!("re-entering guest");
            }

            match state::vmx_enter(&mut self.vmx_state, self.do_resume) {
                Err(err) => {
                    let error = Ro32::VmInstructionError.vmread();
                    log::error!(
                        "vmlaunch failed: {:?}",
                        VmxInstructionError::from_u64(error as u64)
                    );
                    Err(err)
                }
                Ok(()) => {
                    // The exit truncated the TR and IDT limits.
                    gdt::reload_tss();
                    host_interrupts::reload_idt();
                    self.do_resume = true;
                    exits::handle_vmexit(&mut self.vmx_state.guest_state, serial_fifo)
                }
            }
        }
    }
}

/// Writes the host-state area of the current VMCS, with `HOST_RSP` pointing
/// at the given register save area.
///
/// NOTE: we are pinned to a CPU when executing this function, therefore it
/// is acceptable to use per-CPU state.
unsafe fn setup_host_state(vmx_state: &VmxState) -> HvResult {
    HostState64::Ia32Pat.vmwrite(msr::IA32_PAT.read())?;
    HostState64::Ia32Efer.vmwrite(msr::IA32_EFER.read())?;
    HostStateNat::Cr0.vmwrite(Cr0::read_raw() as usize)?;
    HostStateNat::Cr4.vmwrite(Cr4::read_raw() as usize)?;

    let selectors = gdt::selectors();
    HostState16::EsSelector.vmwrite(0)?;
    HostState16::CsSelector.vmwrite(selectors.code.0)?;
    HostState16::SsSelector.vmwrite(selectors.data.0)?;
    HostState16::DsSelector.vmwrite(0)?;
    HostState16::FsSelector.vmwrite(0)?;
    HostState16::GsSelector.vmwrite(0)?;
    HostState16::TrSelector.vmwrite(selectors.tss.0)?;

    HostStateNat::FsBase.vmwrite(msr::IA32_FS_BASE.read() as usize)?;
    HostStateNat::GsBase.vmwrite(msr::IA32_GS_BASE.read() as usize)?;
    HostStateNat::TrBase.vmwrite(gdt::tss_base() as usize)?;
    HostStateNat::GdtrBase.vmwrite(sgdt().base.as_u64() as usize)?;
    HostStateNat::IdtrBase.vmwrite(sidt().base.as_u64() as usize)?;

    HostStateNat::Ia32SysenterEsp.vmwrite(0)?;
    HostStateNat::Ia32SysenterEip.vmwrite(0)?;
    HostState32::Ia32SysenterCs.vmwrite(0)?;

    // On VM exit the hardware loads RSP with the register save area and
    // jumps into the exit trampoline.
    HostStateNat::Rsp.vmwrite(vmx_state as *const VmxState as usize)?;
    HostStateNat::Rip.vmwrite(state::vmx_exit_entry as *const () as usize)
}

/// Writes the initial guest-state area: a 64-bit guest with paging enabled,
/// flat segments, and everything else parked.
unsafe fn setup_guest_state() -> HvResult {
    let cr0 =
        (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING | Cr0Flags::NUMERIC_ERROR).bits();
    if cr_is_invalid(cr0, msr::VMX_CR0_FIXED0, msr::VMX_CR0_FIXED1) {
        return Err(HvError::BadState);
    }
    GuestStateNat::Cr0.vmwrite(cr0 as usize)?;

    let cr4 =
        (Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS).bits();
    if cr_is_invalid(cr4, msr::VMX_CR4_FIXED0, msr::VMX_CR4_FIXED1) {
        return Err(HvError::BadState);
    }
    GuestStateNat::Cr4.vmwrite(cr4 as usize)?;

    GuestState64::Ia32Pat.vmwrite(msr::IA32_PAT.read())?;
    GuestState64::Ia32Efer.vmwrite(msr::IA32_EFER.read())?;

    // A 64-bit code segment: accessed, readable, conforming.
    GuestState32::CsAccessRights.vmwrite(
        (SegmentAccessRights::TYPE_A
            | SegmentAccessRights::TYPE_W
            | SegmentAccessRights::TYPE_E
            | SegmentAccessRights::TYPE_CODE
            | SegmentAccessRights::S
            | SegmentAccessRights::P
            | SegmentAccessRights::L)
            .bits(),
    )?;

    GuestState32::TrAccessRights
        .vmwrite((SegmentAccessRights::TSS_BUSY | SegmentAccessRights::P).bits())?;

    // Disable all other segment selectors until we have a guest that uses
    // them.
    let unusable = SegmentAccessRights::UNUSABLE.bits();
    GuestState32::SsAccessRights.vmwrite(unusable)?;
    GuestState32::DsAccessRights.vmwrite(unusable)?;
    GuestState32::EsAccessRights.vmwrite(unusable)?;
    GuestState32::FsAccessRights.vmwrite(unusable)?;
    GuestState32::GsAccessRights.vmwrite(unusable)?;
    GuestState32::LdtrAccessRights.vmwrite(unusable)?;

    GuestStateNat::GdtrBase.vmwrite(0)?;
    GuestState32::GdtrLimit.vmwrite(0)?;
    GuestStateNat::IdtrBase.vmwrite(0)?;
    GuestState32::IdtrLimit.vmwrite(0)?;

    // Set all reserved RFLAGS bits to their correct values.
    GuestStateNat::Rflags.vmwrite(RFLAGS_RESERVED_ONES)?;

    GuestState32::ActivityState.vmwrite(0)?;
    GuestState32::InterruptibilityState.vmwrite(0)?;
    GuestStateNat::PendingDebugExceptions.vmwrite(0)?;

    // From Volume 3, Section 26.3.1.1: the IA32_SYSENTER_ESP and
    // IA32_SYSENTER_EIP fields must each contain a canonical address.
    GuestStateNat::Ia32SysenterEsp.vmwrite(0)?;
    GuestStateNat::Ia32SysenterEip.vmwrite(0)?;
    GuestState32::Ia32SysenterCs.vmwrite(0)?;
    GuestStateNat::Rsp.vmwrite(0)?;

    // From Volume 3, Section 24.4.2: without VMCS shadowing this field must
    // be all-ones to avoid VM-entry failures.
    GuestState64::VmcsLinkPtr.vmwrite(u64::MAX)
}

fn cr_is_invalid(cr_value: u64, fixed0_msr: msr::Msr, fixed1_msr: msr::Msr) -> bool {
    let fixed0 = unsafe { fixed0_msr.read() };
    let fixed1 = unsafe { fixed1_msr.read() };
    cr_fixed_bits_invalid(cr_value, fixed0, fixed1)
}

// ————————————————————————————— Guest Context —————————————————————————————— //

/// Bounds check of the guest CR3: the top page of guest memory cannot hold
/// page tables.
fn check_cr3(cr3: usize, memory_size: usize) -> HvResult {
    if cr3 >= memory_size - PAGE_SIZE {
        return Err(HvError::InvalidArgs);
    }
    Ok(())
}

/// Bounds check of the guest entry point.
fn check_entry(entry: usize, memory_size: usize) -> HvResult {
    if entry >= memory_size {
        return Err(HvError::InvalidArgs);
    }
    Ok(())
}

/// The VMCS context of one guest: per-CPU VMCS records, the guest physical
/// address space, and the serial sink.
///
/// Borrows the hypervisor context, the host stays in VMX root operation for
/// the whole guest lifetime.
pub struct GuestContext<'hv> {
    _hypervisor: &'hv HypervisorContext,
    gpas: GuestPhysicalAddressSpace,
    serial_fifo: Arc<SerialFifo>,
    per_cpus: Vec<VmcsPerCpu>,
    cr3: usize,
    entry: usize,
}

impl<'hv> GuestContext<'hv> {
    pub(crate) fn new(
        hypervisor: &'hv HypervisorContext,
        gpas: GuestPhysicalAddressSpace,
        serial_fifo: Arc<SerialFifo>,
    ) -> HvResult<Self> {
        let allocator = hypervisor.allocator();
        let vmx_info = VmxBasicInfo::read();
        let mut per_cpus = Vec::new();
        for _ in 0..max_num_cpus() {
            per_cpus.push(VmcsPerCpu::init(allocator, &vmx_info)?);
        }

        let mut context = GuestContext {
            _hypervisor: hypervisor,
            gpas,
            serial_fifo,
            per_cpus,
            cr3: UNSET,
            entry: UNSET,
        };
        let pml4_address = context.gpas.pml4_address();
        for cpu_num in 0..context.per_cpus.len() {
            let per_cpu = &mut context.per_cpus[cpu_num];
            percpu_exec(cpu_num, || per_cpu.setup(pml4_address, cpu_num))?;
        }
        Ok(context)
    }

    /// Sets the guest CR3 for the first entry. Last write wins.
    pub fn set_cr3(&mut self, guest_cr3: usize) -> HvResult {
        check_cr3(guest_cr3, self.gpas.size())?;
        self.cr3 = guest_cr3;
        Ok(())
    }

    /// Sets the guest entry point for the first entry. Last write wins.
    pub fn set_entry(&mut self, guest_entry: usize) -> HvResult {
        check_entry(guest_entry, self.gpas.size())?;
        self.entry = guest_entry;
        Ok(())
    }

    /// Runs the guest until the next VM exit and dispatches it.
    ///
    /// The caller decides whether to keep looping; any error is terminal
    /// for this guest.
    pub fn enter(&mut self) -> HvResult {
        if self.cr3 == UNSET || self.entry == UNSET {
            return Err(HvError::BadState);
        }
        let cpu_num = curr_cpu_num();
        let (cr3, entry) = (self.cr3, self.entry);
        let serial_fifo = &self.serial_fifo;
        let per_cpu = &mut self.per_cpus[cpu_num];
        percpu_exec(cpu_num, || per_cpu.enter(cr3, entry, serial_fifo))
    }
}

impl<'hv> Drop for GuestContext<'hv> {
    fn drop(&mut self) {
        // Release the hardware binding before the region pages are freed.
        for cpu_num in 0..self.per_cpus.len() {
            let per_cpu = &mut self.per_cpus[cpu_num];
            let status = percpu_exec(cpu_num, || per_cpu.clear());
            debug_assert_eq!(status, Ok(()));
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn control_computation() {
        // allowed_0 (must be one) = 0b0001, allowed_1 (may be one) = 0b0111.
        let true_msr = 0b0001 | (0b0111 << 32);

        // Setting an allowed bit keeps required bits.
        assert_eq!(compute_control(true_msr, 0, 0b0010, 0), Ok(0b0011));

        // Flexible bits default to the old MSR value.
        assert_eq!(compute_control(true_msr, 0b0100, 0, 0), Ok(0b0101));

        // The default is overridden by an explicit clear.
        assert_eq!(compute_control(true_msr, 0b0100, 0, 0b0100), Ok(0b0001));

        // Setting a bit that may not be one is a capability error.
        assert_eq!(
            compute_control(true_msr, 0, 0b1000, 0),
            Err(HvError::NotSupported)
        );

        // Clearing a bit that must be one is a capability error.
        assert_eq!(
            compute_control(true_msr, 0, 0, 0b0001),
            Err(HvError::NotSupported)
        );

        // Overlapping set and clear is a usage error.
        assert_eq!(
            compute_control(true_msr, 0, 0b0010, 0b0010),
            Err(HvError::InvalidArgs)
        );
    }

    #[test_case]
    fn ept_pointer_encoding() {
        let eptp = ept_pointer(HostPhysAddr::new(0xABC000));
        // Bits 2:0 = 6 (write-back).
        assert_eq!(eptp & 0b111, 6);
        // Bits 5:3 = 3 (page-walk length 4, minus one).
        assert_eq!((eptp >> 3) & 0b111, 3);
        // Bit 6 = 1 (accessed/dirty enabled).
        assert_eq!((eptp >> 6) & 1, 1);
        // The PML4 address is preserved.
        assert_eq!(eptp & 0x000F_FFFF_FFFF_F000, 0xABC000);
    }

    #[test_case]
    fn msr_bitmap_clearing() {
        let mut bitmap = [0xFFu8; 4096];

        // A high MSR lands in the 1 KiB-offset read range and the matching
        // write range 2 KiB above.
        ignore_msr(&mut bitmap, super::msr::MSR_IA32_KERNEL_GS_BASE);
        let low = (super::msr::MSR_IA32_KERNEL_GS_BASE & 0x1FFF) as usize;
        let byte = (1 << 10) + low / 8;
        let bit = 1u8 << (low % 8);
        assert_eq!(bitmap[byte] & bit, 0);
        assert_eq!(bitmap[byte + (2 << 10)] & bit, 0);

        // A low MSR lands at offset zero.
        ignore_msr(&mut bitmap, 0x277);
        assert_eq!(bitmap[0x277 / 8] & (1 << (0x277 % 8)), 0);
        assert_eq!(bitmap[(2 << 10) + 0x277 / 8] & (1 << (0x277 % 8)), 0);

        // Every other bit is still set.
        let cleared: usize = bitmap.iter().map(|b| b.count_zeros() as usize).sum();
        assert_eq!(cleared, 4);
    }

    #[test_case]
    fn guest_configuration_bounds() {
        let size = 16 * 1024 * 1024;
        assert_eq!(check_cr3(0x1000, size), Ok(()));
        assert_eq!(check_cr3(size - PAGE_SIZE, size), Err(HvError::InvalidArgs));
        assert_eq!(check_cr3(size, size), Err(HvError::InvalidArgs));
        assert_eq!(check_entry(size - 1, size), Ok(()));
        assert_eq!(check_entry(size, size), Err(HvError::InvalidArgs));
    }
}
