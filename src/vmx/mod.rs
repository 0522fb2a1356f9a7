//! VMX hypervisor core
//!
//! Turns the host logical processor into VMX root operation, builds and
//! maintains one guest VMCS per CPU, and drives guest entries and exits.
//!
//! The entry points are [`hypervisor_create`] (VMXON on the CPU set) and
//! [`guest_create`] (VMCS construction for one guest); the returned
//! [`GuestContext`] is programmed with a guest CR3 and entry point, then
//! [`GuestContext::enter`] runs the guest until the next VM exit.

pub mod bitmaps;
pub mod ept;
pub mod errors;
pub mod exits;
pub mod fields;
pub mod msr;
pub mod raw;
pub mod state;
pub mod vmcs;

use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};

use crate::fifo::SerialFifo;
use crate::memory::SharedFrameAllocator;
pub use ept::GuestPhysicalAddressSpace;
pub use errors::{ExitReason, HvError, HvResult, VmxInstructionError};
pub use vmcs::GuestContext;

pub const PAGE_SIZE: usize = 0x1000;

/// Memory type encoding for write-back, used by the VMX capability MSR and
/// the EPT pointer.
pub(crate) const VMX_MEMORY_TYPE_WRITE_BACK: u64 = 6;

/// CPUID mask for VMX support.
const CPUID_ECX_VMX_MASK: u32 = 1 << 5;

// ————————————————————————————— Address Types —————————————————————————————— //

/// A host physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostPhysAddr(usize);

impl HostPhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

/// A guest physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuestPhysAddr(usize);

impl GuestPhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn l4_index(self) -> usize {
        (self.0 >> 39) & 0x1FF
    }

    pub fn l3_index(self) -> usize {
        (self.0 >> 30) & 0x1FF
    }

    pub fn l2_index(self) -> usize {
        (self.0 >> 21) & 0x1FF
    }

    pub fn l1_index(self) -> usize {
        (self.0 >> 12) & 0x1FF
    }
}

/// A page frame of host physical memory, with its kernel mapping.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub phys_addr: HostPhysAddr,
    pub virt_addr: *mut u8,
}

// ———————————————————————————— Bitfield Helpers ———————————————————————————— //

/// Extracts bits `high:low` (inclusive) of `value`.
fn bits(value: u64, high: u32, low: u32) -> u64 {
    (value >> low) & ((1 << (high - low + 1)) - 1)
}

/// Extracts bit `n` of `value`.
fn bit(value: u64, n: u32) -> bool {
    value & (1 << n) != 0
}

// ————————————————————————————— Capability Probe ——————————————————————————— //

/// Basic VMX information.
///
/// See Intel SDM, Volume 3D, Appendix A.1.
#[derive(Debug, Clone)]
pub struct VmxBasicInfo {
    /// The 31-bit VMCS revision identifier used by the CPU.
    pub revision_id: u32,
    /// Required size in bytes of the VMXON and VMCS regions.
    pub region_size: u16,
    /// Write-back is the required memory type for VMX regions.
    pub write_back: bool,
    /// Instruction information is reported on I/O exits.
    pub io_exit_info: bool,
    /// The TRUE capability MSRs for the VMX controls exist.
    pub vmx_controls: bool,
}

impl VmxBasicInfo {
    /// Reads the capability MSR of the current CPU.
    pub fn read() -> Self {
        Self::from_raw(unsafe { msr::VMX_BASIC.read() })
    }

    fn from_raw(basic_info: u64) -> Self {
        Self {
            revision_id: bits(basic_info, 30, 0) as u32,
            region_size: bits(basic_info, 44, 32) as u16,
            write_back: bits(basic_info, 53, 50) == VMX_MEMORY_TYPE_WRITE_BACK,
            io_exit_info: bit(basic_info, 54),
            vmx_controls: bit(basic_info, 55),
        }
    }
}

/// Miscellaneous VMX information.
///
/// See Intel SDM, Volume 3D, Appendix A.6.
#[derive(Debug, Clone)]
pub struct MiscInfo {
    /// Wait-for-SIPI is a supported activity state.
    pub wait_for_sipi: bool,
    /// Recommended maximum number of entries in an MSR load/store list.
    pub msr_list_limit: u32,
}

impl MiscInfo {
    pub fn read() -> Self {
        Self::from_raw(unsafe { msr::VMX_MISC.read() })
    }

    fn from_raw(misc_info: u64) -> Self {
        Self {
            wait_for_sipi: bit(misc_info, 8),
            msr_list_limit: (bits(misc_info, 27, 25) as u32 + 1) * 512,
        }
    }
}

/// EPT and VPID capability information.
///
/// See Intel SDM, Volume 3D, Appendix A.10.
#[derive(Debug, Clone)]
pub struct EptInfo {
    /// A page-walk length of 4 is supported.
    pub page_walk_4: bool,
    /// Write-back is a supported EPT memory type.
    pub write_back: bool,
    /// 2 MiB pages are supported in PDEs.
    pub pde_2mb_page: bool,
    /// 1 GiB pages are supported in PDPTEs.
    pub pdpe_1gb_page: bool,
    /// Accessed and dirty flags are supported.
    pub ept_flags: bool,
    /// Advanced exit information is reported for EPT violations.
    pub exit_info: bool,
    /// INVEPT with both single- and all-context types is supported.
    pub invept: bool,
}

impl EptInfo {
    pub fn read() -> Self {
        Self::from_raw(unsafe { msr::VMX_EPT_VPID_CAP.read() })
    }

    fn from_raw(ept_info: u64) -> Self {
        Self {
            page_walk_4: bit(ept_info, 6),
            write_back: bit(ept_info, 14),
            pde_2mb_page: bit(ept_info, 16),
            pdpe_1gb_page: bit(ept_info, 17),
            ept_flags: bit(ept_info, 21),
            exit_info: bit(ept_info, 22),
            invept: bit(ept_info, 20) && bit(ept_info, 25) && bit(ept_info, 26),
        }
    }
}

// ———————————————————————————————— VMX Page ———————————————————————————————— //

/// A page of physical memory used as a VMXON region, VMCS region, MSR
/// bitmap, or MSR load/store area.
///
/// The page exclusively owns its frame; dropping the page returns the frame
/// to the allocator. The hardware binding (VMXOFF, VMCLEAR) must be released
/// by the owner before the drop.
pub struct VmxPage {
    frame: Frame,
    allocator: SharedFrameAllocator,
}

impl VmxPage {
    /// Allocates a page and fills it with `fill`.
    pub fn alloc(
        allocator: &SharedFrameAllocator,
        vmx_info: &VmxBasicInfo,
        fill: u8,
    ) -> HvResult<Self> {
        // From Volume 3, Appendix A.1: the region size is greater than 0 and
        // at most 4096.
        if vmx_info.region_size as usize > PAGE_SIZE {
            return Err(HvError::NotSupported);
        }

        // Check that write-back memory for VMX regions is supported.
        if !vmx_info.write_back {
            return Err(HvError::NotSupported);
        }

        let frame = allocator.allocate_frame().ok_or(HvError::NoMemory)?;
        debug_assert!(frame.phys_addr.is_page_aligned());
        unsafe {
            core::ptr::write_bytes(frame.virt_addr, fill, PAGE_SIZE);
        }
        Ok(VmxPage {
            frame,
            allocator: allocator.clone(),
        })
    }

    /// Writes the VMX revision identifier into the first four bytes, as
    /// required for VMXON and VMCS regions before first use.
    pub fn set_revision_id(&mut self, revision_id: u32) {
        self.as_bytes_mut()[0..4].copy_from_slice(&revision_id.to_le_bytes());
    }

    pub fn phys(&self) -> HostPhysAddr {
        self.frame.phys_addr
    }

    pub fn kva(&self) -> *mut u8 {
        self.frame.virt_addr
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the page exclusively owns its frame.
        unsafe { core::slice::from_raw_parts_mut(self.frame.virt_addr, PAGE_SIZE) }
    }
}

impl Drop for VmxPage {
    fn drop(&mut self) {
        // SAFETY: the page owned the frame exclusively.
        unsafe { self.allocator.deallocate_frame(self.frame) };
    }
}

// —————————————————————————————— CPU Topology —————————————————————————————— //

/// Number of logical processors managed by the hypervisor.
//  TODO: take the CPU count from the boot info once bring-up fans out to
//  every CPU; a multi-CPU bring-up must also undo already-enabled CPUs when
//  a later one fails.
pub(crate) fn max_num_cpus() -> usize {
    1
}

/// Number of the current logical processor.
pub(crate) fn curr_cpu_num() -> usize {
    0
}

/// Runs `f` pinned to the given CPU and returns its result.
///
/// The driver equivalent creates a high-priority worker pinned to the
/// target CPU, resumes it, and joins. This kernel runs on the boot processor
/// only, so after checking the target the call executes inline.
pub(crate) fn percpu_exec<T>(cpu_num: usize, f: impl FnOnce() -> HvResult<T>) -> HvResult<T> {
    if cpu_num != curr_cpu_num() {
        return Err(HvError::NotSupported);
    }
    f()
}

// —————————————————————— Control Register Validation ——————————————————————— //

/// Returns true if `cr_value` violates the FIXED0/FIXED1 constraints: a bit
/// must be 1 wherever FIXED0 has a 1, and 0 wherever FIXED1 has a 0.
pub(crate) fn cr_fixed_bits_invalid(cr_value: u64, fixed0: u64, fixed1: u64) -> bool {
    !(cr_value | !fixed0) != 0 || !(!cr_value | fixed1) != 0
}

fn cr_is_invalid(cr_value: u64, fixed0_msr: msr::Msr, fixed1_msr: msr::Msr) -> bool {
    let fixed0 = unsafe { fixed0_msr.read() };
    let fixed1 = unsafe { fixed1_msr.read() };
    cr_fixed_bits_invalid(cr_value, fixed0, fixed1)
}

// ————————————————————————————— VMXON Context —————————————————————————————— //

/// Per-CPU VMXON state: the VMXON region and whether VMXON succeeded.
struct VmxonPerCpu {
    page: VmxPage,
    is_on: bool,
}

impl VmxonPerCpu {
    fn init(allocator: &SharedFrameAllocator, vmx_info: &VmxBasicInfo) -> HvResult<Self> {
        let mut page = VmxPage::alloc(allocator, vmx_info, 0)?;
        page.set_revision_id(vmx_info.revision_id);
        Ok(VmxonPerCpu {
            page,
            is_on: false,
        })
    }

    /// Brings the current CPU into VMX root operation.
    ///
    /// Must run pinned to the CPU that owns this record. Every failure
    /// leaves the CPU in a clean state.
    fn enable(&mut self) -> HvResult {
        // Check that we have instruction information when we VM exit on IO,
        // and that the full (TRUE) VMX controls are reported.
        let vmx_info = VmxBasicInfo::read();
        if !vmx_info.io_exit_info || !vmx_info.vmx_controls {
            return Err(HvError::NotSupported);
        }

        // The VMCS layout relies on a page-walk length of 4, write-back EPT
        // memory, accessed/dirty flags, and the INVEPT instruction.
        let ept_info = EptInfo::read();
        if !ept_info.page_walk_4 || !ept_info.write_back || !ept_info.ept_flags || !ept_info.invept
        {
            return Err(HvError::NotSupported);
        }

        // Check that wait-for-SIPI is a supported activity state.
        let misc_info = MiscInfo::read();
        if !misc_info.wait_for_sipi {
            return Err(HvError::NotSupported);
        }

        // Enable VMXON through the feature control MSR, if required.
        let feature_control = unsafe { msr::FEATURE_CONTROL.read() };
        if feature_control & msr::FEATURE_CONTROL_LOCK == 0
            || feature_control & msr::FEATURE_CONTROL_VMXON == 0
        {
            if feature_control & msr::FEATURE_CONTROL_LOCK != 0 {
                // The MSR is locked with VMXON disabled: the firmware
                // forbids VMX and the lock persists until reset.
                return Err(HvError::NotSupported);
            }
            let mut feature_control_msr = msr::FEATURE_CONTROL;
            unsafe {
                feature_control_msr.write(
                    feature_control | msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMXON,
                );
            }
        }

        // Check control registers are in a VMX-friendly state.
        let cr0 = Cr0::read_raw();
        if cr_is_invalid(cr0, msr::VMX_CR0_FIXED0, msr::VMX_CR0_FIXED1) {
            return Err(HvError::BadState);
        }
        let cr4 = Cr4::read_raw() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        if cr_is_invalid(cr4, msr::VMX_CR4_FIXED0, msr::VMX_CR4_FIXED1) {
            return Err(HvError::BadState);
        }

        // Enable VMX using the VMXE bit.
        unsafe { Cr4::write_raw(cr4) };

        // Execute VMXON.
        let status = unsafe { raw::vmxon(self.page.phys().as_u64()) };
        self.is_on = status.is_ok();
        status
    }

    /// Leaves VMX root operation and clears CR4.VMXE.
    fn disable(&mut self) -> HvResult {
        if self.is_on {
            unsafe { raw::vmxoff()? };
            self.is_on = false;
        }
        unsafe {
            Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
        }
        Ok(())
    }
}

/// The VMXON context: one logical processor record per CPU, alive for as
/// long as the host stays in VMX root operation.
///
/// Guests are created from this context and borrow it, so the context
/// outlives every guest it created.
pub struct HypervisorContext {
    allocator: SharedFrameAllocator,
    per_cpus: Vec<VmxonPerCpu>,
}

impl HypervisorContext {
    fn new(allocator: &SharedFrameAllocator) -> HvResult<Self> {
        let vmx_info = VmxBasicInfo::read();
        let mut per_cpus = Vec::new();
        for _ in 0..max_num_cpus() {
            per_cpus.push(VmxonPerCpu::init(allocator, &vmx_info)?);
        }

        let mut context = HypervisorContext {
            allocator: allocator.clone(),
            per_cpus,
        };
        for cpu_num in 0..context.per_cpus.len() {
            let per_cpu = &mut context.per_cpus[cpu_num];
            percpu_exec(cpu_num, || per_cpu.enable())?;
        }
        Ok(context)
    }

    /// Builds the VMCS context for one guest.
    pub fn create_guest(
        &self,
        gpas: GuestPhysicalAddressSpace,
        serial_fifo: Arc<SerialFifo>,
    ) -> HvResult<GuestContext<'_>> {
        GuestContext::new(self, gpas, serial_fifo)
    }

    pub(crate) fn allocator(&self) -> &SharedFrameAllocator {
        &self.allocator
    }
}

impl Drop for HypervisorContext {
    fn drop(&mut self) {
        for cpu_num in 0..self.per_cpus.len() {
            let per_cpu = &mut self.per_cpus[cpu_num];
            let status = percpu_exec(cpu_num, || per_cpu.disable());
            debug_assert_eq!(status, Ok(()));
        }
    }
}

// ———————————————————————————— Host Kernel API ————————————————————————————— //

/// Probes VMX support and enters VMX root operation on the CPU set.
pub fn hypervisor_create(allocator: &SharedFrameAllocator) -> HvResult<HypervisorContext> {
    // Check that the CPU supports VMX.
    let cpuid = unsafe { core::arch::x86_64::__cpuid(0x01) };
    if cpuid.ecx & CPUID_ECX_VMX_MASK == 0 {
        return Err(HvError::NotSupported);
    }

    HypervisorContext::new(allocator)
}

/// Builds the VMCS context for one guest over the given physical address
/// space, with `serial_fifo` as the emulated UART sink.
pub fn guest_create<'hv>(
    hypervisor: &'hv HypervisorContext,
    gpas: GuestPhysicalAddressSpace,
    serial_fifo: Arc<SerialFifo>,
) -> HvResult<GuestContext<'hv>> {
    hypervisor.create_guest(gpas, serial_fifo)
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn bitfield_helpers() {
        assert_eq!(bits(0xABCD, 15, 8), 0xAB);
        assert_eq!(bits(0xABCD, 7, 0), 0xCD);
        assert_eq!(bits(u64::MAX, 44, 32), 0x1FFF);
        assert!(bit(1 << 54, 54));
        assert!(!bit(1 << 54, 55));
    }

    #[test_case]
    fn basic_info_decoding() {
        let raw = 0x12 | (0x1000u64 << 32) | (6 << 50) | (1 << 54) | (1 << 55);
        let info = VmxBasicInfo::from_raw(raw);
        assert_eq!(info.revision_id, 0x12);
        assert_eq!(info.region_size, 0x1000);
        assert!(info.write_back);
        assert!(info.io_exit_info);
        assert!(info.vmx_controls);

        // Memory type 0 (uncacheable) must not report write-back.
        let info = VmxBasicInfo::from_raw(0x12 | (0x1000u64 << 32));
        assert!(!info.write_back);
    }

    #[test_case]
    fn misc_info_decoding() {
        let info = MiscInfo::from_raw((1 << 8) | (2 << 25));
        assert!(info.wait_for_sipi);
        assert_eq!(info.msr_list_limit, 1536);

        let info = MiscInfo::from_raw(0);
        assert!(!info.wait_for_sipi);
        assert_eq!(info.msr_list_limit, 512);
    }

    #[test_case]
    fn ept_info_decoding() {
        let raw = (1 << 6) | (1 << 14) | (1 << 20) | (1 << 21) | (1 << 25) | (1 << 26);
        let info = EptInfo::from_raw(raw);
        assert!(info.page_walk_4);
        assert!(info.write_back);
        assert!(info.ept_flags);
        assert!(info.invept);
        assert!(!info.pde_2mb_page);

        // INVEPT requires the instruction and both context types.
        let info = EptInfo::from_raw(raw & !(1 << 25));
        assert!(!info.invept);
    }

    #[test_case]
    fn cr_fixed_bits() {
        // All constraints satisfied.
        assert!(!cr_fixed_bits_invalid(0b0110, 0b0010, 0b0111));
        // Bit 1 must be one.
        assert!(cr_fixed_bits_invalid(0b0100, 0b0010, 0b0111));
        // Bit 3 must be zero.
        assert!(cr_fixed_bits_invalid(0b1110, 0b0010, 0b0111));
        // Fully flexible.
        assert!(!cr_fixed_bits_invalid(0xFFFF, 0, u64::MAX));
    }
}
