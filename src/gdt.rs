//! Kernel segmentation
//!
//! The kernel GDT with 64-bit code and data descriptors and a TSS. The VMCS
//! host-state area needs real selectors, the TSS base, and the descriptor
//! table bases, so this module exposes them.

use core::ptr::addr_of;

use spin::Lazy;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

static TSS: Lazy<TaskStateSegment> = Lazy::new(|| {
    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
        static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
        let stack_start = VirtAddr::from_ptr(unsafe { addr_of!(STACK) });
        stack_start + STACK_SIZE
    };
    tss
});

static GDT: Lazy<(GlobalDescriptorTable, Selectors)> = Lazy::new(|| {
    let mut gdt = GlobalDescriptorTable::new();
    let code = gdt.add_entry(Descriptor::kernel_code_segment());
    let data = gdt.add_entry(Descriptor::kernel_data_segment());
    let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
    (gdt, Selectors { code, data, tss })
});

pub struct Selectors {
    pub code: SegmentSelector,
    pub data: SegmentSelector,
    pub tss: SegmentSelector,
}

/// Loads the GDT and reloads the segment registers and task register.
pub fn init() {
    GDT.0.load();
    let selectors = &GDT.1;
    unsafe {
        CS::set_reg(selectors.code);
        SS::set_reg(selectors.data);
        DS::set_reg(SegmentSelector(0));
        ES::set_reg(SegmentSelector(0));
        FS::set_reg(SegmentSelector(0));
        GS::set_reg(SegmentSelector(0));
        load_tss(selectors.tss);
    }
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Base address of the kernel TSS, as required by the VMCS host state.
pub fn tss_base() -> u64 {
    &*TSS as *const TaskStateSegment as u64
}

/// Reloads the task register.
///
/// VM exits restore TR with a limit of 0x67, which excludes the I/O bitmap.
/// Reloading from the GDT restores the full limit. The descriptor's busy bit
/// must be cleared first, `ltr` faults on a busy TSS.
pub fn reload_tss() {
    let selectors = &GDT.1;
    let gdt = x86_64::instructions::tables::sgdt();
    unsafe {
        let descriptor = (gdt.base.as_u64() as *mut u64).add((selectors.tss.0 >> 3) as usize);
        *descriptor &= !(1 << 41);
        load_tss(selectors.tss);
    }
}
