#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

pub mod allocator;
pub mod fifo;
pub mod gdt;
pub mod interrupts;
pub mod logger;
pub mod memory;
pub mod print;
pub mod qemu;
pub mod serial;
pub mod vmx;

use core::panic::PanicInfo;

use bootloader::boot_info::MemoryRegion;
use x86_64::VirtAddr;

/// Initializes the kernel structures: GDT, IDT, logger.
pub fn init() {
    gdt::init();
    interrupts::init();
    logger::init(log::LevelFilter::Info);
    x86_64::instructions::interrupts::enable();
}

/// Initializes the memory subsystem and returns the frame allocator.
///
/// SAFETY: must be called at most once, with a boot info that maps the
/// whole of physical memory at `physical_memory_offset`.
pub unsafe fn init_memory(
    physical_memory_offset: VirtAddr,
    regions: &'static [MemoryRegion],
) -> Result<memory::SharedFrameAllocator, ()> {
    memory::init(physical_memory_offset, regions)
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}

// ——————————————————————————————— Test Runner —————————————————————————————— //

pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        print!("{}...\t", core::any::type_name::<T>());
        self();
        println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    qemu::exit(qemu::ExitCode::Success);
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    println!("[failed]\n\nError: {}\n", info);
    qemu::exit(qemu::ExitCode::Failure);
}

#[cfg(test)]
use bootloader::{entry_point, BootInfo};

#[cfg(test)]
entry_point!(test_kernel_main);

/// Entry point for `cargo test`.
#[cfg(test)]
fn test_kernel_main(_boot_info: &'static mut BootInfo) -> ! {
    init();
    test_main();
    hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
