#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(hvx::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use hvx::fifo::SerialFifo;
use hvx::memory::SharedFrameAllocator;
use hvx::vmx::{self, GuestPhysicalAddressSpace, HvError};
use hvx::{print, println, qemu};
use x86_64::VirtAddr;

entry_point!(kernel_main);

/// Size of guest physical memory.
const GUEST_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Guest-physical layout: page tables, then the program.
const GUEST_PML4: usize = 0x1000;
const GUEST_PDPT: usize = 0x2000;
const GUEST_PD: usize = 0x3000;
const GUEST_ENTRY: usize = 0x4000;

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    println!("=========== Start QEMU ===========");

    // Initialize kernel structures
    hvx::init();

    // Run tests and exit in test configuration
    #[cfg(test)]
    {
        test_main();
    }

    // Initialize memory management
    let physical_memory_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("The bootloader must be configured with 'map-physical-memory'"),
    );

    let allocator = unsafe {
        hvx::init_memory(physical_memory_offset, &*boot_info.memory_regions)
            .expect("Failed to initialize memory")
    };

    match run_demo_guest(&allocator) {
        Ok(()) => qemu::exit(qemu::ExitCode::Success),
        Err(err) => {
            println!("Guest:  Err({:?})", err);
            qemu::exit(qemu::ExitCode::Failure);
        }
    }
}

/// Brings up the hypervisor, loads the demo guest, and runs it until it
/// takes an exit the dispatcher does not handle.
fn run_demo_guest(allocator: &SharedFrameAllocator) -> vmx::HvResult {
    let hypervisor = vmx::hypervisor_create(allocator)?;
    println!("VMXON:  ok");

    let mut gpas = GuestPhysicalAddressSpace::new(allocator, GUEST_MEMORY_SIZE)?;
    load_demo_guest(&mut gpas)?;

    let serial_fifo = Arc::new(SerialFifo::new());
    let mut guest = vmx::guest_create(&hypervisor, gpas, serial_fifo.clone())?;
    guest.set_cr3(GUEST_PML4)?;
    guest.set_entry(GUEST_ENTRY)?;
    println!("VMCS:   ok");

    // Each call to enter handles one VM exit; the demo guest eventually
    // executes an unhandled CPUID leaf, which is its way of stopping.
    let status = loop {
        match guest.enter() {
            Ok(()) => drain_serial(&serial_fifo),
            Err(err) => break err,
        }
    };
    drain_serial(&serial_fifo);
    println!("Guest stopped: {:?}", status);

    match status {
        HvError::NotSupported => Ok(()),
        err => Err(err),
    }
}

/// Writes the guest page tables and program into guest memory.
///
/// The guest runs in 64-bit mode with the first 16 MiB identity mapped
/// through 2 MiB pages: PML4[0] -> PDPT[0] -> PD[0..8].
fn load_demo_guest(gpas: &mut GuestPhysicalAddressSpace) -> vmx::HvResult {
    const PRESENT_WRITABLE: u64 = 0b11;
    const HUGE_PAGE: u64 = 1 << 7;
    const TWO_MIB: u64 = 2 * 1024 * 1024;

    gpas.write_bytes(GUEST_PML4, &(GUEST_PDPT as u64 | PRESENT_WRITABLE).to_le_bytes())?;
    gpas.write_bytes(GUEST_PDPT, &(GUEST_PD as u64 | PRESENT_WRITABLE).to_le_bytes())?;
    for i in 0..(GUEST_MEMORY_SIZE as u64 / TWO_MIB) {
        gpas.write_bytes(
            GUEST_PD + 8 * i as usize,
            &(i * TWO_MIB | PRESENT_WRITABLE | HUGE_PAGE).to_le_bytes(),
        )?;
    }
    gpas.write_bytes(GUEST_ENTRY, &demo_program())?;
    Ok(())
}

/// A hand-assembled guest: prints a banner on the UART data port, executes
/// CPUID leaf 0 (handled and resumed), then CPUID leaf 1 (unhandled).
fn demo_program() -> Vec<u8> {
    let mut program = Vec::new();
    // mov dx, 0x3F8
    program.extend_from_slice(&[0x66, 0xBA, 0xF8, 0x03]);
    for &byte in b"Hello from the guest!\n" {
        // mov al, <byte>; out dx, al
        program.extend_from_slice(&[0xB0, byte, 0xEE]);
    }
    // xor eax, eax; cpuid
    program.extend_from_slice(&[0x31, 0xC0, 0x0F, 0xA2]);
    // mov eax, 1; cpuid
    program.extend_from_slice(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0x0F, 0xA2]);
    program
}

/// Forwards the guest's UART bytes to the host console.
fn drain_serial(serial_fifo: &SerialFifo) {
    let mut buf = [0u8; 64];
    loop {
        let count = serial_fifo.read(&mut buf);
        if count == 0 {
            break;
        }
        for &byte in &buf[..count] {
            print!("{}", byte as char);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);

    qemu::exit(qemu::ExitCode::Failure);
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    hvx::test_panic_handler(info);
}
