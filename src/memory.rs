//! Physical memory management
//!
//! Frames are handed out from the bootloader's memory map. Freed frames go
//! on a free list and are reused, so that releasing a VMX region actually
//! returns its frame. The `SharedFrameAllocator` is a cheap cloneable handle
//! that every owner of physical memory (contexts, VMX pages, page tables)
//! goes through.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bootloader::boot_info::{MemoryRegion, MemoryRegionKind};
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::frame::PhysFrame;
use x86_64::structures::paging::page_table::PageTable;
use x86_64::structures::paging::{OffsetPageTable, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator;
use crate::vmx::{Frame, HostPhysAddr};

const PAGE_SIZE: usize = 0x1000;

// ————————————————————————— Memory Initialization —————————————————————————— //

/// Initializes the memory subsystem.
///
/// After success, the memory subsystem is operational, meaning that the
/// global allocator is available (and thus heap allocated values such as
/// `Box` and `Vec` can be used).
///
/// SAFETY: This function must be called **at most once**, and the boot info
/// must contain a valid mapping of the physical memory.
pub unsafe fn init(
    physical_memory_offset: VirtAddr,
    regions: &'static [MemoryRegion],
) -> Result<SharedFrameAllocator, ()> {
    let level_4_table = active_level_4_table(physical_memory_offset);

    // Initialize the frame allocator and the memory mapper.
    let mut mapper = OffsetPageTable::new(level_4_table, physical_memory_offset);
    let mut frame_allocator = BootInfoFrameAllocator::init(regions);

    // Initialize the heap.
    allocator::init_heap(&mut mapper, &mut frame_allocator).map_err(|_| ())?;

    Ok(SharedFrameAllocator::new(
        frame_allocator,
        physical_memory_offset,
    ))
}

/// This function is unsafe because the caller must guarantee that the
/// complete physical memory is mapped to virtual memory at the passed
/// `physical_memory_offset`. Also, this function must be only called once
/// to avoid aliasing `&mut` references (which is undefined behavior).
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table: *mut PageTable = virt.as_mut_ptr();

    &mut *page_table
}

// ———————————————————————————— Frame Allocator ————————————————————————————— //

/// A range of physical memory.
pub struct PhysRange {
    /// Start of the physical range (inclusive).
    pub start: PhysAddr,
    /// End of the physical range (exclusive).
    pub end: PhysAddr,
}

impl PhysRange {
    pub fn size(&self) -> usize {
        (self.end.as_u64() - self.start.as_u64()) as usize
    }
}

/// A frame allocator over the bootloader's memory map.
///
/// Fresh frames come from a bump cursor over the usable regions; released
/// frames are recycled through a free list.
pub struct BootInfoFrameAllocator {
    memory_map: &'static [MemoryRegion],
    region_idx: usize,
    next_frame: u64,
    free_frames: Vec<PhysFrame>,
}

impl BootInfoFrameAllocator {
    /// Create a FrameAllocator from the passed memory map.
    ///
    /// This function is unsafe because the caller must guarantee that the
    /// passed memory map is valid. The main requirement is that all frames
    /// that are marked as `USABLE` in it are really unused.
    pub unsafe fn init(memory_map: &'static [MemoryRegion]) -> Self {
        let region_idx = 0;
        let next_frame = memory_map[region_idx].start;
        let mut allocator = BootInfoFrameAllocator {
            memory_map,
            next_frame,
            region_idx,
            free_frames: Vec::new(),
        };

        // If first region is not usable, we need to move to the next usable one
        if allocator.memory_map[allocator.region_idx].kind != MemoryRegionKind::Usable {
            allocator
                .goto_next_region()
                .expect("No usable memory region");
        }
        allocator
    }

    /// Allocates a single frame.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.free_frames.pop() {
            return Some(frame);
        }
        let region = self.memory_map[self.region_idx];
        if self.next_frame >= region.end {
            if self.goto_next_region().is_ok() {
                // Retry allocation
                self.allocate_frame()
            } else {
                // All the memory is exhausted
                None
            }
        } else {
            let frame = PhysFrame::containing_address(PhysAddr::new(self.next_frame));
            self.next_frame += PAGE_SIZE as u64;
            Some(frame)
        }
    }

    /// Returns a frame to the free list.
    ///
    /// SAFETY: the frame must have been allocated by this allocator and no
    /// reference to its memory may remain.
    pub unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free_frames.push(frame);
    }

    /// Allocates a contiguous range of physical memory.
    pub fn allocate_range(&mut self, size: u64) -> Option<PhysRange> {
        let region = self.memory_map[self.region_idx];
        if self.next_frame + size > region.end {
            if self.goto_next_region().is_ok() {
                // Retry allocation
                self.allocate_range(size)
            } else {
                // All the memory is exhausted
                None
            }
        } else {
            let start = PhysAddr::new(self.next_frame);
            let end = PhysAddr::new(self.next_frame + size);
            let nb_pages = bytes_to_pages(size as usize);
            self.next_frame = self.next_frame + (nb_pages * PAGE_SIZE) as u64;
            Some(PhysRange { start, end })
        }
    }

    /// Move the cursor to the next memory region
    fn goto_next_region(&mut self) -> Result<(), ()> {
        while self.region_idx + 1 < self.memory_map.len() {
            self.region_idx += 1;

            // Check if usable
            if self.memory_map[self.region_idx].kind == MemoryRegionKind::Usable {
                self.next_frame = self.memory_map[self.region_idx].start;
                return Ok(());
            }
        }

        // All the memory is exhausted
        self.next_frame = self.memory_map[self.region_idx].end;
        Err(())
    }
}

unsafe impl x86_64::structures::paging::FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        Self::allocate_frame(self)
    }
}

// ————————————————————————— Shared Frame Allocator ————————————————————————— //

#[derive(Clone)]
pub struct SharedFrameAllocator {
    alloc: Arc<Mutex<BootInfoFrameAllocator>>,
    physical_memory_offset: VirtAddr,
}

impl SharedFrameAllocator {
    pub fn new(alloc: BootInfoFrameAllocator, physical_memory_offset: VirtAddr) -> Self {
        Self {
            alloc: Arc::new(Mutex::new(alloc)),
            physical_memory_offset,
        }
    }

    pub fn allocate_frame(&self) -> Option<Frame> {
        let mut inner = self.alloc.lock();
        let frame = inner.allocate_frame()?;

        Some(Frame {
            phys_addr: HostPhysAddr::new(frame.start_address().as_u64() as usize),
            virt_addr: (frame.start_address().as_u64() + self.physical_memory_offset.as_u64())
                as *mut u8,
        })
    }

    pub fn allocate_zeroed_frame(&self) -> Option<Frame> {
        let frame = self.allocate_frame()?;
        unsafe {
            core::ptr::write_bytes(frame.virt_addr, 0, PAGE_SIZE);
        }
        Some(frame)
    }

    /// Returns a frame to the allocator.
    ///
    /// SAFETY: the frame must come from this allocator and must not be
    /// referenced anymore, in particular not by the hardware (VMCS pointer,
    /// EPT entries).
    pub unsafe fn deallocate_frame(&self, frame: Frame) {
        let mut inner = self.alloc.lock();
        inner.deallocate_frame(PhysFrame::containing_address(PhysAddr::new(
            frame.phys_addr.as_u64(),
        )));
    }

    pub fn allocate_range(&self, size: u64) -> Option<PhysRange> {
        let mut inner = self.alloc.lock();
        inner.allocate_range(size)
    }

    /// Returns the offset between physical and virtual addresses.
    pub fn get_physical_offset(&self) -> VirtAddr {
        self.physical_memory_offset
    }
}

// ———————————————————————————— Helper Functions ———————————————————————————— //

/// Returns the number of pages to add in order to grow by at least `n` bytes.
fn bytes_to_pages(n: usize) -> usize {
    let page_aligned = (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    page_aligned / PAGE_SIZE
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn bytes_to_pages() {
        assert_eq!(super::bytes_to_pages(0), 0);
        assert_eq!(super::bytes_to_pages(1), 1);
        assert_eq!(super::bytes_to_pages(PAGE_SIZE - 1), 1);
        assert_eq!(super::bytes_to_pages(PAGE_SIZE), 1);
        assert_eq!(super::bytes_to_pages(PAGE_SIZE + 1), 2);
    }
}
