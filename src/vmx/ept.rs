//! Extended Page Tables
//!
//! A 4-level EPT mapper with 4 KiB leaves, and the guest physical address
//! space built on top of it: guest-physical `[0, size)` backed by a
//! contiguous range of host memory, identity-offset mapped.

use x86_64::VirtAddr;

use super::bitmaps::EptEntryFlags;
use super::errors::{HvError, HvResult};
use super::{Frame, GuestPhysAddr, HostPhysAddr, PAGE_SIZE};
use crate::memory::{PhysRange, SharedFrameAllocator};

/// Flags of non-leaf entries: the memory type lives in leaf entries only.
const EPT_TABLE_FLAGS: EptEntryFlags = EptEntryFlags::READ
    .union(EptEntryFlags::WRITE)
    .union(EptEntryFlags::SUPERVISOR_EXECUTE);

/// Flags of leaf entries, write-back memory.
const EPT_LEAF_FLAGS: EptEntryFlags = EPT_TABLE_FLAGS.union(EptEntryFlags::MEMORY_TYPE_WB);

/// Mask of the physical address bits in an EPT entry.
const EPT_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// ——————————————————————————————— EPT Mapper ——————————————————————————————— //

/// The paging structures of one guest.
///
/// Table frames come from the shared allocator and are returned when the
/// mapper is freed.
struct ExtendedPageTableMapper {
    root: Frame,
    physical_memory_offset: VirtAddr,
}

impl ExtendedPageTableMapper {
    fn new(allocator: &SharedFrameAllocator) -> HvResult<Self> {
        let root = allocator.allocate_zeroed_frame().ok_or(HvError::NoMemory)?;
        Ok(Self {
            root,
            physical_memory_offset: allocator.get_physical_offset(),
        })
    }

    fn pml4_address(&self) -> HostPhysAddr {
        self.root.phys_addr
    }

    fn table_ptr(&self, phys: u64) -> *mut u64 {
        (phys + self.physical_memory_offset.as_u64()) as *mut u64
    }

    /// Maps one 4 KiB guest-physical page to `hpa`.
    ///
    /// SAFETY: `hpa` must be owned by the caller for the lifetime of the
    /// mapping.
    unsafe fn map(
        &mut self,
        allocator: &SharedFrameAllocator,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
    ) -> HvResult {
        let l4 = self.table_ptr(self.root.phys_addr.as_u64());
        let l3 = self.next_table(allocator, l4, gpa.l4_index())?;
        let l2 = self.next_table(allocator, l3, gpa.l3_index())?;
        let l1 = self.next_table(allocator, l2, gpa.l2_index())?;

        let entry = l1.add(gpa.l1_index());
        if *entry != 0 {
            return Err(HvError::InvalidArgs);
        }
        *entry = hpa.as_u64() | EPT_LEAF_FLAGS.bits();
        Ok(())
    }

    /// Returns the table pointed to by `table[index]`, allocating it if the
    /// entry is non-present.
    unsafe fn next_table(
        &self,
        allocator: &SharedFrameAllocator,
        table: *mut u64,
        index: usize,
    ) -> HvResult<*mut u64> {
        let entry = table.add(index);
        if *entry == 0 {
            let frame = allocator.allocate_zeroed_frame().ok_or(HvError::NoMemory)?;
            *entry = frame.phys_addr.as_u64() | EPT_TABLE_FLAGS.bits();
        }
        Ok(self.table_ptr(*entry & EPT_ADDR_MASK))
    }

    /// Returns every table frame to the allocator. The leaves point into
    /// guest memory, which is not owned by the mapper.
    ///
    /// SAFETY: the hardware must not hold the EPT pointer anymore.
    unsafe fn free(&mut self, allocator: &SharedFrameAllocator) {
        self.free_level(allocator, self.root.phys_addr.as_u64(), 4);
        allocator.deallocate_frame(self.root);
    }

    unsafe fn free_level(&self, allocator: &SharedFrameAllocator, table_phys: u64, level: u8) {
        if level == 1 {
            return;
        }
        let table = self.table_ptr(table_phys);
        for index in 0..512 {
            let entry = *table.add(index);
            if entry == 0 {
                continue;
            }
            let child_phys = entry & EPT_ADDR_MASK;
            self.free_level(allocator, child_phys, level - 1);
            allocator.deallocate_frame(Frame {
                phys_addr: HostPhysAddr::new(child_phys as usize),
                virt_addr: self.table_ptr(child_phys) as *mut u8,
            });
        }
    }
}

// ———————————————————————— Guest Physical Memory ——————————————————————————— //

/// The physical address space of one guest.
///
/// Supplies the EPT root for the VMCS and the memory size that bounds the
/// guest CR3 and entry point. Guest images are loaded through
/// [`write_bytes`](Self::write_bytes).
pub struct GuestPhysicalAddressSpace {
    mapper: ExtendedPageTableMapper,
    backing: PhysRange,
    size: usize,
    allocator: SharedFrameAllocator,
}

impl GuestPhysicalAddressSpace {
    /// Allocates and maps `size` bytes of zeroed guest memory.
    pub fn new(allocator: &SharedFrameAllocator, size: usize) -> HvResult<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(HvError::InvalidArgs);
        }
        let backing = allocator.allocate_range(size as u64).ok_or(HvError::NoMemory)?;
        let offset = allocator.get_physical_offset();
        unsafe {
            core::ptr::write_bytes((backing.start.as_u64() + offset.as_u64()) as *mut u8, 0, size);
        }

        let mut mapper = ExtendedPageTableMapper::new(allocator)?;
        for page in (0..size).step_by(PAGE_SIZE) {
            unsafe {
                mapper.map(
                    allocator,
                    GuestPhysAddr::new(page),
                    HostPhysAddr::new(backing.start.as_u64() as usize + page),
                )?;
            }
        }

        Ok(Self {
            mapper,
            backing,
            size,
            allocator: allocator.clone(),
        })
    }

    /// Root of the EPT paging structures, for the VMCS EPT pointer.
    pub fn pml4_address(&self) -> HostPhysAddr {
        self.mapper.pml4_address()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies `bytes` into guest memory at `gpa`.
    pub fn write_bytes(&mut self, gpa: usize, bytes: &[u8]) -> HvResult {
        let end = gpa.checked_add(bytes.len()).ok_or(HvError::InvalidArgs)?;
        if end > self.size {
            return Err(HvError::InvalidArgs);
        }
        let offset = self.allocator.get_physical_offset();
        let dst = (self.backing.start.as_u64() + offset.as_u64()) as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(gpa), bytes.len());
        }
        Ok(())
    }
}

impl Drop for GuestPhysicalAddressSpace {
    fn drop(&mut self) {
        // SAFETY: the owning guest context ran VMCLEAR before dropping its
        // fields, so the hardware no longer holds the EPT pointer and the
        // backing frames are not referenced anymore.
        unsafe {
            self.mapper.free(&self.allocator);
            let offset = self.allocator.get_physical_offset();
            for page in (0..self.size).step_by(PAGE_SIZE) {
                let phys = self.backing.start.as_u64() + page as u64;
                self.allocator.deallocate_frame(Frame {
                    phys_addr: HostPhysAddr::new(phys as usize),
                    virt_addr: (phys + offset.as_u64()) as *mut u8,
                });
            }
        }
    }
}
