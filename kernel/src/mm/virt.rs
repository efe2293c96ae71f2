//! Virtual Address Space Management
//!
//! Each process has its own address space, managed here. The address space
//! only keeps books (regions, page table, heap cursor); frames are obtained
//! and released by the [`MemoryManager`](super::MemoryManager).

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::Serialize;

use super::{FrameNumber, PageFlags, PageTable, VirtAddr};
use crate::{KernelError, KernelResult, Pid};

/// Base of the per-process heap
pub const HEAP_START: u64 = 0x2000_0000;

bitflags! {
    /// Region protection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
    pub struct Protection: u8 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Read-write data
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Read-execute code
    pub const RX: Self = Self::READ.union(Self::EXECUTE);

    /// Check if an access is allowed
    pub fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.contains(Protection::READ),
            Access::Write => self.contains(Protection::WRITE),
            Access::Execute => self.contains(Protection::EXECUTE),
        }
    }

    /// Page table flags for pages of a region with this protection
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if self.contains(Protection::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if self.contains(Protection::EXECUTE) {
            flags |= PageFlags::EXECUTABLE;
        }
        flags
    }
}

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Load
    Read,
    /// Store
    Write,
    /// Instruction fetch
    Execute,
}

/// Region types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Pages handed out by `allocate_pages`, backed eagerly
    Heap,
    /// Explicitly mapped region, backed on first touch
    Anonymous,
}

/// Virtual memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualRegion {
    /// Start address
    pub start: VirtAddr,
    /// Size in bytes (whole pages)
    pub size: u64,
    /// Protection
    pub protection: Protection,
    /// Region type
    pub kind: RegionKind,
}

impl VirtualRegion {
    /// Create new region
    pub fn new(start: VirtAddr, size: u64, protection: Protection, kind: RegionKind) -> Self {
        Self { start, size, protection, kind }
    }

    /// End address (exclusive)
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.start.as_u64().saturating_add(self.size))
    }

    /// Check if address is in this region
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if regions overlap
    pub fn overlaps(&self, other: &VirtualRegion) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Address space for a process
#[derive(Debug)]
pub struct AddressSpace {
    pid: Pid,
    /// Frame holding the page-table root
    root_frame: FrameNumber,
    /// Regions keyed by start address
    regions: BTreeMap<u64, VirtualRegion>,
    page_table: PageTable,
    heap_cursor: VirtAddr,
    page_size: u64,
}

impl AddressSpace {
    /// Create new empty address space
    pub fn new(pid: Pid, root_frame: FrameNumber, page_size: u64) -> Self {
        Self {
            pid,
            root_frame,
            regions: BTreeMap::new(),
            page_table: PageTable::new(),
            heap_cursor: VirtAddr::new(HEAP_START),
            page_size,
        }
    }

    /// Owning process
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Frame holding the page-table root
    pub fn root_frame(&self) -> FrameNumber {
        self.root_frame
    }

    /// Add a region
    ///
    /// Fails with `RegionOverlap` on intersection and `MemoryLimitExceeded`
    /// if total region bytes would pass `limit`.
    pub fn add_region(&mut self, region: VirtualRegion, limit: u64) -> KernelResult<()> {
        if region.start.as_u64().checked_add(region.size).is_none() {
            return Err(KernelError::InvalidArgument(format!(
                "region {:#x}+{:#x} runs past the end of the address space",
                region.start.as_u64(),
                region.size
            )));
        }
        if self.regions.values().any(|r| r.overlaps(&region)) {
            return Err(KernelError::RegionOverlap {
                base: region.start.as_u64(),
                length: region.size,
            });
        }

        let requested = self.mapped_bytes().saturating_add(region.size);
        if requested > limit {
            return Err(KernelError::MemoryLimitExceeded { requested, limit });
        }

        self.regions.insert(region.start.as_u64(), region);
        Ok(())
    }

    /// Remove the region starting at `start`
    pub fn remove_region(&mut self, start: VirtAddr) -> Option<VirtualRegion> {
        self.regions.remove(&start.as_u64())
    }

    /// Find region containing address
    pub fn find_region(&self, addr: VirtAddr) -> Option<&VirtualRegion> {
        self.regions
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    /// Get mutable region starting at `start`
    pub fn region_mut(&mut self, start: VirtAddr) -> Option<&mut VirtualRegion> {
        self.regions.get_mut(&start.as_u64())
    }

    /// Iterate over regions in address order
    pub fn regions(&self) -> impl Iterator<Item = &VirtualRegion> {
        self.regions.values()
    }

    /// Sum of region sizes
    pub fn mapped_bytes(&self) -> u64 {
        self.regions.values().map(|r| r.size).sum()
    }

    /// Page table
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Mutable page table
    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Next heap address
    pub fn heap_cursor(&self) -> VirtAddr {
        self.heap_cursor
    }

    /// Move the heap cursor past `bytes`
    pub fn advance_heap(&mut self, bytes: u64) {
        self.heap_cursor = VirtAddr::new(self.heap_cursor.as_u64() + bytes);
    }

    /// Virtual page number of an address
    pub fn vpn(&self, addr: VirtAddr) -> u64 {
        addr.as_u64() / self.page_size
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u64 {
        self.page_size
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        tracing::trace!("Address space of pid {} dropped", self.pid);
    }
}
