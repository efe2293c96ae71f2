//! Memory Management Subsystem
//!
//! Provides physical and virtual memory management:
//! - Physical frame ledger (bitmap)
//! - Buddy allocator, the source of every physical block
//! - Slab caches for sub-page kernel objects
//! - Per-process address spaces and page tables
//!
//! # Physical Memory
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │        MemoryManager         │
//!            └──┬───────────┬───────────┬───┘
//!               │           │           │
//!       ┌───────▼──┐  ┌─────▼────┐  ┌───▼──────────┐
//!       │   Slab   │  │ Address  │  │ Page-table   │
//!       │  caches  │  │  spaces  │  │    roots     │
//!       └───────┬──┘  └─────┬────┘  └───┬──────────┘
//!               └───────────┼───────────┘
//!                     ┌─────▼─────┐      ┌─────────────┐
//!                     │   Buddy   │─────▶│ Frame bitmap│
//!                     └───────────┘      └─────────────┘
//! ```
//!
//! Every block leaving the buddy allocator is claimed in the bitmap and every
//! block returning is released from it first. A mismatch between the two, or
//! a page-table entry pointing at a free frame, halts the manager.

pub mod buddy;
pub mod frame;
pub mod page;
pub mod slab;
pub mod virt;

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::{KernelError, KernelResult, Pid};

pub use buddy::BuddyAllocator;
pub use frame::FrameAllocator;
pub use page::{PageFlags, PageTable, PageTableEntry};
pub use slab::{KernelObject, PageSource, SlabAllocator, SlabCacheStats};
pub use virt::{Access, AddressSpace, Protection, RegionKind, VirtualRegion, HEAP_START};

/// Physical frame number
pub type FrameNumber = usize;

/// Physical address type (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Virtual address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create new virtual address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align up to a power-of-two boundary, `None` past the top of memory
    pub const fn checked_align_up(self, align: u64) -> Option<Self> {
        match self.0.checked_add(align - 1) {
            Some(v) => Some(Self(v & !(align - 1))),
            None => None,
        }
    }

    /// Check alignment to a power-of-two boundary
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// Result of `allocate_pages`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAllocation {
    /// First virtual address of the new heap region
    pub base: VirtAddr,
    /// Backing frames, in virtual page order
    pub frames: Vec<FrameNumber>,
}

/// Memory usage of one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMemory {
    /// Owner
    pub pid: Pid,
    /// Regions in address order
    pub regions: Vec<VirtualRegion>,
    /// Sum of region sizes
    pub mapped_bytes: u64,
    /// Pages backed by a frame
    pub resident_pages: usize,
    /// Page-table root frame
    pub root_frame: FrameNumber,
}

/// System-wide memory statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Frame size in bytes
    pub page_size: u64,
    /// Frames under management
    pub total_frames: usize,
    /// Frames free in the bitmap
    pub free_frames: usize,
    /// Frames in use
    pub used_frames: usize,
    /// Live address spaces
    pub address_spaces: usize,
    /// Free buddy blocks per order
    pub buddy_free_blocks: Vec<usize>,
    /// Largest order with a free block
    pub largest_free_order: Option<u8>,
    /// `1 - largest free block / free frames`, 0.0 when nothing is free
    pub fragmentation: f64,
    /// Slab caches
    pub slab_caches: Vec<SlabCacheStats>,
    /// Demand-paging faults served
    pub page_faults: u64,
    /// Whether a consistency fault halted the manager
    pub halted: bool,
}

/// Buddy allocator and bitmap seen together as one page supplier
struct PhysicalPages<'a> {
    frames: &'a mut FrameAllocator,
    buddy: &'a mut BuddyAllocator,
}

impl PageSource for PhysicalPages<'_> {
    fn alloc_pages(&mut self, order: u8) -> KernelResult<FrameNumber> {
        let block = self.buddy.alloc(order)?;
        self.frames.claim_range(block, 1 << order)?;
        Ok(block)
    }

    fn free_pages(&mut self, block: FrameNumber, order: u8) -> KernelResult<()> {
        for frame in block..block + (1 << order) {
            self.frames.release(frame)?;
        }
        self.buddy.free(block, order)
    }
}

/// Memory manager: owns every physical allocator and address space
pub struct MemoryManager {
    config: MemoryConfig,
    frames: FrameAllocator,
    buddy: BuddyAllocator,
    slab: SlabAllocator,
    spaces: BTreeMap<Pid, AddressSpace>,
    page_faults: u64,
    /// Set once a consistency fault is seen
    halted: Option<String>,
}

impl MemoryManager {
    /// Create a memory manager with all memory free
    pub fn new(config: &MemoryConfig) -> Self {
        let total_frames = config.total_frames();
        let buddy = BuddyAllocator::new(total_frames);

        info!(
            "Memory: {} frames of {} bytes, max order {}",
            total_frames,
            config.page_size,
            buddy.max_order()
        );

        Self {
            config: config.clone(),
            frames: FrameAllocator::new(total_frames, config.page_size),
            buddy,
            slab: SlabAllocator::new(&config.slab_size_classes, config.page_size, config.slab_order),
            spaces: BTreeMap::new(),
            page_faults: 0,
            halted: None,
        }
    }

    // ========== Address Spaces ==========

    /// Create the address space of `pid`, taking one page-table root frame
    ///
    /// Returns without change if the space already exists.
    pub fn create_address_space(&mut self, pid: Pid) -> KernelResult<()> {
        self.guard()?;
        if self.spaces.contains_key(&pid) {
            return Ok(());
        }

        let root = self.pages().alloc_pages(0);
        let root = self.latch(root)?;
        self.spaces.insert(pid, AddressSpace::new(pid, root, self.config.page_size));
        debug!("Address space created for pid {} (root frame {})", pid, root);
        Ok(())
    }

    /// Release every frame of `pid`'s address space; no-op if it has none
    pub fn destroy_address_space(&mut self, pid: Pid) -> KernelResult<()> {
        self.guard()?;
        let Some(mut space) = self.spaces.remove(&pid) else {
            return Ok(());
        };

        let mut frames = space.page_table_mut().clear();
        frames.push(space.root_frame());
        let released = frames.len();
        let result = self.release_frames(frames);
        self.latch(result)?;
        debug!("Address space of pid {} destroyed ({} frames released)", pid, released);
        Ok(())
    }

    /// Give `child` a copy of `parent`'s layout
    ///
    /// Regions and the heap cursor carry over. Every present parent page gets
    /// a fresh frame in the child with the same flags, accessed and dirty
    /// cleared. The child space must exist and be empty. On failure the
    /// child keeps what was copied; destroying it releases everything.
    pub fn fork_address_space(&mut self, parent: Pid, child: Pid) -> KernelResult<()> {
        self.guard()?;
        let source = self.spaces.get(&parent).ok_or(KernelError::InvalidPid(parent))?;
        let regions: Vec<VirtualRegion> = source.regions().cloned().collect();
        let pages: Vec<(u64, PageFlags)> = source
            .page_table()
            .iter()
            .filter(|(_, entry)| entry.is_present())
            .map(|(vpn, entry)| (vpn, entry.flags() - (PageFlags::ACCESSED | PageFlags::DIRTY)))
            .collect();
        let heap_cursor = source.heap_cursor();

        let limit = self.config.max_memory_per_process;
        let space = self.spaces.get_mut(&child).ok_or(KernelError::InvalidPid(child))?;
        if space.regions().next().is_some() {
            return Err(KernelError::InvalidArgument(format!(
                "pid {} already has regions",
                child
            )));
        }
        for region in regions {
            space.add_region(region, limit)?;
        }
        let skip = heap_cursor.as_u64().saturating_sub(space.heap_cursor().as_u64());
        space.advance_heap(skip);

        let copied = pages.len();
        for (vpn, flags) in pages {
            let frame = self.pages().alloc_pages(0);
            let frame = self.latch(frame)?;
            let space = self.spaces.get_mut(&child).ok_or(KernelError::InvalidPid(child))?;
            let mapped = space.page_table_mut().map(vpn, frame, flags);
            self.latch(mapped)?;
        }

        debug!("pid {}: forked address space of pid {} ({} pages)", child, parent, copied);
        Ok(())
    }

    /// Check if `pid` has an address space
    pub fn has_address_space(&self, pid: Pid) -> bool {
        self.spaces.contains_key(&pid)
    }

    /// Borrow an address space
    pub fn address_space(&self, pid: Pid) -> Option<&AddressSpace> {
        self.spaces.get(&pid)
    }

    /// Reserve a region backed on first touch
    pub fn map_region(
        &mut self,
        pid: Pid,
        base: VirtAddr,
        length: u64,
        protection: Protection,
    ) -> KernelResult<VirtualRegion> {
        self.guard()?;
        let page_size = self.config.page_size;
        if !base.is_aligned(page_size) {
            return Err(KernelError::InvalidArgument(format!(
                "region base {:#x} is not page aligned",
                base.as_u64()
            )));
        }
        if length == 0 {
            return Err(KernelError::InvalidArgument("zero-length region".into()));
        }

        let size = VirtAddr::new(length)
            .checked_align_up(page_size)
            .ok_or_else(|| KernelError::InvalidArgument(format!("region length {:#x} too large", length)))?
            .as_u64();
        let region = VirtualRegion::new(base, size, protection, RegionKind::Anonymous);
        let limit = self.config.max_memory_per_process;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
        space.add_region(region.clone(), limit)?;

        debug!("pid {}: mapped {:#x}+{:#x} {:?}", pid, base.as_u64(), size, protection);
        Ok(region)
    }

    /// Remove the region starting at `base` and release its frames
    pub fn unmap_region(&mut self, pid: Pid, base: VirtAddr) -> KernelResult<()> {
        self.guard()?;
        let page_size = self.config.page_size;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
        let region = space.remove_region(base).ok_or_else(|| {
            KernelError::InvalidArgument(format!("no region starts at {:#x}", base.as_u64()))
        })?;

        let first = space.vpn(region.start);
        let count = region.size / page_size;
        let table = space.page_table_mut();
        let vpns: Vec<u64> = table.range(first, count).map(|(vpn, _)| vpn).collect();
        let frames: Vec<FrameNumber> = vpns
            .into_iter()
            .filter_map(|vpn| table.unmap(vpn))
            .map(|e| e.frame())
            .collect();

        let result = self.release_frames(frames);
        self.latch(result)
    }

    /// Change the protection of the region starting at `base`
    ///
    /// Present pages keep their frame and accessed/dirty bits.
    pub fn protect(&mut self, pid: Pid, base: VirtAddr, protection: Protection) -> KernelResult<()> {
        self.guard()?;
        let page_size = self.config.page_size;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
        let region = space.region_mut(base).ok_or_else(|| {
            KernelError::InvalidArgument(format!("no region starts at {:#x}", base.as_u64()))
        })?;
        region.protection = protection;
        let (start, count) = (region.start, region.size / page_size);

        let first = space.vpn(start);
        let table = space.page_table_mut();
        let vpns: Vec<u64> = table.range(first, count).map(|(vpn, _)| vpn).collect();
        for vpn in vpns {
            if let Some(entry) = table.entry_mut(vpn) {
                let sticky = entry.flags() & (PageFlags::ACCESSED | PageFlags::DIRTY);
                entry.set_flags(protection.page_flags() | sticky);
            }
        }
        Ok(())
    }

    // ========== Page Allocation ==========

    /// Allocate `count` pages as a new heap region at the heap cursor
    pub fn allocate_pages(&mut self, pid: Pid, count: usize) -> KernelResult<PageAllocation> {
        self.guard()?;
        if count == 0 {
            return Err(KernelError::InvalidArgument("zero-page allocation".into()));
        }

        let page_size = self.config.page_size;
        let limit = self.config.max_memory_per_process;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
        let base = space.heap_cursor();
        let bytes = (count as u64).checked_mul(page_size).ok_or(KernelError::MemoryLimitExceeded {
            requested: u64::MAX,
            limit,
        })?;
        space.add_region(VirtualRegion::new(base, bytes, Protection::RW, RegionKind::Heap), limit)?;

        let block = match self.buddy.alloc_frames(count) {
            Ok(block) => block,
            Err(e) => {
                space.remove_region(base);
                warn!("pid {}: allocation of {} pages failed: {}", pid, count, e);
                return Err(e);
            }
        };
        if let Err(e) = self.frames.claim_range(block, count) {
            space.remove_region(base);
            return self.latch(Err(e));
        }

        let first = space.vpn(base);
        let flags = Protection::RW.page_flags();
        let frames: Vec<FrameNumber> = (block..block + count).collect();
        for (i, &frame) in frames.iter().enumerate() {
            if let Err(e) = space.page_table_mut().map(first + i as u64, frame, flags) {
                return self.latch(Err(e));
            }
        }
        space.advance_heap(bytes);

        debug!("pid {}: {} pages at {:#x} (frames {}..{})", pid, count, base.as_u64(), block, block + count);
        Ok(PageAllocation { base, frames })
    }

    /// Free frames mapped by `pid`, all or nothing
    pub fn free_pages(&mut self, pid: Pid, frames: &[FrameNumber]) -> KernelResult<()> {
        self.guard()?;
        let page_size = self.config.page_size;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;

        let mut seen = HashSet::new();
        for &frame in frames {
            if frame >= self.frames.total_frames() {
                return Err(KernelError::InvalidAddress(frame as u64 * page_size));
            }
            if self.frames.is_free(frame) || !seen.insert(frame) {
                warn!("pid {}: double free of frame {}", pid, frame);
                return Err(KernelError::DoubleFree(frame as u64 * page_size));
            }
            if space.page_table().page_of(frame).is_none() {
                warn!("pid {}: frame {} is not mapped by this process", pid, frame);
                return Err(KernelError::NotOwner { pid, frame: frame as u64 });
            }
        }

        for &frame in frames {
            if let Some(vpn) = space.page_table().page_of(frame) {
                space.page_table_mut().unmap(vpn);
            }
        }

        // Heap regions with nothing left mapped go away
        let empty_heaps: Vec<VirtAddr> = space
            .regions()
            .filter(|r| r.kind == RegionKind::Heap)
            .filter(|r| {
                space
                    .page_table()
                    .range(space.vpn(r.start), r.size / page_size)
                    .next()
                    .is_none()
            })
            .map(|r| r.start)
            .collect();
        for start in empty_heaps {
            space.remove_region(start);
        }

        let result = self.release_frames(frames.to_vec());
        self.latch(result)
    }

    // ========== Translation ==========

    /// Translate a virtual address, updating accessed/dirty bits
    pub fn translate(&mut self, pid: Pid, addr: VirtAddr, access: Access) -> KernelResult<PhysAddr> {
        self.guard()?;
        let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
        let region = space
            .find_region(addr)
            .ok_or(KernelError::PageFault { pid, addr: addr.as_u64() })?;
        if !region.protection.allows(access) {
            return Err(KernelError::ProtectionFault { pid, addr: addr.as_u64() });
        }

        let vpn = space.vpn(addr);
        let page_size = space.page_size();
        let entry = space
            .page_table_mut()
            .entry_mut(vpn)
            .filter(|e| e.is_present())
            .ok_or(KernelError::PageFault { pid, addr: addr.as_u64() })?;

        let frame = entry.frame();
        if self.frames.is_free(frame) {
            let fault = KernelError::ConsistencyFault(format!(
                "pid {} page {:#x} maps free frame {}",
                pid, vpn, frame
            ));
            return self.latch(Err(fault));
        }

        let mut touched = PageFlags::ACCESSED;
        if access == Access::Write {
            touched |= PageFlags::DIRTY;
        }
        entry.insert_flags(touched);

        Ok(PhysAddr::new(frame as u64 * page_size + addr.as_u64() % page_size))
    }

    /// Back the faulting page with a fresh frame if the access is legal
    pub fn handle_page_fault(&mut self, pid: Pid, addr: VirtAddr, access: Access) -> KernelResult<PhysAddr> {
        self.guard()?;
        let space = self.spaces.get(&pid).ok_or(KernelError::InvalidPid(pid))?;
        let region = space
            .find_region(addr)
            .ok_or(KernelError::PageFault { pid, addr: addr.as_u64() })?;
        if !region.protection.allows(access) {
            return Err(KernelError::ProtectionFault { pid, addr: addr.as_u64() });
        }
        let flags = region.protection.page_flags();
        let vpn = space.vpn(addr);

        if space.page_table().entry(vpn).map_or(true, |e| !e.is_present()) {
            let frame = self.pages().alloc_pages(0);
            let frame = self.latch(frame)?;
            let space = self.spaces.get_mut(&pid).ok_or(KernelError::InvalidPid(pid))?;
            let mapped = space.page_table_mut().map(vpn, frame, flags);
            self.latch(mapped)?;
            self.page_faults += 1;
            debug!("pid {}: demand-paged {:#x} -> frame {}", pid, addr.as_u64(), frame);
        }

        self.translate(pid, addr, access)
    }

    // ========== Kernel Objects ==========

    /// Allocate a kernel object from the slab caches
    pub fn allocate_kernel(&mut self, size: usize) -> KernelResult<KernelObject> {
        self.guard()?;
        let mut pages = PhysicalPages {
            frames: &mut self.frames,
            buddy: &mut self.buddy,
        };
        let result = self.slab.allocate(size, &mut pages);
        self.latch(result)
    }

    /// Free a kernel object
    pub fn free_kernel(&mut self, addr: PhysAddr) -> KernelResult<()> {
        self.guard()?;
        self.slab.free(addr)
    }

    /// Periodic maintenance: reclaim idle slabs and audit invariants
    ///
    /// Returns the number of slabs released.
    pub fn sweep(&mut self) -> KernelResult<usize> {
        self.guard()?;
        let mut pages = PhysicalPages {
            frames: &mut self.frames,
            buddy: &mut self.buddy,
        };
        let result = self.slab.reclaim(&mut pages);
        let released = self.latch(result)?;
        self.audit()?;
        Ok(released)
    }

    /// Check cross-structure invariants, halting on the first violation
    pub fn audit(&mut self) -> KernelResult<()> {
        self.guard()?;
        if self.frames.free_frames() != self.buddy.free_frames() {
            let fault = KernelError::ConsistencyFault(format!(
                "bitmap reports {} free frames, buddy reports {}",
                self.frames.free_frames(),
                self.buddy.free_frames()
            ));
            return self.latch(Err(fault));
        }

        let stale = self.spaces.values().find_map(|space| {
            space
                .page_table()
                .iter()
                .find(|(_, e)| self.frames.is_free(e.frame()))
                .map(|(vpn, e)| (space.pid(), vpn, e.frame()))
        });
        if let Some((pid, vpn, frame)) = stale {
            let fault = KernelError::ConsistencyFault(format!(
                "pid {} page {:#x} maps free frame {}",
                pid, vpn, frame
            ));
            return self.latch(Err(fault));
        }
        Ok(())
    }

    // ========== Introspection ==========

    /// Memory usage of one process
    pub fn process_memory(&self, pid: Pid) -> KernelResult<ProcessMemory> {
        let space = self.spaces.get(&pid).ok_or(KernelError::InvalidPid(pid))?;
        Ok(ProcessMemory {
            pid,
            regions: space.regions().cloned().collect(),
            mapped_bytes: space.mapped_bytes(),
            resident_pages: space.page_table().len(),
            root_frame: space.root_frame(),
        })
    }

    /// Regions of `pid`, empty if it has no address space
    pub fn regions(&self, pid: Pid) -> Vec<VirtualRegion> {
        self.spaces
            .get(&pid)
            .map(|s| s.regions().cloned().collect())
            .unwrap_or_default()
    }

    /// System-wide statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            page_size: self.config.page_size,
            total_frames: self.frames.total_frames(),
            free_frames: self.frames.free_frames(),
            used_frames: self.frames.used_frames(),
            address_spaces: self.spaces.len(),
            buddy_free_blocks: self.buddy.free_counts().to_vec(),
            largest_free_order: self.buddy.largest_free_order(),
            fragmentation: self.buddy.fragmentation(),
            slab_caches: self.slab.stats(),
            page_faults: self.page_faults,
            halted: self.halted.is_some(),
        }
    }

    /// Buddy allocator, for inspection
    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    /// Frame bitmap, for inspection
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Slab allocator, for inspection
    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }

    /// Check if a consistency fault halted the manager
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Latch a consistency fault without corrupting anything
    #[cfg(test)]
    pub(crate) fn halt(&mut self, reason: &str) {
        let _ = self.latch::<()>(Err(KernelError::ConsistencyFault(reason.into())));
    }

    // Helper functions

    fn pages(&mut self) -> PhysicalPages<'_> {
        PhysicalPages {
            frames: &mut self.frames,
            buddy: &mut self.buddy,
        }
    }

    fn guard(&self) -> KernelResult<()> {
        match &self.halted {
            Some(reason) => Err(KernelError::ConsistencyFault(reason.clone())),
            None => Ok(()),
        }
    }

    /// Halt on a consistency fault; pass every other result through
    fn latch<T>(&mut self, result: KernelResult<T>) -> KernelResult<T> {
        if let Err(KernelError::ConsistencyFault(reason)) = &result {
            if self.halted.is_none() {
                error!("Memory manager halted: {}", reason);
                self.halted = Some(reason.clone());
            }
        }
        result
    }

    /// Release used frames as maximal aligned runs
    fn release_frames(&mut self, mut frames: Vec<FrameNumber>) -> KernelResult<()> {
        frames.sort_unstable();
        frames.dedup();

        let mut i = 0;
        while i < frames.len() {
            let start = frames[i];
            let mut len = 1;
            while i + len < frames.len() && frames[i + len] == start + len {
                len += 1;
            }
            for frame in start..start + len {
                self.frames.release(frame)?;
            }
            self.buddy.free_range(start, len)?;
            i += len;
        }
        Ok(())
    }
}
