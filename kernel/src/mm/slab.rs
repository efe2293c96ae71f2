//! Slab Allocator
//!
//! Fixed-size object caches for sub-page kernel allocations. Each cache
//! serves one size class; its slabs are `2^slab_order` pages taken from a
//! [`PageSource`] (the buddy allocator in practice) and split into equal
//! objects. A handle is the object's physical address.
//!
//! Fully free slabs are not returned immediately: a slab must stay empty for
//! one whole sweep cycle before [`SlabAllocator::reclaim`] gives its pages
//! back.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::{FrameNumber, PhysAddr};
use crate::{KernelError, KernelResult};

/// Supplier of page blocks for slabs
pub trait PageSource {
    /// Allocate a block of `2^order` pages
    fn alloc_pages(&mut self, order: u8) -> KernelResult<FrameNumber>;

    /// Return a block obtained from [`PageSource::alloc_pages`]
    fn free_pages(&mut self, block: FrameNumber, order: u8) -> KernelResult<()>;
}

/// Handle to a slab-allocated kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelObject {
    /// Object address
    pub addr: PhysAddr,
    /// Size class the object was served from
    pub size: usize,
}

/// One slab: a page block split into equal objects
struct Slab {
    base: u64,
    block: FrameNumber,
    object_size: usize,
    /// Free object indices, popped from the end
    free_stack: Vec<u32>,
    /// Per-object free flag
    free_map: Vec<bool>,
    in_use: usize,
    /// Sweep epoch at which the slab became fully free
    empty_since: Option<u64>,
}

impl Slab {
    fn new(base: u64, block: FrameNumber, object_size: usize, capacity: usize, epoch: u64) -> Self {
        Self {
            base,
            block,
            object_size,
            free_stack: (0..capacity as u32).rev().collect(),
            free_map: vec![true; capacity],
            in_use: 0,
            empty_since: Some(epoch),
        }
    }

    fn alloc_object(&mut self) -> Option<u64> {
        let idx = self.free_stack.pop()? as usize;
        self.free_map[idx] = false;
        self.in_use += 1;
        self.empty_since = None;
        Some(self.base + (idx * self.object_size) as u64)
    }

    fn capacity(&self) -> usize {
        self.free_map.len()
    }

    fn is_full(&self) -> bool {
        self.free_stack.is_empty()
    }
}

/// Cache serving one object size
struct SlabCache {
    object_size: usize,
    /// Slabs keyed by base address
    slabs: BTreeMap<u64, Slab>,
    allocations: u64,
    frees: u64,
}

/// Per-cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlabCacheStats {
    /// Object size served
    pub object_size: usize,
    /// Slabs currently held
    pub slabs: usize,
    /// Objects handed out and not yet freed
    pub objects_in_use: usize,
    /// Total objects across held slabs
    pub capacity: usize,
    /// Lifetime allocations
    pub allocations: u64,
    /// Lifetime frees
    pub frees: u64,
}

/// Slab allocator over a fixed set of size classes
pub struct SlabAllocator {
    caches: Vec<SlabCache>,
    /// Slab base address -> owning cache index
    owners: BTreeMap<u64, usize>,
    page_size: u64,
    slab_order: u8,
    sweep_epoch: u64,
}

impl SlabAllocator {
    /// Create an allocator with one cache per size class
    ///
    /// `size_classes` must be strictly ascending.
    pub fn new(size_classes: &[usize], page_size: u64, slab_order: u8) -> Self {
        let caches = size_classes
            .iter()
            .map(|&object_size| SlabCache {
                object_size,
                slabs: BTreeMap::new(),
                allocations: 0,
                frees: 0,
            })
            .collect();

        Self {
            caches,
            owners: BTreeMap::new(),
            page_size,
            slab_order,
            sweep_epoch: 0,
        }
    }

    /// Size class serving `size`
    pub fn size_class(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        self.caches.iter().map(|c| c.object_size).find(|&s| s >= size)
    }

    /// Allocate an object of at least `size` bytes
    pub fn allocate(&mut self, size: usize, pages: &mut dyn PageSource) -> KernelResult<KernelObject> {
        let idx = self
            .caches
            .iter()
            .position(|c| c.object_size >= size)
            .filter(|_| size > 0)
            .ok_or(KernelError::InvalidAllocationSize(size))?;

        let slab_bytes = self.slab_bytes();
        let epoch = self.sweep_epoch;
        let cache = &mut self.caches[idx];

        if !cache.slabs.values().any(|s| !s.is_full()) {
            let block = pages.alloc_pages(self.slab_order)?;
            let base = block as u64 * self.page_size;
            let capacity = (slab_bytes / cache.object_size as u64) as usize;
            cache.slabs.insert(base, Slab::new(base, block, cache.object_size, capacity, epoch));
            self.owners.insert(base, idx);
            debug!(
                "slab: new {}-byte slab at {:#x} ({} objects)",
                cache.object_size, base, capacity
            );
        }

        let addr = cache
            .slabs
            .values_mut()
            .find(|s| !s.is_full())
            .and_then(Slab::alloc_object)
            .ok_or_else(|| KernelError::ConsistencyFault("slab refill produced no free object".into()))?;

        cache.allocations += 1;
        trace!("slab: alloc {} bytes -> {:#x}", size, addr);
        Ok(KernelObject {
            addr: PhysAddr::new(addr),
            size: cache.object_size,
        })
    }

    /// Return an object to its origin slab
    pub fn free(&mut self, addr: PhysAddr) -> KernelResult<()> {
        let addr = addr.as_u64();
        let slab_bytes = self.slab_bytes();

        let (&base, &idx) = self
            .owners
            .range(..=addr)
            .next_back()
            .filter(|(base, _)| addr < **base + slab_bytes)
            .ok_or(KernelError::InvalidAddress(addr))?;

        let epoch = self.sweep_epoch;
        let cache = &mut self.caches[idx];
        let slab = cache
            .slabs
            .get_mut(&base)
            .ok_or_else(|| KernelError::ConsistencyFault(format!("slab {:#x} missing from its cache", base)))?;

        let offset = (addr - base) as usize;
        let obj = offset / slab.object_size;
        if offset % slab.object_size != 0 || obj >= slab.capacity() {
            return Err(KernelError::InvalidAddress(addr));
        }
        if slab.free_map[obj] {
            return Err(KernelError::DoubleFree(addr));
        }

        slab.free_map[obj] = true;
        slab.free_stack.push(obj as u32);
        slab.in_use -= 1;
        if slab.in_use == 0 {
            slab.empty_since = Some(epoch);
        }
        cache.frees += 1;
        trace!("slab: free {:#x}", addr);
        Ok(())
    }

    /// Release slabs that stayed fully free for a whole sweep cycle
    ///
    /// Returns the number of slabs given back.
    pub fn reclaim(&mut self, pages: &mut dyn PageSource) -> KernelResult<usize> {
        let epoch = self.sweep_epoch;
        let mut released = 0;

        for cache in &mut self.caches {
            let stale: Vec<u64> = cache
                .slabs
                .values()
                .filter(|s| s.empty_since.map_or(false, |since| since < epoch))
                .map(|s| s.base)
                .collect();

            for base in stale {
                if let Some(slab) = cache.slabs.remove(&base) {
                    self.owners.remove(&base);
                    pages.free_pages(slab.block, self.slab_order)?;
                    released += 1;
                }
            }
        }

        self.sweep_epoch += 1;
        if released > 0 {
            debug!("slab: reclaimed {} empty slabs", released);
        }
        Ok(released)
    }

    /// Objects currently handed out across all caches
    pub fn outstanding(&self) -> usize {
        self.caches
            .iter()
            .flat_map(|c| c.slabs.values())
            .map(|s| s.in_use)
            .sum()
    }

    /// Number of slabs held across all caches
    pub fn slab_count(&self) -> usize {
        self.owners.len()
    }

    /// Statistics per cache, smallest class first
    pub fn stats(&self) -> Vec<SlabCacheStats> {
        self.caches
            .iter()
            .map(|c| SlabCacheStats {
                object_size: c.object_size,
                slabs: c.slabs.len(),
                objects_in_use: c.slabs.values().map(|s| s.in_use).sum(),
                capacity: c.slabs.values().map(Slab::capacity).sum(),
                allocations: c.allocations,
                frees: c.frees,
            })
            .collect()
    }

    fn slab_bytes(&self) -> u64 {
        self.page_size << self.slab_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::BuddyAllocator;

    impl PageSource for BuddyAllocator {
        fn alloc_pages(&mut self, order: u8) -> KernelResult<FrameNumber> {
            self.alloc(order)
        }

        fn free_pages(&mut self, block: FrameNumber, order: u8) -> KernelResult<()> {
            self.free(block, order)
        }
    }

    fn setup() -> (SlabAllocator, BuddyAllocator) {
        (
            SlabAllocator::new(&[32, 64, 128, 256], 4096, 0),
            BuddyAllocator::new(64),
        )
    }

    #[test]
    fn test_size_class_rounding() {
        let (slab, _) = setup();
        assert_eq!(slab.size_class(1), Some(32));
        assert_eq!(slab.size_class(33), Some(64));
        assert_eq!(slab.size_class(256), Some(256));
        assert_eq!(slab.size_class(257), None);
        assert_eq!(slab.size_class(0), None);
    }

    #[test]
    fn test_invalid_sizes() {
        let (mut slab, mut buddy) = setup();
        assert_eq!(slab.allocate(0, &mut buddy), Err(KernelError::InvalidAllocationSize(0)));
        assert_eq!(slab.allocate(4096, &mut buddy), Err(KernelError::InvalidAllocationSize(4096)));
    }

    #[test]
    fn test_allocate_and_free() {
        let (mut slab, mut buddy) = setup();
        let a = slab.allocate(40, &mut buddy).unwrap();
        let b = slab.allocate(64, &mut buddy).unwrap();
        assert_eq!(a.size, 64);
        assert_eq!(b.addr.as_u64(), a.addr.as_u64() + 64);
        assert_eq!(slab.outstanding(), 2);
        assert_eq!(slab.slab_count(), 1);

        slab.free(a.addr).unwrap();
        slab.free(b.addr).unwrap();
        assert_eq!(slab.outstanding(), 0);
    }

    #[test]
    fn test_freed_object_reused_first() {
        let (mut slab, mut buddy) = setup();
        let _a = slab.allocate(32, &mut buddy).unwrap();
        let b = slab.allocate(32, &mut buddy).unwrap();
        slab.free(b.addr).unwrap();
        assert_eq!(slab.allocate(32, &mut buddy).unwrap().addr, b.addr);
    }

    #[test]
    fn test_double_free_and_bad_address() {
        let (mut slab, mut buddy) = setup();
        let a = slab.allocate(128, &mut buddy).unwrap();
        slab.free(a.addr).unwrap();
        assert_eq!(slab.free(a.addr), Err(KernelError::DoubleFree(a.addr.as_u64())));

        let misaligned = PhysAddr::new(a.addr.as_u64() + 3);
        assert_eq!(slab.free(misaligned), Err(KernelError::InvalidAddress(misaligned.as_u64())));
        assert!(matches!(
            slab.free(PhysAddr::new(60 * 4096)),
            Err(KernelError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_slab_grows_when_full() {
        let (mut slab, mut buddy) = setup();
        // 16 objects of 256 bytes fit in one page
        let objects: Vec<_> = (0..17).map(|_| slab.allocate(256, &mut buddy).unwrap()).collect();
        assert_eq!(slab.slab_count(), 2);
        assert_eq!(slab.stats()[3].capacity, 32);
        for obj in objects {
            slab.free(obj.addr).unwrap();
        }
        assert_eq!(slab.outstanding(), 0);
    }

    #[test]
    fn test_reclaim_waits_one_sweep_cycle() {
        let (mut slab, mut buddy) = setup();
        let free_before = buddy.free_frames();
        let obj = slab.allocate(32, &mut buddy).unwrap();
        slab.free(obj.addr).unwrap();

        // Became empty during this cycle: kept
        assert_eq!(slab.reclaim(&mut buddy).unwrap(), 0);
        assert_eq!(slab.slab_count(), 1);

        // Still empty after a full cycle: released
        assert_eq!(slab.reclaim(&mut buddy).unwrap(), 1);
        assert_eq!(slab.slab_count(), 0);
        assert_eq!(buddy.free_frames(), free_before);
    }

    #[test]
    fn test_reuse_cancels_reclaim() {
        let (mut slab, mut buddy) = setup();
        let obj = slab.allocate(32, &mut buddy).unwrap();
        slab.free(obj.addr).unwrap();
        slab.reclaim(&mut buddy).unwrap();

        let again = slab.allocate(32, &mut buddy).unwrap();
        assert_eq!(slab.reclaim(&mut buddy).unwrap(), 0);
        slab.free(again.addr).unwrap();
        assert_eq!(slab.slab_count(), 1);
    }

    #[test]
    fn test_stats() {
        let (mut slab, mut buddy) = setup();
        let obj = slab.allocate(100, &mut buddy).unwrap();
        slab.free(obj.addr).unwrap();
        let stats = &slab.stats()[2];
        assert_eq!(stats.object_size, 128);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.objects_in_use, 0);
    }
}
