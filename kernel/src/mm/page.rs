//! Page Table Management
//!
//! Single-level simulated page table: virtual page number to entry. An entry
//! packs the frame number above bit 12 and the flag bits below it.

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;

use super::FrameNumber;
use crate::{KernelError, KernelResult};

/// Bits reserved for flags below the frame number
const FLAG_BITS: u32 = 12;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct PageFlags: u64 {
        /// Page is present in memory
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Page has been accessed
        const ACCESSED = 1 << 5;
        /// Page has been written to
        const DIRTY = 1 << 6;
        /// Page may be executed
        const EXECUTABLE = 1 << 9;
    }
}

impl PageFlags {
    /// User data flags
    pub const USER_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// User read-only flags
    pub const USER_RODATA: Self = Self::PRESENT.union(Self::USER);
}

/// Page table entry
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create entry with frame and flags
    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        Self(((frame as u64) << FLAG_BITS) | (flags.bits() & FLAG_MASK))
    }

    /// Get flags
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    /// Get frame number
    pub fn frame(&self) -> FrameNumber {
        (self.0 >> FLAG_BITS) as FrameNumber
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Check if entry is unused
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Replace flags, keeping the frame
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & !FLAG_MASK) | (flags.bits() & FLAG_MASK);
    }

    /// Add flags
    pub fn insert_flags(&mut self, flags: PageFlags) {
        self.set_flags(self.flags() | flags);
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Page table for one address space
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<u64, PageTableEntry>,
    /// Frame -> virtual page number, for ownership checks
    reverse: HashMap<FrameNumber, u64>,
}

impl PageTable {
    /// Create empty page table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a mapping for a virtual page
    pub fn map(&mut self, vpn: u64, frame: FrameNumber, flags: PageFlags) -> KernelResult<()> {
        if self.entries.contains_key(&vpn) {
            return Err(KernelError::InvalidArgument(format!("page {:#x} already mapped", vpn)));
        }
        if let Some(other) = self.reverse.get(&frame) {
            return Err(KernelError::ConsistencyFault(format!(
                "frame {} already mapped at page {:#x}",
                frame, other
            )));
        }
        self.entries.insert(vpn, PageTableEntry::new(frame, flags | PageFlags::PRESENT));
        self.reverse.insert(frame, vpn);
        Ok(())
    }

    /// Remove the mapping for a virtual page
    pub fn unmap(&mut self, vpn: u64) -> Option<PageTableEntry> {
        let entry = self.entries.remove(&vpn)?;
        self.reverse.remove(&entry.frame());
        Some(entry)
    }

    /// Get entry for a virtual page
    pub fn entry(&self, vpn: u64) -> Option<&PageTableEntry> {
        self.entries.get(&vpn)
    }

    /// Get mutable entry for a virtual page
    pub fn entry_mut(&mut self, vpn: u64) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(&vpn)
    }

    /// Virtual page mapping a frame
    pub fn page_of(&self, frame: FrameNumber) -> Option<u64> {
        self.reverse.get(&frame).copied()
    }

    /// Iterate over mappings in virtual page order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &PageTableEntry)> {
        self.entries.iter().map(|(&vpn, e)| (vpn, e))
    }

    /// Mappings within `first..first + count` pages
    pub fn range(&self, first: u64, count: u64) -> impl Iterator<Item = (u64, &PageTableEntry)> {
        self.entries.range(first..first + count).map(|(&vpn, e)| (vpn, e))
    }

    /// Number of mapped pages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every mapping, returning the frames that were mapped
    pub fn clear(&mut self) -> Vec<FrameNumber> {
        self.reverse.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| e.frame())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packing() {
        let entry = PageTableEntry::new(0x1234, PageFlags::USER_DATA);
        assert_eq!(entry.frame(), 0x1234);
        assert_eq!(entry.flags(), PageFlags::USER_DATA);
        assert!(entry.is_present());
        assert!(PageTableEntry::empty().is_unused());
    }

    #[test]
    fn test_entry_flags_update() {
        let mut entry = PageTableEntry::new(7, PageFlags::USER_RODATA);
        entry.insert_flags(PageFlags::ACCESSED | PageFlags::DIRTY);
        assert_eq!(entry.frame(), 7);
        assert!(entry.flags().contains(PageFlags::DIRTY));

        entry.set_flags(PageFlags::PRESENT);
        assert_eq!(entry.flags(), PageFlags::PRESENT);
        assert_eq!(entry.frame(), 7);
    }

    #[test]
    fn test_map_unmap() {
        let mut table = PageTable::new();
        table.map(0x100, 5, PageFlags::USER_DATA).unwrap();
        assert_eq!(table.page_of(5), Some(0x100));
        assert_eq!(table.entry(0x100).map(|e| e.frame()), Some(5));

        assert!(table.map(0x100, 6, PageFlags::USER_DATA).is_err());
        assert!(table.map(0x101, 5, PageFlags::USER_DATA).unwrap_err().is_fatal());

        let entry = table.unmap(0x100).unwrap();
        assert_eq!(entry.frame(), 5);
        assert_eq!(table.page_of(5), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_returns_frames() {
        let mut table = PageTable::new();
        table.map(1, 10, PageFlags::USER_DATA).unwrap();
        table.map(2, 11, PageFlags::USER_DATA).unwrap();
        assert_eq!(table.range(0, 2).count(), 1);
        assert_eq!(table.clear(), vec![10, 11]);
        assert_eq!(table.len(), 0);
    }
}
