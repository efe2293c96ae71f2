//! Buddy Allocator
//!
//! Power-of-two block allocator over physical frame numbers. An order-k block
//! spans 2^k frames and starts on a 2^k boundary; its buddy is found by
//! flipping bit k of the start frame.
//!
//! Free lists are intrusive doubly linked lists threaded through per-frame
//! link arrays, so push, pop and unlinking a specific buddy are all O(1).
//! Lists are LIFO: a block freed and then re-requested at the same order is
//! handed straight back.

use tracing::trace;

use super::FrameNumber;
use crate::{KernelError, KernelResult};

/// Order of the smallest block holding `count` frames
///
/// Counts past the largest power of two map to `usize::BITS`, an order no
/// allocator can serve.
pub fn order_for(count: usize) -> u8 {
    count
        .max(1)
        .checked_next_power_of_two()
        .map_or(usize::BITS as u8, |n| n.trailing_zeros() as u8)
}

/// Split `start..start + count` into maximal aligned blocks
pub fn aligned_blocks(start: FrameNumber, count: usize, max_order: u8) -> Vec<(FrameNumber, u8)> {
    let mut blocks = Vec::new();
    let mut frame = start;
    let end = start + count;

    while frame < end {
        let align = if frame == 0 { max_order as u32 } else { frame.trailing_zeros() };
        let fit = usize::BITS - 1 - (end - frame).leading_zeros();
        let order = align.min(fit).min(max_order as u32) as u8;
        blocks.push((frame, order));
        frame += 1 << order;
    }

    blocks
}

/// Buddy allocator over `total_frames` frames
pub struct BuddyAllocator {
    total_frames: usize,
    max_order: u8,
    /// Head of each order's free list
    heads: Vec<Option<FrameNumber>>,
    /// Next link, valid for free block heads
    next: Vec<Option<FrameNumber>>,
    /// Previous link, valid for free block heads
    prev: Vec<Option<FrameNumber>>,
    /// Order of the free block starting at each frame
    free_order: Vec<Option<u8>>,
    /// Number of blocks per order list
    counts: Vec<usize>,
    free_frames: usize,
}

impl BuddyAllocator {
    /// Create an allocator with every frame free
    ///
    /// `max_order` is `floor(log2(total_frames))`. When the frame count is not
    /// a power of two the remainder is carved into smaller aligned blocks.
    pub fn new(total_frames: usize) -> Self {
        let max_order = if total_frames == 0 {
            0
        } else {
            (usize::BITS - 1 - total_frames.leading_zeros()) as u8
        };
        let orders = max_order as usize + 1;

        let mut buddy = Self {
            total_frames,
            max_order,
            heads: vec![None; orders],
            next: vec![None; total_frames],
            prev: vec![None; total_frames],
            free_order: vec![None; total_frames],
            counts: vec![0; orders],
            free_frames: 0,
        };

        // Push high blocks first so the lowest address sits at each list head
        for (block, order) in aligned_blocks(0, total_frames, max_order).into_iter().rev() {
            buddy.push(block, order);
        }

        buddy
    }

    /// Allocate a block of 2^order frames
    pub fn alloc(&mut self, order: u8) -> KernelResult<FrameNumber> {
        if order > self.max_order || self.total_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }

        if let Some(block) = self.pop(order) {
            trace!("buddy: alloc order {} -> frame {}", order, block);
            return Ok(block);
        }

        if order == self.max_order {
            return Err(KernelError::OutOfMemory);
        }

        // Split a larger block; keep the lower half
        let block = self.alloc(order + 1)?;
        self.push(block + (1 << order), order);
        trace!("buddy: split order {} at frame {}", order + 1, block);
        Ok(block)
    }

    /// Return a block of 2^order frames, coalescing with free buddies
    pub fn free(&mut self, block: FrameNumber, order: u8) -> KernelResult<()> {
        self.check_block(block, order)?;

        let mut block = block;
        let mut order = order;
        while order < self.max_order {
            let buddy = block ^ (1 << order);
            if buddy + (1 << order) > self.total_frames || self.free_order[buddy] != Some(order) {
                break;
            }
            self.unlink(buddy, order);
            block = block.min(buddy);
            order += 1;
        }

        trace!("buddy: free -> order {} at frame {}", order, block);
        self.push(block, order);
        Ok(())
    }

    /// Free an arbitrary run of frames as maximal aligned blocks
    pub fn free_range(&mut self, start: FrameNumber, count: usize) -> KernelResult<()> {
        for (block, order) in aligned_blocks(start, count, self.max_order) {
            self.free(block, order)?;
        }
        Ok(())
    }

    /// Allocate exactly `count` contiguous frames
    ///
    /// Takes the smallest covering block and gives the unused tail back.
    pub fn alloc_frames(&mut self, count: usize) -> KernelResult<FrameNumber> {
        if count == 0 {
            return Err(KernelError::InvalidArgument("zero-frame allocation".into()));
        }
        let order = order_for(count);
        let block = self.alloc(order)?;
        let tail = (1usize << order) - count;
        if tail > 0 {
            self.free_range(block + count, tail)?;
        }
        Ok(block)
    }

    /// Check if a free block of exactly this order starts at `block`
    pub fn is_free_block(&self, block: FrameNumber, order: u8) -> bool {
        block < self.total_frames && self.free_order[block] == Some(order)
    }

    /// Free block starts on one order's list, head first
    pub fn free_list(&self, order: u8) -> Vec<FrameNumber> {
        let mut blocks = Vec::new();
        let mut cursor = self.heads.get(order as usize).copied().flatten();
        while let Some(block) = cursor {
            blocks.push(block);
            cursor = self.next[block];
        }
        blocks
    }

    /// Number of free blocks per order
    pub fn free_counts(&self) -> &[usize] {
        &self.counts
    }

    /// Largest order with a free block
    pub fn largest_free_order(&self) -> Option<u8> {
        (0..=self.max_order).rev().find(|&o| self.counts[o as usize] > 0)
    }

    /// External fragmentation: `1 - largest free block / free frames`
    ///
    /// 0.0 when nothing is free or all free frames form one block.
    pub fn fragmentation(&self) -> f64 {
        match self.largest_free_order() {
            Some(order) if self.free_frames > 0 => {
                1.0 - (1usize << order) as f64 / self.free_frames as f64
            }
            _ => 0.0,
        }
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Get total frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Get maximum order
    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    // Helper functions

    fn check_block(&self, block: FrameNumber, order: u8) -> KernelResult<()> {
        if order > self.max_order {
            return Err(KernelError::ConsistencyFault(format!(
                "buddy free of order {} above max order {}",
                order, self.max_order
            )));
        }
        let size = 1usize << order;
        if block % size != 0 || block + size > self.total_frames {
            return Err(KernelError::ConsistencyFault(format!(
                "buddy free of misaligned or out-of-range block {} (order {})",
                block, order
            )));
        }
        let inner_head = (block + 1..block + size).any(|f| self.free_order[f].is_some());
        if self.covering_block(block).is_some() || inner_head {
            return Err(KernelError::ConsistencyFault(format!(
                "buddy free of block {} (order {}) overlapping a free block",
                block, order
            )));
        }
        Ok(())
    }

    fn covering_block(&self, frame: FrameNumber) -> Option<(FrameNumber, u8)> {
        if frame >= self.total_frames {
            return None;
        }
        (0..=self.max_order).find_map(|order| {
            let start = frame & !((1usize << order) - 1);
            (self.free_order[start] == Some(order)).then_some((start, order))
        })
    }

    fn push(&mut self, block: FrameNumber, order: u8) {
        let head = self.heads[order as usize];
        self.next[block] = head;
        self.prev[block] = None;
        if let Some(h) = head {
            self.prev[h] = Some(block);
        }
        self.heads[order as usize] = Some(block);
        self.free_order[block] = Some(order);
        self.counts[order as usize] += 1;
        self.free_frames += 1 << order;
    }

    fn pop(&mut self, order: u8) -> Option<FrameNumber> {
        let block = self.heads[order as usize]?;
        self.unlink(block, order);
        Some(block)
    }

    fn unlink(&mut self, block: FrameNumber, order: u8) {
        let (prev, next) = (self.prev[block], self.next[block]);
        match prev {
            Some(p) => self.next[p] = next,
            None => self.heads[order as usize] = next,
        }
        if let Some(n) = next {
            self.prev[n] = prev;
        }
        self.next[block] = None;
        self.prev[block] = None;
        self.free_order[block] = None;
        self.counts[order as usize] -= 1;
        self.free_frames -= 1 << order;
    }
}
