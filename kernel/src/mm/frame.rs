//! Physical Frame Allocator
//!
//! Bitmap ledger of physical frames. The buddy allocator decides *which*
//! frames to hand out; this bitmap records which frames are in use and is the
//! reference every cross-structure check is made against.

use tracing::warn;

use super::{FrameNumber, PhysAddr};
use crate::{KernelError, KernelResult};

/// Physical frame ledger using a bitmap
pub struct FrameAllocator {
    /// Bitmap of frame usage (1 = free, 0 = used)
    bitmap: Vec<u64>,
    /// Frame size in bytes
    page_size: u64,
    /// Total number of frames
    total_frames: usize,
    /// Number of free frames
    free_count: usize,
}

impl FrameAllocator {
    /// Create a ledger with every frame free
    pub fn new(total_frames: usize, page_size: u64) -> Self {
        let bitmap_size = (total_frames + 63) / 64;
        let mut bitmap = vec![u64::MAX; bitmap_size];

        // Bits past the last frame stay "used" so they are never reported free
        let tail = total_frames % 64;
        if tail != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }

        Self {
            bitmap,
            page_size,
            total_frames,
            free_count: total_frames,
        }
    }

    /// Check if frame is free
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        if frame >= self.total_frames {
            return false;
        }
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    /// Mark a frame as used
    ///
    /// Claiming a frame that is already used means two owners would share it,
    /// which is reported as a consistency fault.
    pub fn claim(&mut self, frame: FrameNumber) -> KernelResult<()> {
        self.check_range(frame)?;
        let (idx, bit) = (frame / 64, frame % 64);

        if self.bitmap[idx] & (1 << bit) == 0 {
            return Err(KernelError::ConsistencyFault(format!(
                "frame {} handed out while already in use",
                frame
            )));
        }

        self.bitmap[idx] &= !(1 << bit);
        self.free_count -= 1;
        Ok(())
    }

    /// Mark a frame as free
    pub fn release(&mut self, frame: FrameNumber) -> KernelResult<()> {
        self.check_range(frame)?;
        let (idx, bit) = (frame / 64, frame % 64);

        if self.bitmap[idx] & (1 << bit) != 0 {
            let addr = self.address_of(frame);
            warn!("Double free of frame at {:#x}", addr.as_u64());
            return Err(KernelError::DoubleFree(addr.as_u64()));
        }

        self.bitmap[idx] |= 1 << bit;
        self.free_count += 1;
        Ok(())
    }

    /// Claim `count` frames starting at `start`, all or nothing
    pub fn claim_range(&mut self, start: FrameNumber, count: usize) -> KernelResult<()> {
        for frame in start..start + count {
            if let Err(e) = self.claim(frame) {
                // Undo the frames already claimed by this call
                for claimed in start..frame {
                    self.bitmap[claimed / 64] |= 1 << (claimed % 64);
                    self.free_count += 1;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Physical address of a frame
    pub fn address_of(&self, frame: FrameNumber) -> PhysAddr {
        PhysAddr::new(frame as u64 * self.page_size)
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Get number of used frames
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count
    }

    /// Get total frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    fn check_range(&self, frame: FrameNumber) -> KernelResult<()> {
        if frame >= self.total_frames {
            return Err(KernelError::InvalidAddress(frame as u64 * self.page_size));
        }
        Ok(())
    }
}
