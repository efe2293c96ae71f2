//! Error types for the kernel resource core
//!
//! Every fallible operation returns [`KernelResult`]. Caller-input and
//! exhaustion errors are recoverable; [`KernelError::ConsistencyFault`] means
//! a cross-structure invariant broke and the memory manager has halted.

use thiserror::Error;

use crate::config::ConfigError;
use crate::sys::process::ProcessState;
use crate::Pid;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    // ========== Process Errors ==========

    /// Live-process limit reached or pid space exhausted
    #[error("Process limit exceeded")]
    ProcessLimitExceeded,

    /// No process with this pid
    #[error("Invalid pid: {0}")]
    InvalidPid(Pid),

    /// Caller may not act on the target
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Parent has no children to wait for
    #[error("Process {0} has no children")]
    NoSuchChild(Pid),

    /// State machine edge not allowed
    #[error("Invalid transition for pid {pid}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Process
        pid: Pid,
        /// Current state
        from: ProcessState,
        /// Requested state
        to: ProcessState,
    },

    /// Operation would block the caller
    #[error("Operation would block")]
    WouldBlock,

    // ========== Virtual Memory Errors ==========

    /// New region intersects an existing one
    #[error("Region {base:#x}+{length:#x} overlaps an existing region")]
    RegionOverlap {
        /// Requested base address
        base: u64,
        /// Requested length in bytes
        length: u64,
    },

    /// Per-process mapping limit reached
    #[error("Memory limit exceeded: {requested} bytes requested, limit {limit}")]
    MemoryLimitExceeded {
        /// Mapped bytes after the request
        requested: u64,
        /// Configured limit
        limit: u64,
    },

    /// Access to an address with no region or no present page
    #[error("Page fault in pid {pid} at {addr:#x}")]
    PageFault {
        /// Faulting process
        pid: Pid,
        /// Faulting virtual address
        addr: u64,
    },

    /// Access not permitted by the region protection
    #[error("Protection fault in pid {pid} at {addr:#x}")]
    ProtectionFault {
        /// Faulting process
        pid: Pid,
        /// Faulting virtual address
        addr: u64,
    },

    // ========== Allocator Errors ==========

    /// No physical block large enough
    #[error("Out of memory")]
    OutOfMemory,

    /// Block or object is already free
    #[error("Double free at {0:#x}")]
    DoubleFree(u64),

    /// Frame is not mapped by the freeing process
    #[error("Frame {frame} is not owned by pid {pid}")]
    NotOwner {
        /// Process attempting the free
        pid: Pid,
        /// Frame number
        frame: u64,
    },

    /// Kernel object size outside the registered size classes
    #[error("Invalid allocation size: {0}")]
    InvalidAllocationSize(usize),

    /// Address does not belong to any allocator-managed object
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    // ========== General Errors ==========

    /// Malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Cross-structure invariant broken; memory manager halted
    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Check if the error halted the memory manager
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::ConsistencyFault(_))
    }

    /// Check if the error reports an exhausted resource rather than bad input
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            KernelError::OutOfMemory
                | KernelError::ProcessLimitExceeded
                | KernelError::MemoryLimitExceeded { .. }
        )
    }
}
