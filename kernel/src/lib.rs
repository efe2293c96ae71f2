//! simkernel: Simulated Operating-System Resource Core
//!
//! A hosted model of the parts of a kernel that manage processes and memory:
//! - Process lifecycle with POSIX-style signals
//! - Pluggable CPU schedulers (round robin, priority, MLFQ)
//! - Physical memory through a frame bitmap and a buddy allocator
//! - Slab caches for kernel objects
//! - Per-process address spaces with demand paging
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Kernel                             │
//! │                 (one coordinating lock)                     │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐ │
//! │  │     ProcessManager       │  │      MemoryManager       │ │
//! │  │  ┌────────┐ ┌─────────┐  │  │  ┌────────┐ ┌─────────┐  │ │
//! │  │  │ Process│ │Scheduler│  │  │  │ Buddy  │ │  Slab   │  │ │
//! │  │  │ Table  │ │ RR/Prio/│  │──│  │        │ │ caches  │  │ │
//! │  │  │        │ │  MLFQ   │  │  │  └───┬────┘ └─────────┘  │ │
//! │  │  └────────┘ └─────────┘  │  │  ┌───▼────┐ ┌─────────┐  │ │
//! │  │  ┌────────┐ ┌─────────┐  │  │  │ Frame  │ │ Address │  │ │
//! │  │  │Signals │ │  Clock  │  │  │  │ bitmap │ │ spaces  │  │ │
//! │  │  └────────┘ └─────────┘  │  │  └────────┘ └─────────┘  │ │
//! │  └──────────────────────────┘  └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Time is simulated: one call to [`Kernel::tick`] is one clock tick.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod kernel;
pub mod mm;
pub mod sys;

pub use config::{ConfigError, KernelConfig, SchedulerAlgorithm};
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelStats};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "simkernel";

/// Process identifier
pub type Pid = u32;

/// Pid of the kernel itself, used as a signal sender
pub const KERNEL_PID: Pid = 0;

/// Pid of init, parent of every orphan
pub const INIT_PID: Pid = 1;

/// Superuser id
pub const ROOT_UID: u32 = 0;
