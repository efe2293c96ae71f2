//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Process control blocks and the process table
//! - CPU scheduling policies
//! - POSIX-style signals
//! - Process manager tying them to the clock

pub mod manager;
pub mod process;
pub mod scheduler;
pub mod signal;

pub use manager::{ProcessManager, ProcessStats, SweepReport};
pub use process::{Pcb, ProcessState, ProcessTable};
pub use scheduler::{Scheduler, TickOutcome};
pub use signal::{Disposition, Signal, SignalSet};
