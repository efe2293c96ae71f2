//! Scheduler
//!
//! One [`Scheduler`] trait, three interchangeable policies picked once at
//! boot:
//! - [`RoundRobin`]: one FIFO, fixed quantum
//! - [`PriorityScheduler`]: FIFO per level, aging against starvation
//! - [`Mlfq`]: multi-level feedback queue with demotion and periodic boost
//!
//! # Protocol
//!
//! The process manager owns process state; a scheduler only sees pids.
//!
//! 1. `enqueue` when a process becomes READY (new or woken)
//! 2. `select_next` pops the next pid and starts its quantum
//! 3. `on_tick` once per tick; `Preempt` means the quantum is spent
//! 4. The running pid then leaves the CPU through exactly one of
//!    `preempted`, `yielded`, `blocked` or `remove`
//!
//! Every policy is deterministic for a given call sequence.

mod mlfq;
mod priority;
mod round_robin;

pub use mlfq::Mlfq;
pub use priority::PriorityScheduler;
pub use round_robin::RoundRobin;

use crate::config::{SchedulerAlgorithm, SchedulerConfig};
use crate::Pid;

/// Result of a tick for the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Quantum not yet spent
    Continue,
    /// Quantum spent; take the process off the CPU
    Preempt,
}

/// CPU scheduling policy
pub trait Scheduler: Send {
    /// Policy name
    fn name(&self) -> &'static str;

    /// Queue a READY process
    fn enqueue(&mut self, pid: Pid, priority: u8);

    /// Pop the next process to run and start its quantum
    fn select_next(&mut self) -> Option<Pid>;

    /// Account one tick; `running` is `None` when the CPU is idle
    fn on_tick(&mut self, running: Option<Pid>) -> TickOutcome;

    /// Running process lost the CPU at quantum expiry
    fn preempted(&mut self, pid: Pid);

    /// Running process gave the CPU up but stays READY
    fn yielded(&mut self, pid: Pid);

    /// Running process blocked; it comes back through `enqueue`
    fn blocked(&mut self, pid: Pid);

    /// Forget a process entirely (terminated or stopped)
    fn remove(&mut self, pid: Pid);

    /// Ticks left in the running process's quantum
    fn remaining_quantum(&self, pid: Pid) -> Option<u64>;

    /// Number of queued processes
    fn ready_len(&self) -> usize;

    /// Queue lengths, most urgent level first
    fn queue_lengths(&self) -> Vec<usize>;
}

/// Build the policy named in the configuration
pub fn build(config: &SchedulerConfig) -> Box<dyn Scheduler> {
    match config.algorithm {
        SchedulerAlgorithm::RoundRobin => Box::new(RoundRobin::new(config.quantum)),
        SchedulerAlgorithm::Priority => {
            Box::new(PriorityScheduler::new(config.quantum, config.priority_levels))
        }
        SchedulerAlgorithm::Mlfq => Box::new(Mlfq::new(
            config.quantum,
            config.num_queues,
            config.boost_interval,
        )),
    }
}

/// Quantum bookkeeping for the process on the CPU
#[derive(Debug, Clone, Copy)]
struct Slice {
    pid: Pid,
    remaining: u64,
}

impl Slice {
    /// Burn one tick of the slice if `running` owns it
    fn tick(current: &mut Option<Slice>, running: Option<Pid>) -> TickOutcome {
        match (current.as_mut(), running) {
            (Some(slice), Some(pid)) if slice.pid == pid => {
                slice.remaining = slice.remaining.saturating_sub(1);
                if slice.remaining == 0 {
                    TickOutcome::Preempt
                } else {
                    TickOutcome::Continue
                }
            }
            _ => TickOutcome::Continue,
        }
    }

    /// Clear the slice if it belongs to `pid`
    fn release(current: &mut Option<Slice>, pid: Pid) {
        if current.map_or(false, |s| s.pid == pid) {
            *current = None;
        }
    }

    fn remaining(current: &Option<Slice>, pid: Pid) -> Option<u64> {
        current.filter(|s| s.pid == pid).map(|s| s.remaining)
    }
}
