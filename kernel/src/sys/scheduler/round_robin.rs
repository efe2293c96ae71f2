//! Round Robin

use std::collections::VecDeque;

use tracing::trace;

use super::{Scheduler, Slice, TickOutcome};
use crate::Pid;

/// Single FIFO queue with a fixed quantum
pub struct RoundRobin {
    quantum: u64,
    queue: VecDeque<Pid>,
    current: Option<Slice>,
}

impl RoundRobin {
    /// Create a round-robin scheduler
    pub fn new(quantum: u64) -> Self {
        Self {
            quantum: quantum.max(1),
            queue: VecDeque::new(),
            current: None,
        }
    }
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn enqueue(&mut self, pid: Pid, _priority: u8) {
        if !self.queue.contains(&pid) {
            self.queue.push_back(pid);
        }
    }

    fn select_next(&mut self) -> Option<Pid> {
        let pid = self.queue.pop_front()?;
        self.current = Some(Slice {
            pid,
            remaining: self.quantum,
        });
        trace!("rr: dispatch {} ({} queued)", pid, self.queue.len());
        Some(pid)
    }

    fn on_tick(&mut self, running: Option<Pid>) -> TickOutcome {
        Slice::tick(&mut self.current, running)
    }

    fn preempted(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        self.queue.push_back(pid);
    }

    fn yielded(&mut self, pid: Pid) {
        self.preempted(pid);
    }

    fn blocked(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
    }

    fn remove(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        self.queue.retain(|&p| p != pid);
    }

    fn remaining_quantum(&self, pid: Pid) -> Option<u64> {
        Slice::remaining(&self.current, pid)
    }

    fn ready_len(&self) -> usize {
        self.queue.len()
    }

    fn queue_lengths(&self) -> Vec<usize> {
        vec![self.queue.len()]
    }
}
