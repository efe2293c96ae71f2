//! Priority scheduling with aging
//!
//! Levels run from 0 (least urgent) to `levels - 1` (most urgent). After
//! every dispatch each process still waiting moves up one level, so a queued
//! process reaches the top within `levels - 1` rounds. A dispatched process
//! drops back to its base level.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use super::{Scheduler, Slice, TickOutcome};
use crate::Pid;

/// One FIFO per priority level
pub struct PriorityScheduler {
    quantum: u64,
    queues: Vec<VecDeque<Pid>>,
    /// Base priority of every known process
    base: HashMap<Pid, u8>,
    current: Option<Slice>,
}

impl PriorityScheduler {
    /// Create a priority scheduler with `levels` levels
    pub fn new(quantum: u64, levels: u8) -> Self {
        Self {
            quantum: quantum.max(1),
            queues: vec![VecDeque::new(); levels.max(1) as usize],
            base: HashMap::new(),
            current: None,
        }
    }

    fn top(&self) -> usize {
        self.queues.len() - 1
    }

    fn push_at_base(&mut self, pid: Pid) {
        let level = self.base.get(&pid).map_or(0, |&b| b as usize).min(self.top());
        self.queues[level].push_back(pid);
    }

    /// Raise every waiting process one level, keeping FIFO order
    fn age(&mut self) {
        for level in (0..self.top()).rev() {
            let moved: Vec<Pid> = self.queues[level].drain(..).collect();
            self.queues[level + 1].extend(moved);
        }
    }

    /// Level a queued process currently sits at
    pub fn effective_priority(&self, pid: Pid) -> Option<usize> {
        self.queues.iter().position(|q| q.contains(&pid))
    }
}

impl Scheduler for PriorityScheduler {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn enqueue(&mut self, pid: Pid, priority: u8) {
        if self.queues.iter().any(|q| q.contains(&pid)) {
            return;
        }
        let level = (priority as usize).min(self.top()) as u8;
        self.base.insert(pid, level);
        self.push_at_base(pid);
    }

    fn select_next(&mut self) -> Option<Pid> {
        let pid = self.queues.iter_mut().rev().find_map(|q| q.pop_front())?;
        self.age();
        self.current = Some(Slice {
            pid,
            remaining: self.quantum,
        });
        trace!("priority: dispatch {} (base {:?})", pid, self.base.get(&pid));
        Some(pid)
    }

    fn on_tick(&mut self, running: Option<Pid>) -> TickOutcome {
        Slice::tick(&mut self.current, running)
    }

    fn preempted(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        self.push_at_base(pid);
    }

    fn yielded(&mut self, pid: Pid) {
        self.preempted(pid);
    }

    fn blocked(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
    }

    fn remove(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        for queue in &mut self.queues {
            queue.retain(|&p| p != pid);
        }
        self.base.remove(&pid);
    }

    fn remaining_quantum(&self, pid: Pid) -> Option<u64> {
        Slice::remaining(&self.current, pid)
    }

    fn ready_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn queue_lengths(&self) -> Vec<usize> {
        self.queues.iter().rev().map(VecDeque::len).collect()
    }
}
