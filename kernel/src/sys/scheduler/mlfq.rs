//! Multi-Level Feedback Queue
//!
//! Level 0 is the most urgent. Level `i` runs with a quantum of
//! `quantum << i`. A process that spends its whole quantum is demoted one
//! level; one that blocks or yields first keeps its level. Every
//! `boost_interval` ticks all known processes return to level 0, including
//! the one on the CPU: if its quantum runs out it is requeued at level 0.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use super::{Scheduler, Slice, TickOutcome};
use crate::Pid;

/// Multi-level feedback queue scheduler
pub struct Mlfq {
    base_quantum: u64,
    boost_interval: u64,
    queues: Vec<VecDeque<Pid>>,
    /// Level of every known process, queued, running or blocked
    levels: HashMap<Pid, usize>,
    current: Option<Slice>,
    /// Process that was on the CPU at the last boost
    boosted: Option<Pid>,
    ticks_since_boost: u64,
    boosts: u64,
}

impl Mlfq {
    /// Create an MLFQ with `num_queues` levels
    pub fn new(base_quantum: u64, num_queues: usize, boost_interval: u64) -> Self {
        Self {
            base_quantum: base_quantum.max(1),
            boost_interval: boost_interval.max(1),
            queues: vec![VecDeque::new(); num_queues.max(1)],
            levels: HashMap::new(),
            current: None,
            boosted: None,
            ticks_since_boost: 0,
            boosts: 0,
        }
    }

    /// Quantum of a level
    pub fn quantum_for_level(&self, level: usize) -> u64 {
        self.base_quantum << level
    }

    /// Current level of a known process
    pub fn level_of(&self, pid: Pid) -> Option<usize> {
        self.levels.get(&pid).copied()
    }

    /// Number of boosts performed
    pub fn boosts(&self) -> u64 {
        self.boosts
    }

    fn bottom(&self) -> usize {
        self.queues.len() - 1
    }

    fn push(&mut self, pid: Pid, level: usize) {
        self.levels.insert(pid, level);
        self.queues[level].push_back(pid);
    }

    /// Move every process to level 0, keeping queue order
    fn boost(&mut self) {
        let mut merged = VecDeque::new();
        for queue in &mut self.queues {
            merged.extend(queue.drain(..));
        }
        self.queues[0] = merged;
        for level in self.levels.values_mut() {
            *level = 0;
        }
        self.boosted = self.current.map(|s| s.pid);
        self.ticks_since_boost = 0;
        self.boosts += 1;
        debug!("mlfq: priority boost #{}", self.boosts);
    }
}

impl Scheduler for Mlfq {
    fn name(&self) -> &'static str {
        "mlfq"
    }

    fn enqueue(&mut self, pid: Pid, _priority: u8) {
        if self.queues.iter().any(|q| q.contains(&pid)) {
            return;
        }
        // New processes start on top; woken ones keep their level
        let level = self.levels.get(&pid).copied().unwrap_or(0);
        self.push(pid, level);
    }

    fn select_next(&mut self) -> Option<Pid> {
        let (level, pid) = self
            .queues
            .iter_mut()
            .enumerate()
            .find_map(|(level, q)| q.pop_front().map(|pid| (level, pid)))?;
        self.boosted = None;
        self.current = Some(Slice {
            pid,
            remaining: self.quantum_for_level(level),
        });
        trace!("mlfq: dispatch {} from level {}", pid, level);
        Some(pid)
    }

    fn on_tick(&mut self, running: Option<Pid>) -> TickOutcome {
        let outcome = Slice::tick(&mut self.current, running);
        self.ticks_since_boost += 1;
        if self.ticks_since_boost >= self.boost_interval {
            self.boost();
        }
        outcome
    }

    fn preempted(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        let level = if self.boosted.take() == Some(pid) {
            0
        } else {
            self.levels.get(&pid).map_or(0, |&l| (l + 1).min(self.bottom()))
        };
        self.push(pid, level);
    }

    fn yielded(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        let level = self.levels.get(&pid).copied().unwrap_or(0);
        self.push(pid, level);
    }

    fn blocked(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
    }

    fn remove(&mut self, pid: Pid) {
        Slice::release(&mut self.current, pid);
        if let Some(level) = self.levels.remove(&pid) {
            self.queues[level].retain(|&p| p != pid);
        }
    }

    fn remaining_quantum(&self, pid: Pid) -> Option<u64> {
        Slice::remaining(&self.current, pid)
    }

    fn ready_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn queue_lengths(&self) -> Vec<usize> {
        self.queues.iter().map(VecDeque::len).collect()
    }
}
