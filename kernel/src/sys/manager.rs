//! Process Manager
//!
//! Composes the process table, the scheduler, signal delivery and the
//! simulated clock. Operations that touch memory take the memory manager as
//! an argument; the kernel holds both behind one lock.
//!
//! # Decision points
//!
//! Pending signals are applied, and the next process dispatched, only when
//! the CPU is free: at the start of [`ProcessManager::schedule`] and at the
//! end of any tick that leaves the CPU idle.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::process::{Pcb, ProcessState, ProcessTable};
use super::scheduler::{self, Scheduler, TickOutcome};
use super::signal::{Disposition, Signal, SignalSet};
use crate::config::{KernelConfig, ProcessConfig};
use crate::mm::MemoryManager;
use crate::{KernelError, KernelResult, Pid, INIT_PID, KERNEL_PID, ROOT_UID};

/// Lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    /// Current tick
    pub clock: u64,
    /// Process on the CPU
    pub current: Option<Pid>,
    /// Scheduling policy
    pub scheduler: String,
    /// Ready queue lengths, most urgent first
    pub queue_lengths: Vec<usize>,
    /// PCBs in the table, zombies included
    pub processes: usize,
    /// Processes counted against the limit
    pub live: usize,
    /// Processes per state
    pub by_state: BTreeMap<String, usize>,
    /// Processes created since boot (init included)
    pub created: u64,
    /// Processes terminated
    pub terminated: u64,
    /// Zombies reaped by `wait` or the sweep
    pub reaped: u64,
    /// Dispatches
    pub context_switches: u64,
    /// Signals applied
    pub signals_delivered: u64,
    /// Ticks with nothing to run
    pub idle_ticks: u64,
}

/// Outcome of a periodic sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Zombies reaped for exceeding the timeout
    pub reaped: Vec<Pid>,
    /// Slabs returned to the buddy allocator
    pub slabs_released: usize,
}

/// Process manager
pub struct ProcessManager {
    config: ProcessConfig,
    priority_levels: u8,
    table: ProcessTable,
    scheduler: Box<dyn Scheduler>,
    current: Option<Pid>,
    clock: u64,
    last_sweep: u64,
    stats: ProcessStats,
}

impl ProcessManager {
    /// Create a process manager with an empty table
    pub fn new(config: &KernelConfig) -> Self {
        let scheduler = scheduler::build(&config.scheduler);
        info!("Scheduler: {} (quantum {} ticks)", scheduler.name(), config.scheduler.quantum);

        Self {
            config: config.process.clone(),
            priority_levels: config.scheduler.priority_levels,
            table: ProcessTable::new(config.process.max_pid),
            scheduler,
            current: None,
            clock: 0,
            last_sweep: 0,
            stats: ProcessStats::default(),
        }
    }

    // ========== Lifecycle ==========

    /// Create pid 1; it waits forever and is never scheduled
    pub fn spawn_init(&mut self, mm: &mut MemoryManager) -> KernelResult<Pid> {
        let pid = self.table.next_free_pid()?;
        if pid != INIT_PID {
            return Err(KernelError::InvalidArgument("init already exists".into()));
        }
        mm.create_address_space(pid)?;

        let mut init = Pcb::new(pid, KERNEL_PID, &self.config.init_process, 0, ROOT_UID, 0, self.clock);
        init.state = ProcessState::Waiting;
        init.regions = mm.regions(pid);
        self.table.insert(init);
        self.stats.created += 1;

        info!("Created init process {} ({})", pid, self.config.init_process);
        Ok(pid)
    }

    /// Create a READY process
    ///
    /// An unknown or exited parent makes init the parent. Nothing is left
    /// behind if the address space cannot be created.
    pub fn create_process(
        &mut self,
        mm: &mut MemoryManager,
        name: &str,
        ppid: Pid,
        uid: u32,
        gid: u32,
        priority: u8,
    ) -> KernelResult<Pid> {
        if self.table.live_count() >= self.config.max_processes {
            warn!("Process limit {} reached, refusing {}", self.config.max_processes, name);
            return Err(KernelError::ProcessLimitExceeded);
        }
        let pid = self.table.next_free_pid()?;

        let parent = match self.table.get(ppid) {
            Some(p) if p.state.is_alive() => ppid,
            _ => INIT_PID,
        };
        let priority = priority.min(self.priority_levels.saturating_sub(1));

        mm.create_address_space(pid)?;

        let mut pcb = Pcb::new(pid, parent, name, priority, uid, gid, self.clock);
        pcb.transition(ProcessState::Ready)?;
        pcb.regions = mm.regions(pid);
        self.table.insert(pcb);
        if let Some(p) = self.table.get_mut(parent) {
            p.add_child(pid);
        }
        self.scheduler.enqueue(pid, priority);
        self.stats.created += 1;

        info!("Created process {} ({}) parent {} priority {}", pid, name, parent, priority);
        Ok(pid)
    }

    /// Duplicate `parent` into a new READY child
    ///
    /// The child takes the parent's name, credentials, priority and signal
    /// mask, and a copy of its address space. Nothing is left behind if the
    /// copy fails.
    pub fn fork(&mut self, mm: &mut MemoryManager, parent: Pid) -> KernelResult<Pid> {
        let source = self.table.lookup(parent)?;
        if !source.state.is_alive() {
            return Err(KernelError::InvalidPid(parent));
        }
        let name = source.name.clone();
        let (uid, gid, priority, mask) = (source.uid, source.gid, source.priority, source.blocked_signals);

        let child = self.create_process(mm, &name, parent, uid, gid, priority)?;
        if let Err(e) = mm.fork_address_space(parent, child) {
            warn!("Fork of process {} failed: {}", parent, e);
            self.discard(mm, child);
            return Err(e);
        }

        let pcb = self.table.lookup_mut(child)?;
        pcb.blocked_signals = mask;
        pcb.regions = mm.regions(child);
        info!("Process {} forked child {}", parent, child);
        Ok(child)
    }

    /// Terminate a process, leaving a zombie for its parent
    pub fn terminate_process(&mut self, mm: &mut MemoryManager, pid: Pid, exit_code: i32) -> KernelResult<()> {
        if pid == INIT_PID {
            return Err(KernelError::PermissionDenied("init cannot be terminated".into()));
        }
        let state = self.table.lookup(pid)?.state;
        if !state.can_transition_to(ProcessState::Terminated) {
            return Err(KernelError::InvalidTransition {
                pid,
                from: state,
                to: ProcessState::Terminated,
            });
        }

        mm.destroy_address_space(pid)?;
        self.scheduler.remove(pid);
        if self.current == Some(pid) {
            self.current = None;
        }

        let now = self.clock;
        let pcb = self.table.lookup_mut(pid)?;
        pcb.transition(ProcessState::Terminated)?;
        pcb.set_exit_code(exit_code);
        pcb.terminated_at = Some(now);
        pcb.regions.clear();
        pcb.remaining_quantum = 0;
        pcb.pending_signals = SignalSet::empty();
        let children = std::mem::take(&mut pcb.children);
        let ppid = pcb.ppid;
        pcb.transition(ProcessState::Zombie)?;

        // Orphans go to init
        for child in children {
            if let Some(c) = self.table.get_mut(child) {
                c.ppid = INIT_PID;
            }
            if let Some(init) = self.table.get_mut(INIT_PID) {
                init.add_child(child);
            }
        }

        if let Some(parent) = self.table.get_mut(ppid) {
            parent.pending_signals |= SignalSet::CHLD;
            if parent.waiting_for_child && parent.state == ProcessState::Waiting {
                parent.waiting_for_child = false;
                parent.transition(ProcessState::Ready)?;
                let priority = parent.priority;
                self.scheduler.enqueue(ppid, priority);
                debug!("Woke parent {} waiting on child {}", ppid, pid);
            }
        }

        self.stats.terminated += 1;
        info!("Process {} terminated with code {}", pid, exit_code);
        Ok(())
    }

    /// Reap a zombie child of `parent`
    ///
    /// With children but no zombie, a running parent blocks until one exits
    /// and `WouldBlock` is returned.
    pub fn wait(&mut self, parent: Pid) -> KernelResult<(Pid, i32)> {
        let pcb = self.table.lookup(parent)?;
        if pcb.children.is_empty() {
            return Err(KernelError::NoSuchChild(parent));
        }

        let zombie = pcb
            .children
            .iter()
            .copied()
            .filter(|&c| self.table.get(c).map_or(false, |p| p.state == ProcessState::Zombie))
            .min();

        if let Some(child) = zombie {
            let code = self.reap(child).unwrap_or_default();
            debug!("Process {} reaped child {} (code {})", parent, child, code);
            return Ok((child, code));
        }

        if self.table.lookup(parent)?.state == ProcessState::Running {
            self.leave_cpu(parent, ProcessState::Waiting)?;
            self.scheduler.blocked(parent);
            if let Some(p) = self.table.get_mut(parent) {
                p.waiting_for_child = true;
                p.voluntary_switches += 1;
            }
            trace!("Process {} blocked in wait", parent);
        }
        Err(KernelError::WouldBlock)
    }

    /// Block the running process
    pub fn block(&mut self, pid: Pid) -> KernelResult<()> {
        self.leave_cpu(pid, ProcessState::Waiting)?;
        self.scheduler.blocked(pid);
        self.count_voluntary(pid);
        trace!("Process {} blocked", pid);
        Ok(())
    }

    /// Make a waiting process READY
    pub fn wake(&mut self, pid: Pid) -> KernelResult<()> {
        if pid == INIT_PID {
            return Err(KernelError::PermissionDenied("init is never scheduled".into()));
        }
        let pcb = self.table.lookup_mut(pid)?;
        if pcb.state != ProcessState::Waiting {
            return Err(KernelError::InvalidTransition {
                pid,
                from: pcb.state,
                to: ProcessState::Ready,
            });
        }
        pcb.transition(ProcessState::Ready)?;
        pcb.waiting_for_child = false;
        let priority = pcb.priority;
        self.scheduler.enqueue(pid, priority);
        trace!("Process {} woken", pid);
        Ok(())
    }

    /// Give up the CPU while staying READY
    pub fn yield_now(&mut self, pid: Pid) -> KernelResult<()> {
        self.leave_cpu(pid, ProcessState::Ready)?;
        self.scheduler.yielded(pid);
        self.count_voluntary(pid);
        trace!("Process {} yielded", pid);
        Ok(())
    }

    // ========== Signals ==========

    /// Queue a signal for `target`
    ///
    /// Allowed when the caller is the kernel, root, the target itself, or
    /// owned by the same user. Applied at the next decision point.
    pub fn kill(&mut self, caller: Pid, target: Pid, signal: Signal) -> KernelResult<()> {
        if target == INIT_PID {
            return Err(KernelError::PermissionDenied("init cannot be signalled".into()));
        }
        let target_uid = self.table.lookup(target)?.uid;

        if caller != KERNEL_PID && caller != target {
            let caller_uid = self.table.lookup(caller)?.uid;
            if caller_uid != ROOT_UID && caller_uid != target_uid {
                warn!("Process {} may not signal {} ({})", caller, target, signal);
                return Err(KernelError::PermissionDenied(format!(
                    "uid {} cannot signal process {}",
                    caller_uid, target
                )));
            }
        }

        let pcb = self.table.lookup_mut(target)?;
        if pcb.state.is_alive() {
            pcb.pending_signals |= SignalSet::of(signal);
            debug!("Queued {} for process {}", signal, target);
        }
        Ok(())
    }

    /// Replace the blocked-signal mask; KILL and STOP are never blocked
    pub fn set_signal_mask(&mut self, pid: Pid, mask: SignalSet) -> KernelResult<()> {
        let pcb = self.table.lookup_mut(pid)?;
        pcb.blocked_signals = mask - SignalSet::UNBLOCKABLE;
        Ok(())
    }

    // ========== Scheduling ==========

    /// Advance the clock one tick
    ///
    /// Returns the process on the CPU after the tick.
    pub fn tick(&mut self, mm: &mut MemoryManager) -> KernelResult<Option<Pid>> {
        self.clock += 1;

        match self.current {
            Some(pid) => {
                let outcome = self.scheduler.on_tick(Some(pid));
                let remaining = self.scheduler.remaining_quantum(pid).unwrap_or(0);
                if let Some(pcb) = self.table.get_mut(pid) {
                    pcb.cpu_ticks += 1;
                    pcb.remaining_quantum = remaining;
                }
                if outcome == TickOutcome::Preempt {
                    self.leave_cpu(pid, ProcessState::Ready)?;
                    self.scheduler.preempted(pid);
                    if let Some(pcb) = self.table.get_mut(pid) {
                        pcb.involuntary_switches += 1;
                    }
                    trace!("Process {} preempted at tick {}", pid, self.clock);
                }
            }
            None => {
                self.scheduler.on_tick(None);
                self.stats.idle_ticks += 1;
            }
        }

        if self.clock - self.last_sweep >= self.config.sweep_interval {
            if mm.is_halted() {
                // Reaping needs no memory; slab reclaim is skipped
                self.reap_expired();
            } else {
                self.sweep(mm)?;
            }
        }
        if self.current.is_none() {
            self.dispatch(mm)?;
        }
        Ok(self.current)
    }

    /// Run the current process to its next decision point and dispatch
    ///
    /// With an idle CPU this dispatches immediately. Returns the process
    /// now on the CPU.
    pub fn schedule(&mut self, mm: &mut MemoryManager) -> KernelResult<Option<Pid>> {
        self.deliver_signals(mm)?;
        if self.current.is_none() {
            return self.dispatch(mm);
        }

        let switches = self.stats.context_switches;
        while self.current.is_some() && self.stats.context_switches == switches {
            self.tick(mm)?;
        }
        Ok(self.current)
    }

    /// Reap expired zombies and reclaim idle slabs
    pub fn sweep(&mut self, mm: &mut MemoryManager) -> KernelResult<SweepReport> {
        let reaped = self.reap_expired();
        let slabs_released = mm.sweep()?;
        Ok(SweepReport {
            reaped,
            slabs_released,
        })
    }

    // ========== Introspection ==========

    /// Get process by ID
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.table.get(pid)
    }

    /// Every PCB in pid order
    pub fn processes(&self) -> impl Iterator<Item = &Pcb> {
        self.table.iter()
    }

    /// Process on the CPU
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Current tick
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Scheduling policy
    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Refresh the region mirror of a PCB
    pub fn sync_regions(&mut self, pid: Pid, mm: &MemoryManager) {
        if let Some(pcb) = self.table.get_mut(pid) {
            pcb.regions = mm.regions(pid);
        }
    }

    /// Counters and per-state totals
    pub fn stats(&self) -> ProcessStats {
        let mut by_state = BTreeMap::new();
        for pcb in self.table.iter() {
            *by_state.entry(pcb.state.to_string()).or_insert(0) += 1;
        }
        ProcessStats {
            clock: self.clock,
            current: self.current,
            scheduler: self.scheduler.name().to_string(),
            queue_lengths: self.scheduler.queue_lengths(),
            processes: self.table.len(),
            live: self.table.live_count(),
            by_state,
            ..self.stats.clone()
        }
    }

    // Helper functions

    /// Take `pid` off the CPU into `to` (Ready or Waiting)
    fn leave_cpu(&mut self, pid: Pid, to: ProcessState) -> KernelResult<()> {
        let pcb = self.table.lookup_mut(pid)?;
        if pcb.state != ProcessState::Running {
            return Err(KernelError::InvalidTransition {
                pid,
                from: pcb.state,
                to,
            });
        }
        pcb.transition(to)?;
        pcb.remaining_quantum = 0;
        if self.current == Some(pid) {
            self.current = None;
        }
        Ok(())
    }

    fn count_voluntary(&mut self, pid: Pid) {
        if let Some(pcb) = self.table.get_mut(pid) {
            pcb.voluntary_switches += 1;
        }
    }

    /// Remove a zombie, returning its exit code
    fn reap(&mut self, pid: Pid) -> Option<i32> {
        let pcb = self.table.remove(pid)?;
        if let Some(parent) = self.table.get_mut(pcb.ppid) {
            parent.remove_child(pid);
        }
        self.stats.reaped += 1;
        pcb.exit_code
    }

    /// Reap zombies older than the timeout
    fn reap_expired(&mut self) -> Vec<Pid> {
        self.last_sweep = self.clock;
        let now = self.clock;
        let timeout = self.config.zombie_timeout;

        let expired: Vec<Pid> = self
            .table
            .iter()
            .filter(|p| p.state == ProcessState::Zombie)
            .filter(|p| p.terminated_at.map_or(false, |t| now - t >= timeout))
            .map(|p| p.pid)
            .collect();
        for &pid in &expired {
            self.reap(pid);
            debug!("Sweep reaped zombie {}", pid);
        }
        expired
    }

    /// Undo a creation that could not be completed
    fn discard(&mut self, mm: &mut MemoryManager, pid: Pid) {
        self.scheduler.remove(pid);
        if let Some(pcb) = self.table.remove(pid) {
            if let Some(parent) = self.table.get_mut(pcb.ppid) {
                parent.remove_child(pid);
            }
        }
        if let Err(e) = mm.destroy_address_space(pid) {
            warn!("Could not release address space of {}: {}", pid, e);
        }
        self.stats.created = self.stats.created.saturating_sub(1);
    }

    /// Decision point: apply signals, then pick the next process
    fn dispatch(&mut self, mm: &mut MemoryManager) -> KernelResult<Option<Pid>> {
        self.deliver_signals(mm)?;
        if self.current.is_some() {
            return Ok(self.current);
        }

        while let Some(pid) = self.scheduler.select_next() {
            let remaining = self.scheduler.remaining_quantum(pid).unwrap_or(0);
            let Some(pcb) = self.table.get_mut(pid) else {
                self.scheduler.remove(pid);
                continue;
            };
            if pcb.state != ProcessState::Ready {
                warn!("Scheduler held process {} in state {}", pid, pcb.state);
                self.scheduler.remove(pid);
                continue;
            }
            pcb.transition(ProcessState::Running)?;
            pcb.remaining_quantum = remaining;
            self.current = Some(pid);
            self.stats.context_switches += 1;
            trace!("Dispatched process {} at tick {}", pid, self.clock);
            return Ok(Some(pid));
        }
        Ok(None)
    }

    /// Apply every deliverable pending signal, lowest pid first
    fn deliver_signals(&mut self, mm: &mut MemoryManager) -> KernelResult<()> {
        let targets: Vec<(Pid, SignalSet)> = self
            .table
            .iter()
            .filter(|p| p.state.is_alive())
            .map(|p| (p.pid, p.deliverable_signals()))
            .filter(|(_, set)| !set.is_empty())
            .collect();

        for (pid, set) in targets {
            for signal in set.signals() {
                let Some(pcb) = self.table.get_mut(pid) else { break };
                if !pcb.state.is_alive() {
                    break;
                }
                match self.apply_signal(mm, pid, signal) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        // Stays pending for the next decision point
                        warn!("Could not apply {} to process {}: {}", signal, pid, e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
                if let Some(pcb) = self.table.get_mut(pid) {
                    pcb.pending_signals.remove(SignalSet::of(signal));
                }
                self.stats.signals_delivered += 1;
            }
        }
        Ok(())
    }

    fn apply_signal(&mut self, mm: &mut MemoryManager, pid: Pid, signal: Signal) -> KernelResult<()> {
        let state = self.table.lookup(pid)?.state;
        match signal.disposition() {
            Disposition::Terminate | Disposition::CoreDump => {
                if pid == INIT_PID {
                    return Ok(());
                }
                debug!("Process {} killed by {}", pid, signal);
                self.terminate_process(mm, pid, signal.exit_code())
            }
            Disposition::Stop => {
                if pid == INIT_PID || !state.can_transition_to(ProcessState::Stopped) {
                    return Ok(());
                }
                self.scheduler.remove(pid);
                let pcb = self.table.lookup_mut(pid)?;
                if state == ProcessState::Running {
                    pcb.involuntary_switches += 1;
                }
                pcb.transition(ProcessState::Stopped)?;
                pcb.remaining_quantum = 0;
                if self.current == Some(pid) {
                    self.current = None;
                }
                debug!("Process {} stopped by {}", pid, signal);
                Ok(())
            }
            Disposition::Continue => {
                if state != ProcessState::Stopped {
                    return Ok(());
                }
                let pcb = self.table.lookup_mut(pid)?;
                pcb.transition(ProcessState::Ready)?;
                let priority = pcb.priority;
                self.scheduler.enqueue(pid, priority);
                debug!("Process {} continued", pid);
                Ok(())
            }
            Disposition::Ignore => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerAlgorithm;
    use crate::mm::Access;

    fn setup(config: KernelConfig) -> (ProcessManager, MemoryManager) {
        let mut mm = MemoryManager::new(&config.memory);
        let mut pm = ProcessManager::new(&config);
        pm.spawn_init(&mut mm).unwrap();
        (pm, mm)
    }

    fn small() -> (ProcessManager, MemoryManager) {
        setup(KernelConfig::small())
    }

    #[test]
    fn test_init_process() {
        let (pm, mm) = small();
        let init = pm.get(INIT_PID).unwrap();
        assert_eq!(init.name, "init");
        assert_eq!(init.state, ProcessState::Waiting);
        assert!(mm.has_address_space(INIT_PID));
        assert_eq!(pm.scheduler().ready_len(), 0);
    }

    #[test]
    fn test_create_process() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "sh", INIT_PID, 1000, 1000, 5).unwrap();
        assert_eq!(pid, 2);
        let pcb = pm.get(pid).unwrap();
        assert_eq!(pcb.state, ProcessState::Ready);
        assert_eq!(pcb.ppid, INIT_PID);
        assert!(pm.get(INIT_PID).unwrap().children.contains(&pid));
        assert!(mm.has_address_space(pid));
    }

    #[test]
    fn test_unknown_parent_adopted_by_init() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "orphan", 40, 0, 0, 0).unwrap();
        assert_eq!(pm.get(pid).unwrap().ppid, INIT_PID);
    }

    #[test]
    fn test_priority_clamped() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "hot", INIT_PID, 0, 0, 250).unwrap();
        assert_eq!(pm.get(pid).unwrap().priority, 9);
    }

    #[test]
    fn test_process_limit() {
        let mut config = KernelConfig::small();
        config.process.max_processes = 2;
        let (mut pm, mut mm) = setup(config);
        pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();
        pm.create_process(&mut mm, "b", INIT_PID, 0, 0, 0).unwrap();
        let spaces = mm.stats().address_spaces;
        assert_eq!(
            pm.create_process(&mut mm, "c", INIT_PID, 0, 0, 0),
            Err(KernelError::ProcessLimitExceeded)
        );
        assert_eq!(pm.processes().count(), 3);
        assert_eq!(mm.stats().address_spaces, spaces);
    }

    #[test]
    fn test_create_rolls_back_on_oom() {
        let mut config = KernelConfig::small();
        config.memory.total_memory = 2 * 4096;
        config.memory.max_memory_per_process = 4096;
        let (mut pm, mut mm) = setup(config);
        pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();

        assert_eq!(
            pm.create_process(&mut mm, "b", INIT_PID, 0, 0, 0),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(pm.processes().count(), 2);
        assert_eq!(pm.get(INIT_PID).unwrap().children, vec![2]);
        assert_eq!(pm.scheduler().ready_len(), 1);
    }

    #[test]
    fn test_terminate_and_wait() {
        let (mut pm, mut mm) = small();
        let parent = pm.create_process(&mut mm, "parent", INIT_PID, 0, 0, 0).unwrap();
        let child = pm.create_process(&mut mm, "child", parent, 0, 0, 0).unwrap();

        pm.terminate_process(&mut mm, child, 3).unwrap();
        assert_eq!(pm.get(child).unwrap().state, ProcessState::Zombie);
        assert!(!mm.has_address_space(child));
        assert!(pm.get(parent).unwrap().pending_signals.has(Signal::Chld));

        assert_eq!(pm.wait(parent), Ok((child, 3)));
        assert!(pm.get(child).is_none());
        assert_eq!(pm.wait(parent), Err(KernelError::NoSuchChild(parent)));
    }

    #[test]
    fn test_terminate_errors() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "p", INIT_PID, 0, 0, 0).unwrap();
        assert!(matches!(
            pm.terminate_process(&mut mm, INIT_PID, 0),
            Err(KernelError::PermissionDenied(_))
        ));
        assert_eq!(pm.terminate_process(&mut mm, 30, 0), Err(KernelError::InvalidPid(30)));

        pm.terminate_process(&mut mm, pid, 0).unwrap();
        assert_eq!(
            pm.terminate_process(&mut mm, pid, 1),
            Err(KernelError::InvalidTransition {
                pid,
                from: ProcessState::Zombie,
                to: ProcessState::Terminated,
            })
        );
        assert_eq!(pm.get(pid).unwrap().exit_code, Some(0));
    }

    #[test]
    fn test_children_reparented_to_init() {
        let (mut pm, mut mm) = small();
        let parent = pm.create_process(&mut mm, "parent", INIT_PID, 0, 0, 0).unwrap();
        let child = pm.create_process(&mut mm, "child", parent, 0, 0, 0).unwrap();

        pm.terminate_process(&mut mm, parent, 0).unwrap();
        assert_eq!(pm.get(child).unwrap().ppid, INIT_PID);
        assert!(pm.get(INIT_PID).unwrap().children.contains(&child));
    }

    #[test]
    fn test_wait_blocks_and_wakes() {
        let (mut pm, mut mm) = small();
        let parent = pm.create_process(&mut mm, "parent", INIT_PID, 0, 0, 0).unwrap();
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(parent));
        let child = pm.create_process(&mut mm, "child", parent, 0, 0, 0).unwrap();

        assert_eq!(pm.wait(parent), Err(KernelError::WouldBlock));
        assert_eq!(pm.get(parent).unwrap().state, ProcessState::Waiting);
        assert_eq!(pm.current(), None);

        pm.terminate_process(&mut mm, child, 7).unwrap();
        assert_eq!(pm.get(parent).unwrap().state, ProcessState::Ready);
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(parent));
        assert_eq!(pm.wait(parent), Ok((child, 7)));
    }

    #[test]
    fn test_round_robin_rotation() {
        let config = KernelConfig::small().with_algorithm(SchedulerAlgorithm::RoundRobin);
        let (mut pm, mut mm) = setup(config);
        let pids: Vec<Pid> = (0..3)
            .map(|i| pm.create_process(&mut mm, &format!("p{}", i), INIT_PID, 0, 0, 0).unwrap())
            .collect();

        let order: Vec<Pid> = (0..6).filter_map(|_| pm.schedule(&mut mm).unwrap()).collect();
        assert_eq!(order, [pids.clone(), pids].concat());
        assert_eq!(pm.get(order[0]).unwrap().cpu_ticks, 10);
        assert_eq!(pm.get(order[0]).unwrap().involuntary_switches, 1);
    }

    #[test]
    fn test_block_wake_yield() {
        let (mut pm, mut mm) = small();
        let a = pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();
        let b = pm.create_process(&mut mm, "b", INIT_PID, 0, 0, 0).unwrap();

        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(a));
        pm.block(a).unwrap();
        assert_eq!(pm.get(a).unwrap().state, ProcessState::Waiting);
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(b));

        assert!(matches!(pm.block(a), Err(KernelError::InvalidTransition { .. })));
        pm.wake(a).unwrap();
        pm.yield_now(b).unwrap();
        assert_eq!(pm.get(b).unwrap().voluntary_switches, 1);
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(a));
        assert!(pm.wake(INIT_PID).is_err());
    }

    #[test]
    fn test_signal_permissions() {
        let (mut pm, mut mm) = small();
        let alice = pm.create_process(&mut mm, "alice", INIT_PID, 1000, 1000, 0).unwrap();
        let alice2 = pm.create_process(&mut mm, "alice2", INIT_PID, 1000, 1000, 0).unwrap();
        let bob = pm.create_process(&mut mm, "bob", INIT_PID, 1001, 1001, 0).unwrap();
        let root = pm.create_process(&mut mm, "root", INIT_PID, ROOT_UID, 0, 0).unwrap();

        assert!(matches!(pm.kill(bob, alice, Signal::Term), Err(KernelError::PermissionDenied(_))));
        pm.kill(alice2, alice, Signal::Usr1).unwrap();
        pm.kill(root, bob, Signal::Term).unwrap();
        pm.kill(KERNEL_PID, alice2, Signal::Term).unwrap();
        pm.kill(bob, bob, Signal::Hup).unwrap();
        assert_eq!(pm.kill(bob, 60, Signal::Term), Err(KernelError::InvalidPid(60)));
        assert!(matches!(pm.kill(root, INIT_PID, Signal::Kill), Err(KernelError::PermissionDenied(_))));
    }

    #[test]
    fn test_signals_deferred_to_decision_point() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "victim", INIT_PID, 0, 0, 0).unwrap();
        pm.kill(KERNEL_PID, pid, Signal::Term).unwrap();
        assert_eq!(pm.get(pid).unwrap().state, ProcessState::Ready);

        assert_eq!(pm.schedule(&mut mm).unwrap(), None);
        let pcb = pm.get(pid).unwrap();
        assert_eq!(pcb.state, ProcessState::Zombie);
        assert_eq!(pcb.exit_code, Some(128 + 15));
    }

    #[test]
    fn test_stop_and_continue() {
        let (mut pm, mut mm) = small();
        let a = pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();
        let b = pm.create_process(&mut mm, "b", INIT_PID, 0, 0, 0).unwrap();

        pm.kill(KERNEL_PID, a, Signal::Stop).unwrap();
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(b));
        assert_eq!(pm.get(a).unwrap().state, ProcessState::Stopped);

        pm.kill(KERNEL_PID, a, Signal::Cont).unwrap();
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(a));
    }

    #[test]
    fn test_masked_signal_stays_pending() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "p", INIT_PID, 0, 0, 0).unwrap();
        pm.set_signal_mask(pid, SignalSet::TERM | SignalSet::KILL).unwrap();
        assert_eq!(pm.get(pid).unwrap().blocked_signals, SignalSet::TERM);

        pm.kill(KERNEL_PID, pid, Signal::Term).unwrap();
        assert_eq!(pm.schedule(&mut mm).unwrap(), Some(pid));
        assert!(pm.get(pid).unwrap().pending_signals.has(Signal::Term));

        pm.kill(KERNEL_PID, pid, Signal::Kill).unwrap();
        pm.schedule(&mut mm).unwrap();
        assert_eq!(pm.get(pid).unwrap().exit_code, Some(137));
    }

    #[test]
    fn test_sweep_reaps_old_zombies() {
        let (mut pm, mut mm) = small();
        let pid = pm.create_process(&mut mm, "z", INIT_PID, 0, 0, 0).unwrap();
        pm.terminate_process(&mut mm, pid, 0).unwrap();

        // KernelConfig::small(): zombie_timeout 500, sweep_interval 100
        for _ in 0..400 {
            pm.tick(&mut mm).unwrap();
        }
        assert!(pm.get(pid).is_some());
        for _ in 0..100 {
            pm.tick(&mut mm).unwrap();
        }
        assert!(pm.get(pid).is_none());
        assert!(!pm.get(INIT_PID).unwrap().children.contains(&pid));
        assert_eq!(pm.stats().reaped, 1);
    }

    #[test]
    fn test_fork_copies_parent() {
        let (mut pm, mut mm) = small();
        let parent = pm.create_process(&mut mm, "sh", INIT_PID, 1000, 100, 4).unwrap();
        pm.set_signal_mask(parent, SignalSet::USR1).unwrap();
        let heap = mm.allocate_pages(parent, 2).unwrap();
        pm.sync_regions(parent, &mm);

        let child = pm.fork(&mut mm, parent).unwrap();
        let pcb = pm.get(child).unwrap();
        assert_eq!(pcb.name, "sh");
        assert_eq!((pcb.uid, pcb.gid, pcb.priority), (1000, 100, 4));
        assert_eq!(pcb.ppid, parent);
        assert_eq!(pcb.state, ProcessState::Ready);
        assert_eq!(pcb.blocked_signals, SignalSet::USR1);
        assert_eq!(pcb.regions, pm.get(parent).unwrap().regions);
        assert!(pm.get(parent).unwrap().children.contains(&child));
        mm.translate(child, heap.base, Access::Write).unwrap();
    }

    #[test]
    fn test_fork_errors() {
        let (mut pm, mut mm) = small();
        assert_eq!(pm.fork(&mut mm, 40), Err(KernelError::InvalidPid(40)));

        let pid = pm.create_process(&mut mm, "p", INIT_PID, 0, 0, 0).unwrap();
        pm.terminate_process(&mut mm, pid, 0).unwrap();
        assert_eq!(pm.fork(&mut mm, pid), Err(KernelError::InvalidPid(pid)));
    }

    #[test]
    fn test_fork_rolls_back_on_oom() {
        let mut config = KernelConfig::small();
        // Root frames for init and the parent plus 4 heap pages leave 2 free
        config.memory.total_memory = 8 * 4096;
        let (mut pm, mut mm) = setup(config);
        let parent = pm.create_process(&mut mm, "big", INIT_PID, 0, 0, 0).unwrap();
        mm.allocate_pages(parent, 4).unwrap();
        let used = mm.stats().used_frames;

        assert_eq!(pm.fork(&mut mm, parent), Err(KernelError::OutOfMemory));
        assert_eq!(pm.processes().count(), 2);
        assert_eq!(pm.get(parent).unwrap().children, Vec::<Pid>::new());
        assert_eq!(pm.scheduler().ready_len(), 1);
        assert_eq!(mm.stats().used_frames, used);
        assert_eq!(pm.stats().created, 2);
    }

    #[test]
    fn test_halted_memory_keeps_scheduling() {
        let (mut pm, mut mm) = small();
        let zombie = pm.create_process(&mut mm, "z", INIT_PID, 0, 0, 0).unwrap();
        pm.terminate_process(&mut mm, zombie, 0).unwrap();
        let a = pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();
        let b = pm.create_process(&mut mm, "b", INIT_PID, 0, 0, 0).unwrap();
        pm.kill(KERNEL_PID, b, Signal::Term).unwrap();

        mm.halt("ledger drift");
        // KernelConfig::small(): sweep_interval 100, zombie_timeout 500
        for _ in 0..500 {
            pm.tick(&mut mm).unwrap();
        }
        assert!(pm.current().is_some());
        assert!(pm.get(a).unwrap().cpu_ticks > 100);
        assert!(pm.get(zombie).is_none());

        // Termination needs memory, so the signal waits
        let pcb = pm.get(b).unwrap();
        assert!(pcb.state.is_alive());
        assert!(pcb.pending_signals.has(Signal::Term));

        assert!(pm.sweep(&mut mm).unwrap_err().is_fatal());
    }

    #[test]
    fn test_stats() {
        let (mut pm, mut mm) = small();
        pm.create_process(&mut mm, "a", INIT_PID, 0, 0, 0).unwrap();
        pm.schedule(&mut mm).unwrap();
        let stats = pm.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.context_switches, 1);
        assert_eq!(stats.by_state.get("running"), Some(&1));
        assert_eq!(stats.scheduler, "round_robin");
    }
}
