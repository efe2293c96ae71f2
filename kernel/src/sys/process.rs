//! Process Management
//!
//! A process is the unit of scheduling and memory ownership:
//! - One PCB in the process table
//! - One address space in the memory manager
//! - Scheduling metadata (pid only) in the scheduler

use std::collections::BTreeMap;

use serde::Serialize;

use super::signal::SignalSet;
use crate::mm::VirtualRegion;
use crate::{KernelError, KernelResult, Pid, INIT_PID};

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Being created
    New,
    /// Queued for the CPU
    Ready,
    /// On the CPU
    Running,
    /// Blocked on an event
    Waiting,
    /// Stopped by a job-control signal
    Stopped,
    /// Exiting; resources being released
    Terminated,
    /// Exited, waiting to be reaped
    Zombie,
}

impl ProcessState {
    /// Check if the state machine allows `self -> to`
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (New, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Waiting)
                | (Waiting, Ready)
                | (Ready | Running | Waiting, Stopped)
                | (Stopped, Ready)
                | (New | Ready | Running | Waiting | Stopped, Terminated)
                | (Terminated, Zombie)
        )
    }

    /// Check if the process has not exited
    pub fn is_alive(self) -> bool {
        !matches!(self, ProcessState::Terminated | ProcessState::Zombie)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::New => "new",
            ProcessState::Ready => "ready",
            ProcessState::Running => "running",
            ProcessState::Waiting => "waiting",
            ProcessState::Stopped => "stopped",
            ProcessState::Terminated => "terminated",
            ProcessState::Zombie => "zombie",
        };
        write!(f, "{}", name)
    }
}

/// Process control block
#[derive(Debug, Clone, Serialize)]
pub struct Pcb {
    /// Process ID
    pub pid: Pid,
    /// Parent process ID
    pub ppid: Pid,
    /// Process name
    pub name: String,
    /// Process state
    pub state: ProcessState,
    /// Base priority, larger is more urgent
    pub priority: u8,
    /// Owner user
    pub uid: u32,
    /// Owner group
    pub gid: u32,
    /// Mirror of the address space regions
    pub regions: Vec<VirtualRegion>,
    /// Ticks spent on the CPU
    pub cpu_ticks: u64,
    /// Ticks left in the current quantum
    pub remaining_quantum: u64,
    /// Signals sent but not yet applied
    pub pending_signals: SignalSet,
    /// Signals held back while pending
    pub blocked_signals: SignalSet,
    /// Exit code, set once
    pub exit_code: Option<i32>,
    /// Child processes (live and zombie)
    pub children: Vec<Pid>,
    /// Tick of creation
    pub created_at: u64,
    /// Tick of termination
    pub terminated_at: Option<u64>,
    /// Times the process gave up the CPU itself
    pub voluntary_switches: u64,
    /// Times the process was taken off the CPU
    pub involuntary_switches: u64,
    /// Blocked in `wait` for a child to exit
    pub waiting_for_child: bool,
}

impl Pcb {
    /// Create new PCB in the `New` state
    pub fn new(pid: Pid, ppid: Pid, name: &str, priority: u8, uid: u32, gid: u32, now: u64) -> Self {
        Self {
            pid,
            ppid,
            name: name.to_string(),
            state: ProcessState::New,
            priority,
            uid,
            gid,
            regions: Vec::new(),
            cpu_ticks: 0,
            remaining_quantum: 0,
            pending_signals: SignalSet::empty(),
            blocked_signals: SignalSet::empty(),
            exit_code: None,
            children: Vec::new(),
            created_at: now,
            terminated_at: None,
            voluntary_switches: 0,
            involuntary_switches: 0,
            waiting_for_child: false,
        }
    }

    /// Move to `to`, enforcing the state machine
    pub fn transition(&mut self, to: ProcessState) -> KernelResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(KernelError::InvalidTransition {
                pid: self.pid,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record the exit code; later calls keep the first value
    pub fn set_exit_code(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
    }

    /// Add child process
    pub fn add_child(&mut self, pid: Pid) {
        if !self.children.contains(&pid) {
            self.children.push(pid);
        }
    }

    /// Remove child process
    pub fn remove_child(&mut self, pid: Pid) {
        self.children.retain(|&c| c != pid);
    }

    /// Pending signals not held back by the mask
    pub fn deliverable_signals(&self) -> SignalSet {
        self.pending_signals & !(self.blocked_signals - SignalSet::UNBLOCKABLE)
    }
}

/// Process table: owns every PCB
pub struct ProcessTable {
    processes: BTreeMap<Pid, Pcb>,
    next_pid: Pid,
    max_pid: Pid,
}

impl ProcessTable {
    /// Create empty table issuing pids up to `max_pid`
    pub fn new(max_pid: Pid) -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: INIT_PID,
            max_pid,
        }
    }

    /// Pid the next insert should use
    ///
    /// Pids are issued in increasing order; past `max_pid` the search wraps
    /// to the lowest unused pid above init. Live and zombie pids are skipped.
    pub fn next_free_pid(&self) -> KernelResult<Pid> {
        let upper = self.next_pid..=self.max_pid;
        let wrapped = (INIT_PID + 1)..self.next_pid.min(self.max_pid.saturating_add(1));
        upper
            .chain(wrapped)
            .find(|pid| !self.processes.contains_key(pid))
            .ok_or(KernelError::ProcessLimitExceeded)
    }

    /// Insert a PCB, advancing the pid cursor past it
    pub fn insert(&mut self, pcb: Pcb) {
        self.next_pid = pcb.pid.saturating_add(1);
        self.processes.insert(pcb.pid, pcb);
    }

    /// Remove a PCB
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        self.processes.remove(&pid)
    }

    /// Get process by ID
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.processes.get(&pid)
    }

    /// Get mutable process by ID
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.processes.get_mut(&pid)
    }

    /// Get process or fail with `InvalidPid`
    pub fn lookup(&self, pid: Pid) -> KernelResult<&Pcb> {
        self.get(pid).ok_or(KernelError::InvalidPid(pid))
    }

    /// Get mutable process or fail with `InvalidPid`
    pub fn lookup_mut(&mut self, pid: Pid) -> KernelResult<&mut Pcb> {
        self.get_mut(pid).ok_or(KernelError::InvalidPid(pid))
    }

    /// Check if pid is in the table
    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Iterate in pid order
    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.processes.values()
    }

    /// Processes counted against `max_processes`: alive and not init
    pub fn live_count(&self) -> usize {
        self.processes
            .values()
            .filter(|p| p.pid != INIT_PID && p.state.is_alive())
            .count()
    }

    /// Number of PCBs including zombies
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::signal::Signal;

    fn pcb(pid: Pid) -> Pcb {
        Pcb::new(pid, INIT_PID, "test", 0, 1000, 1000, 0)
    }

    #[test]
    fn test_state_machine() {
        use ProcessState::*;
        assert!(New.can_transition_to(Ready));
        assert!(Running.can_transition_to(Ready));
        assert!(Running.can_transition_to(Waiting));
        assert!(Stopped.can_transition_to(Ready));
        assert!(Waiting.can_transition_to(Terminated));
        assert!(Terminated.can_transition_to(Zombie));

        assert!(!Ready.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Running));
        assert!(!Zombie.can_transition_to(Ready));
        assert!(!Zombie.can_transition_to(Terminated));
        assert!(!New.can_transition_to(Running));
    }

    #[test]
    fn test_transition_error() {
        let mut p = pcb(5);
        assert_eq!(
            p.transition(ProcessState::Running),
            Err(KernelError::InvalidTransition {
                pid: 5,
                from: ProcessState::New,
                to: ProcessState::Running,
            })
        );
        p.transition(ProcessState::Ready).unwrap();
        p.transition(ProcessState::Running).unwrap();
        assert_eq!(p.state, ProcessState::Running);
    }

    #[test]
    fn test_exit_code_set_once() {
        let mut p = pcb(2);
        p.set_exit_code(3);
        p.set_exit_code(9);
        assert_eq!(p.exit_code, Some(3));
    }

    #[test]
    fn test_deliverable_signals() {
        let mut p = pcb(2);
        p.pending_signals = SignalSet::of(Signal::Term) | SignalSet::of(Signal::Kill);
        p.blocked_signals = SignalSet::TERM | SignalSet::KILL;
        assert_eq!(p.deliverable_signals(), SignalSet::KILL);
    }

    #[test]
    fn test_pid_allocation_monotonic() {
        let mut table = ProcessTable::new(10);
        assert_eq!(table.next_free_pid().unwrap(), 1);
        table.insert(pcb(1));
        table.insert(pcb(2));
        table.insert(pcb(3));
        table.remove(2);
        // Freed pids are not reused before wrapping
        assert_eq!(table.next_free_pid().unwrap(), 4);
    }

    #[test]
    fn test_pid_allocation_wraps() {
        let mut table = ProcessTable::new(4);
        for pid in 1..=4 {
            table.insert(pcb(pid));
        }
        assert_eq!(table.next_free_pid(), Err(KernelError::ProcessLimitExceeded));

        table.remove(3);
        table.remove(2);
        assert_eq!(table.next_free_pid().unwrap(), 2);
        table.insert(pcb(2));
        assert_eq!(table.next_free_pid().unwrap(), 3);
    }

    #[test]
    fn test_pid_allocation_at_u32_max() {
        let mut table = ProcessTable::new(u32::MAX);
        table.insert(pcb(1));
        table.insert(pcb(u32::MAX));
        assert_eq!(table.next_free_pid().unwrap(), 2);
    }

    #[test]
    fn test_live_count_excludes_init_and_zombies() {
        let mut table = ProcessTable::new(10);
        table.insert(pcb(1));
        table.insert(pcb(2));
        let mut zombie = pcb(3);
        zombie.state = ProcessState::Zombie;
        table.insert(zombie);
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.len(), 3);
    }
}
