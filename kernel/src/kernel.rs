//! Kernel composition root
//!
//! [`Kernel`] owns the memory manager and the process manager behind one
//! `parking_lot::Mutex`. Every public call takes the lock once, so no caller
//! ever observes the two halves out of step.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::KernelConfig;
use crate::mm::{
    Access, FrameNumber, KernelObject, MemoryManager, MemoryStats, PageAllocation, PhysAddr,
    ProcessMemory, Protection, VirtAddr, VirtualRegion,
};
use crate::sys::{Pcb, ProcessManager, ProcessStats, Signal, SignalSet, SweepReport};
use crate::{KernelError, KernelResult, Pid, NAME, VERSION};

/// Everything guarded by the kernel lock
struct Core {
    memory: MemoryManager,
    processes: ProcessManager,
}

/// Combined snapshot of both managers
#[derive(Debug, Clone, Serialize)]
pub struct KernelStats {
    /// Memory manager counters
    pub memory: MemoryStats,
    /// Process manager counters
    pub processes: ProcessStats,
}

/// Simulated kernel
pub struct Kernel {
    config: KernelConfig,
    core: Mutex<Core>,
}

impl Kernel {
    /// Validate `config`, build both managers and create init
    pub fn boot(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        info!("{} v{} booting", NAME, VERSION);

        let mut memory = MemoryManager::new(&config.memory);
        let mut processes = ProcessManager::new(&config);
        processes.spawn_init(&mut memory)?;

        info!("Kernel ready");
        Ok(Self {
            config,
            core: Mutex::new(Core { memory, processes }),
        })
    }

    /// Configuration the kernel booted with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ========== Processes ==========

    /// Create a READY process; an unknown parent makes init the parent
    pub fn create_process(&self, name: &str, ppid: Pid, uid: u32, gid: u32, priority: u8) -> KernelResult<Pid> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.create_process(memory, name, ppid, uid, gid, priority)
    }

    /// Duplicate `parent`, address space included; returns the child pid
    pub fn fork(&self, parent: Pid) -> KernelResult<Pid> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.fork(memory, parent)
    }

    /// Terminate a process; it stays a zombie until reaped
    pub fn terminate_process(&self, pid: Pid, exit_code: i32) -> KernelResult<()> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.terminate_process(memory, pid, exit_code)
    }

    /// Queue `signal` for `pid` on behalf of `caller`
    pub fn kill(&self, caller: Pid, pid: Pid, signal: Signal) -> KernelResult<()> {
        self.core.lock().processes.kill(caller, pid, signal)
    }

    /// Replace the blocked-signal mask of `pid`
    pub fn set_signal_mask(&self, pid: Pid, mask: SignalSet) -> KernelResult<()> {
        self.core.lock().processes.set_signal_mask(pid, mask)
    }

    /// Reap a zombie child of `ppid`, or block with `WouldBlock`
    pub fn wait(&self, ppid: Pid) -> KernelResult<(Pid, i32)> {
        self.core.lock().processes.wait(ppid)
    }

    /// Block the running process
    pub fn block(&self, pid: Pid) -> KernelResult<()> {
        self.core.lock().processes.block(pid)
    }

    /// Make a waiting process READY
    pub fn wake(&self, pid: Pid) -> KernelResult<()> {
        self.core.lock().processes.wake(pid)
    }

    /// Running process gives up the CPU
    pub fn yield_now(&self, pid: Pid) -> KernelResult<()> {
        self.core.lock().processes.yield_now(pid)
    }

    /// Snapshot of one PCB
    pub fn get_process(&self, pid: Pid) -> Option<Pcb> {
        self.core.lock().processes.get(pid).cloned()
    }

    /// Snapshot of every PCB in pid order
    pub fn list_processes(&self) -> Vec<Pcb> {
        self.core.lock().processes.processes().cloned().collect()
    }

    /// Run to the next dispatch and return the process on the CPU
    pub fn schedule(&self) -> KernelResult<Option<Pid>> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.schedule(memory)
    }

    /// Advance the clock one tick
    pub fn tick(&self) -> KernelResult<Option<Pid>> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.tick(memory)
    }

    /// Reap expired zombies and reclaim idle slabs now
    pub fn sweep(&self) -> KernelResult<SweepReport> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        processes.sweep(memory)
    }

    // ========== Memory ==========

    /// Create the address space of a live process
    pub fn create_address_space(&self, pid: Pid) -> KernelResult<()> {
        let mut core = self.core.lock();
        Self::require_live(&core, pid)?;
        core.memory.create_address_space(pid)?;
        let Core { memory, processes } = &mut *core;
        processes.sync_regions(pid, memory);
        Ok(())
    }

    /// Release every frame of `pid`'s address space
    pub fn destroy_address_space(&self, pid: Pid) -> KernelResult<()> {
        let mut core = self.core.lock();
        core.memory.destroy_address_space(pid)?;
        let Core { memory, processes } = &mut *core;
        processes.sync_regions(pid, memory);
        Ok(())
    }

    /// Reserve a region backed on first touch
    pub fn map_region(&self, pid: Pid, base: VirtAddr, length: u64, protection: Protection) -> KernelResult<VirtualRegion> {
        self.with_memory(pid, |mm| mm.map_region(pid, base, length, protection))
    }

    /// Remove a region and release its frames
    pub fn unmap_region(&self, pid: Pid, base: VirtAddr) -> KernelResult<()> {
        self.with_memory(pid, |mm| mm.unmap_region(pid, base))
    }

    /// Change the protection of a region
    pub fn protect(&self, pid: Pid, base: VirtAddr, protection: Protection) -> KernelResult<()> {
        self.with_memory(pid, |mm| mm.protect(pid, base, protection))
    }

    /// Allocate `count` pages as a new heap region
    pub fn allocate_pages(&self, pid: Pid, count: usize) -> KernelResult<PageAllocation> {
        self.with_memory(pid, |mm| mm.allocate_pages(pid, count))
    }

    /// Free frames mapped by `pid`
    pub fn free_pages(&self, pid: Pid, frames: &[FrameNumber]) -> KernelResult<()> {
        self.with_memory(pid, |mm| mm.free_pages(pid, frames))
    }

    /// Translate a virtual address, checking protection
    pub fn translate(&self, pid: Pid, addr: VirtAddr, access: Access) -> KernelResult<PhysAddr> {
        self.core.lock().memory.translate(pid, addr, access)
    }

    /// Back a faulting page inside a region
    pub fn handle_page_fault(&self, pid: Pid, addr: VirtAddr, access: Access) -> KernelResult<PhysAddr> {
        self.core.lock().memory.handle_page_fault(pid, addr, access)
    }

    /// Allocate a kernel object from the slab caches
    pub fn allocate_kernel(&self, size: usize) -> KernelResult<KernelObject> {
        self.core.lock().memory.allocate_kernel(size)
    }

    /// Free a kernel object
    pub fn free_kernel(&self, addr: PhysAddr) -> KernelResult<()> {
        self.core.lock().memory.free_kernel(addr)
    }

    // ========== Statistics ==========

    /// System-wide memory statistics
    pub fn get_memory_stats(&self) -> MemoryStats {
        self.core.lock().memory.stats()
    }

    /// Memory usage of one process
    pub fn get_process_memory(&self, pid: Pid) -> KernelResult<ProcessMemory> {
        self.core.lock().memory.process_memory(pid)
    }

    /// Process manager counters
    pub fn get_process_stats(&self) -> ProcessStats {
        self.core.lock().processes.stats()
    }

    /// Both snapshots under one lock acquisition
    pub fn stats(&self) -> KernelStats {
        let core = self.core.lock();
        KernelStats {
            memory: core.memory.stats(),
            processes: core.processes.stats(),
        }
    }

    // Helper functions

    fn require_live(core: &Core, pid: Pid) -> KernelResult<()> {
        match core.processes.get(pid) {
            Some(pcb) if pcb.state.is_alive() => Ok(()),
            _ => Err(KernelError::InvalidPid(pid)),
        }
    }

    /// Run a memory operation and refresh the PCB region mirror
    fn with_memory<T>(&self, pid: Pid, op: impl FnOnce(&mut MemoryManager) -> KernelResult<T>) -> KernelResult<T> {
        let mut core = self.core.lock();
        let Core { memory, processes } = &mut *core;
        let result = op(memory)?;
        processes.sync_regions(pid, memory);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::HEAP_START;
    use crate::sys::ProcessState;
    use crate::INIT_PID;

    fn boot() -> Kernel {
        Kernel::boot(KernelConfig::small()).unwrap()
    }

    #[test]
    fn test_boot_creates_init() {
        let kernel = boot();
        let init = kernel.get_process(INIT_PID).unwrap();
        assert_eq!(init.name, "init");
        assert_eq!(kernel.list_processes().len(), 1);
        assert_eq!(kernel.get_memory_stats().address_spaces, 1);
    }

    #[test]
    fn test_boot_rejects_invalid_config() {
        let mut config = KernelConfig::small();
        config.memory.page_size = 1000;
        assert!(matches!(Kernel::boot(config), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_kernel_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Kernel>();
    }

    #[test]
    fn test_regions_mirrored_in_pcb() {
        let kernel = boot();
        let pid = kernel.create_process("app", INIT_PID, 0, 0, 0).unwrap();
        let alloc = kernel.allocate_pages(pid, 2).unwrap();
        assert_eq!(alloc.base, VirtAddr::new(HEAP_START));

        let pcb = kernel.get_process(pid).unwrap();
        assert_eq!(pcb.regions.len(), 1);
        assert_eq!(pcb.regions[0].start, alloc.base);

        kernel.free_pages(pid, &alloc.frames).unwrap();
        assert!(kernel.get_process(pid).unwrap().regions.is_empty());
    }

    #[test]
    fn test_address_space_requires_live_process() {
        let kernel = boot();
        assert_eq!(kernel.create_address_space(9), Err(KernelError::InvalidPid(9)));

        let pid = kernel.create_process("app", INIT_PID, 0, 0, 0).unwrap();
        kernel.terminate_process(pid, 0).unwrap();
        assert_eq!(kernel.create_address_space(pid), Err(KernelError::InvalidPid(pid)));
    }

    #[test]
    fn test_terminate_releases_memory() {
        let kernel = boot();
        let before = kernel.get_memory_stats().free_frames;
        let pid = kernel.create_process("app", INIT_PID, 0, 0, 0).unwrap();
        kernel.allocate_pages(pid, 4).unwrap();
        kernel
            .map_region(pid, VirtAddr::new(0x4000_0000), 8192, Protection::RW)
            .unwrap();
        kernel
            .handle_page_fault(pid, VirtAddr::new(0x4000_0010), Access::Write)
            .unwrap();

        kernel.terminate_process(pid, 0).unwrap();
        assert_eq!(kernel.get_memory_stats().free_frames, before);
        assert_eq!(kernel.get_process(pid).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn test_schedule_and_stats() {
        let kernel = boot();
        let a = kernel.create_process("a", INIT_PID, 0, 0, 0).unwrap();
        let b = kernel.create_process("b", INIT_PID, 0, 0, 0).unwrap();
        assert_eq!(kernel.schedule().unwrap(), Some(a));
        assert_eq!(kernel.schedule().unwrap(), Some(b));

        let stats = kernel.stats();
        assert_eq!(stats.processes.context_switches, 2);
        assert_eq!(stats.processes.clock, kernel.config().scheduler.quantum);
        assert!(!stats.memory.halted);
    }

    #[test]
    fn test_fork_through_kernel() {
        let kernel = boot();
        let parent = kernel.create_process("db", INIT_PID, 1000, 1000, 2).unwrap();
        kernel.allocate_pages(parent, 2).unwrap();

        let child = kernel.fork(parent).unwrap();
        let pcb = kernel.get_process(child).unwrap();
        assert_eq!(pcb.ppid, parent);
        assert_eq!(pcb.name, "db");
        assert_eq!(pcb.regions, kernel.get_process(parent).unwrap().regions);
        assert_eq!(kernel.get_process_memory(child).unwrap().resident_pages, 2);
        assert_eq!(kernel.fork(77), Err(KernelError::InvalidPid(77)));
    }

    #[test]
    fn test_ticks_survive_memory_halt() {
        let kernel = boot();
        let pid = kernel.create_process("app", INIT_PID, 0, 0, 0).unwrap();
        kernel.core.lock().memory.halt("ledger drift");

        let interval = kernel.config().process.sweep_interval;
        for _ in 0..interval * 2 {
            assert_eq!(kernel.tick().unwrap(), Some(pid));
        }
        assert!(kernel.stats().memory.halted);
        assert!(kernel.allocate_pages(pid, 1).unwrap_err().is_fatal());
    }

    #[test]
    fn test_kernel_objects() {
        let kernel = boot();
        let obj = kernel.allocate_kernel(100).unwrap();
        assert_eq!(obj.size, 128);
        kernel.free_kernel(obj.addr).unwrap();
        assert_eq!(kernel.free_kernel(obj.addr), Err(KernelError::DoubleFree(obj.addr.as_u64())));
    }
}
