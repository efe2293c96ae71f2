//! Kernel Configuration
//!
//! Boot-time parameters for the scheduler, the memory subsystem and the
//! process table. Loaded from JSON; every section has defaults so partial
//! files are accepted.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Pid;

/// Scheduling algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlgorithm {
    /// Single FIFO queue with a fixed quantum
    RoundRobin,
    /// One FIFO per priority level, with aging
    Priority,
    /// Multi-level feedback queue
    Mlfq,
}

impl Default for SchedulerAlgorithm {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl std::fmt::Display for SchedulerAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerAlgorithm::RoundRobin => write!(f, "round_robin"),
            SchedulerAlgorithm::Priority => write!(f, "priority"),
            SchedulerAlgorithm::Mlfq => write!(f, "mlfq"),
        }
    }
}

impl std::str::FromStr for SchedulerAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(SchedulerAlgorithm::RoundRobin),
            "priority" | "prio" => Ok(SchedulerAlgorithm::Priority),
            "mlfq" => Ok(SchedulerAlgorithm::Mlfq),
            _ => Err(format!("Unknown scheduler algorithm: {}", s)),
        }
    }
}

/// Scheduler section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Algorithm chosen at boot
    pub algorithm: SchedulerAlgorithm,
    /// Base quantum in ticks (1 tick = 1 ms)
    pub quantum: u64,
    /// Number of priority levels (Priority scheduler and PCB clamping)
    pub priority_levels: u8,
    /// Number of MLFQ levels
    pub num_queues: usize,
    /// Ticks between MLFQ priority boosts
    pub boost_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm: SchedulerAlgorithm::RoundRobin,
            quantum: 100,
            priority_levels: 10,
            num_queues: 4,
            boost_interval: 1000,
        }
    }
}

/// Memory section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Simulated physical memory in bytes
    pub total_memory: u64,
    /// Page and frame size in bytes
    pub page_size: u64,
    /// Upper bound on region bytes per address space
    pub max_memory_per_process: u64,
    /// Slab object sizes, ascending
    pub slab_size_classes: Vec<usize>,
    /// Buddy order of each slab (slab = 2^order pages)
    pub slab_order: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_memory: 64 * 1024 * 1024,
            page_size: 4096,
            max_memory_per_process: 16 * 1024 * 1024,
            slab_size_classes: vec![32, 64, 128, 256, 512, 1024, 2048],
            slab_order: 0,
        }
    }
}

impl MemoryConfig {
    /// Number of physical frames
    pub fn total_frames(&self) -> usize {
        (self.total_memory / self.page_size) as usize
    }
}

/// Process section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Highest pid ever issued
    pub max_pid: Pid,
    /// Live (non-zombie) processes allowed, not counting init
    pub max_processes: usize,
    /// Ticks a zombie may linger before the sweep reaps it
    pub zombie_timeout: u64,
    /// Ticks between periodic sweeps
    pub sweep_interval: u64,
    /// Name given to pid 1
    pub init_process: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_pid: 32768,
            max_processes: 256,
            zombie_timeout: 60_000,
            sweep_interval: 1000,
            init_process: "init".into(),
        }
    }
}

/// Kernel configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Scheduler parameters
    pub scheduler: SchedulerConfig,
    /// Memory parameters
    pub memory: MemoryConfig,
    /// Process table parameters
    pub process: ProcessConfig,
}

impl KernelConfig {
    /// Small machine: 1 MiB of memory, a handful of processes, short timeouts
    pub fn small() -> Self {
        Self {
            scheduler: SchedulerConfig {
                quantum: 10,
                boost_interval: 200,
                ..Default::default()
            },
            memory: MemoryConfig {
                total_memory: 1024 * 1024,
                max_memory_per_process: 256 * 1024,
                ..Default::default()
            },
            process: ProcessConfig {
                max_pid: 64,
                max_processes: 16,
                zombie_timeout: 500,
                sweep_interval: 100,
                ..Default::default()
            },
        }
    }

    /// Same configuration with another scheduling algorithm
    pub fn with_algorithm(mut self, algorithm: SchedulerAlgorithm) -> Self {
        self.scheduler.algorithm = algorithm;
        self
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: KernelConfig = if path.extension().map_or(false, |e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            return Err(ConfigError::Parse("Only JSON config files supported".into()));
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;
        if sched.quantum == 0 {
            return Err(ConfigError::Invalid("Quantum must be at least 1 tick".into()));
        }
        if sched.priority_levels == 0 {
            return Err(ConfigError::Invalid("Need at least one priority level".into()));
        }
        if sched.num_queues == 0 || sched.num_queues > 16 {
            return Err(ConfigError::Invalid("MLFQ queue count must be in 1..=16".into()));
        }
        if sched.boost_interval == 0 {
            return Err(ConfigError::Invalid("Boost interval must be at least 1 tick".into()));
        }

        let mem = &self.memory;
        if !mem.page_size.is_power_of_two() || mem.page_size < 256 {
            return Err(ConfigError::Invalid("Page size must be a power of two >= 256".into()));
        }
        if mem.total_memory % mem.page_size != 0 || mem.total_frames() < 2 {
            return Err(ConfigError::Invalid(
                "Total memory must be a multiple of the page size and hold at least two frames".into(),
            ));
        }
        if mem.max_memory_per_process < mem.page_size {
            return Err(ConfigError::Invalid("Per-process memory limit is below one page".into()));
        }
        if mem.slab_size_classes.is_empty() {
            return Err(ConfigError::Invalid("At least one slab size class is required".into()));
        }
        if mem.slab_size_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid("Slab size classes must be strictly ascending".into()));
        }
        // A slab fits in physical memory, so its byte size cannot overflow
        let slab_frames = 1usize
            .checked_shl(u32::from(mem.slab_order))
            .filter(|&frames| frames <= mem.total_frames())
            .ok_or_else(|| ConfigError::Invalid("Slab order exceeds physical memory".into()))?;
        let slab_bytes = slab_frames as u64 * mem.page_size;
        if mem.slab_size_classes[0] < 8 {
            return Err(ConfigError::Invalid("Slab objects must be at least 8 bytes".into()));
        }
        if mem.slab_size_classes.iter().any(|&c| c as u64 > slab_bytes) {
            return Err(ConfigError::Invalid("Slab size class larger than a slab".into()));
        }

        let proc = &self.process;
        if proc.max_pid < 2 || proc.max_pid == Pid::MAX {
            return Err(ConfigError::Invalid("max_pid must be in 2..u32::MAX".into()));
        }
        if proc.max_processes == 0 || proc.max_processes as u64 >= proc.max_pid as u64 {
            return Err(ConfigError::Invalid("max_processes must be in 1..max_pid".into()));
        }
        if proc.sweep_interval == 0 {
            return Err(ConfigError::Invalid("Sweep interval must be at least 1 tick".into()));
        }
        if proc.init_process.is_empty() {
            return Err(ConfigError::Invalid("Init process needs a name".into()));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(String),

    /// File is not valid configuration JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Values are out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.scheduler.algorithm, SchedulerAlgorithm::RoundRobin);
        assert_eq!(config.scheduler.quantum, 100);
        assert_eq!(config.memory.total_frames(), 16384);
        assert_eq!(config.process.max_pid, 32768);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_small_config() {
        let config = KernelConfig::small();
        assert_eq!(config.memory.total_frames(), 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("rr".parse::<SchedulerAlgorithm>().unwrap(), SchedulerAlgorithm::RoundRobin);
        assert_eq!("MLFQ".parse::<SchedulerAlgorithm>().unwrap(), SchedulerAlgorithm::Mlfq);
        assert!("lottery".parse::<SchedulerAlgorithm>().is_err());
        assert_eq!(SchedulerAlgorithm::Priority.to_string(), "priority");
    }

    #[test]
    fn test_config_validation() {
        let mut config = KernelConfig::default();
        config.scheduler.quantum = 0;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.memory.page_size = 3000;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.memory.slab_size_classes = vec![64, 32];
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.process.max_processes = config.process.max_pid as usize;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for order in [20, 63, 64, 200, u8::MAX] {
            let mut config = KernelConfig::default();
            config.memory.slab_order = order;
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }

        let mut config = KernelConfig::default();
        config.process.max_pid = u32::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = KernelConfig::default();
        config.process.max_pid = u32::MAX - 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{ "scheduler": { "algorithm": "mlfq", "quantum": 20 } }"#;
        let config: KernelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scheduler.algorithm, SchedulerAlgorithm::Mlfq);
        assert_eq!(config.scheduler.quantum, 20);
        assert_eq!(config.scheduler.num_queues, 4);
        assert_eq!(config.memory, MemoryConfig::default());
    }

    #[test]
    fn test_save_load_config() {
        let tmp = tempdir().unwrap();
        let config_path = tmp.path().join("kernel.json");

        let config = KernelConfig::small().with_algorithm(SchedulerAlgorithm::Priority);
        config.save(&config_path).unwrap();

        let loaded = KernelConfig::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_non_json() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("kernel.toml");
        std::fs::write(&path, "quantum = 5").unwrap();
        assert!(matches!(KernelConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
