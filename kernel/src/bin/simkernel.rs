//! simkernel CLI
//!
//! Boots a simulated kernel from a JSON configuration and drives it.
//!
//! # Usage
//!
//! ```bash
//! # Run a synthetic workload for 5000 ticks under MLFQ
//! simkernel run --algorithm mlfq --processes 8 --ticks 5000
//!
//! # Write the default configuration
//! simkernel config --output kernel.json
//!
//! # Check a configuration file
//! simkernel config --validate kernel.json
//!
//! # Show the state of a freshly booted kernel
//! simkernel -c kernel.json stats
//! ```

use simkernel::mm::{Access, Protection, VirtAddr};
use simkernel::sys::Signal;
use simkernel::{Kernel, KernelConfig, KernelError, SchedulerAlgorithm, INIT_PID, KERNEL_PID};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// simkernel - simulated kernel resource core
#[derive(Parser)]
#[command(name = "simkernel")]
#[command(version)]
#[command(about = "Simulated process, scheduling and memory core", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a kernel and run a synthetic workload
    Run(RunArgs),

    /// Print, write or validate a configuration
    Config(ConfigArgs),

    /// Boot a kernel and print its statistics
    Stats,
}

#[derive(Args)]
struct RunArgs {
    /// Scheduling algorithm (round_robin, priority, mlfq)
    #[arg(short, long)]
    algorithm: Option<SchedulerAlgorithm>,

    /// Number of workload processes
    #[arg(short, long, default_value = "4")]
    processes: u32,

    /// Ticks to simulate
    #[arg(short, long, default_value = "1000")]
    ticks: u64,

    /// Pages each process allocates at start
    #[arg(long, default_value = "4")]
    pages: usize,

    /// Ticks between terminating the oldest workload process
    #[arg(long, default_value = "0")]
    churn: u64,
}

#[derive(Args)]
struct ConfigArgs {
    /// Write the configuration here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Validate this configuration file and exit
    #[arg(long)]
    validate: Option<PathBuf>,

    /// Start from the small preset
    #[arg(long)]
    small: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };

    match cli.command {
        Commands::Run(args) => run_workload(config, args)?,
        Commands::Config(args) => run_config(config, args)?,
        Commands::Stats => {
            let kernel = Kernel::boot(config)?;
            println!("{}", serde_json::to_string_pretty(&kernel.stats())?);
        }
    }

    Ok(())
}

/// Spawn the workload, drive the clock and print final statistics
fn run_workload(mut config: KernelConfig, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(algorithm) = args.algorithm {
        config = config.with_algorithm(algorithm);
    }
    let levels = config.scheduler.priority_levels;
    let kernel = Kernel::boot(config)?;

    let mut workload = Vec::new();
    for i in 0..args.processes {
        let priority = (i % levels as u32) as u8;
        let pid = match kernel.create_process(&format!("worker-{}", i), INIT_PID, 1000, 1000, priority) {
            Ok(pid) => pid,
            Err(e) if e.is_resource_exhaustion() => {
                warn!("Stopped spawning after {} processes: {}", i, e);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if args.pages > 0 {
            if let Err(e) = kernel.allocate_pages(pid, args.pages) {
                warn!("Process {} got no heap: {}", pid, e);
            }
        }
        // A lazily backed scratch region, touched once
        let scratch = VirtAddr::new(0x4000_0000);
        kernel.map_region(pid, scratch, 4096, Protection::RW)?;
        kernel.handle_page_fault(pid, scratch, Access::Write)?;
        workload.push(pid);
    }
    info!("Spawned {} workload processes", workload.len());

    kernel.schedule()?;
    for tick in 1..=args.ticks {
        kernel.tick()?;
        if args.churn > 0 && tick % args.churn == 0 && !workload.is_empty() {
            let victim = workload.remove(0);
            kernel.kill(KERNEL_PID, victim, Signal::Term)?;
        }
    }

    // Collect whatever zombies init inherited
    loop {
        match kernel.wait(INIT_PID) {
            Ok((pid, code)) => info!("Reaped {} (exit {})", pid, code),
            Err(KernelError::NoSuchChild(_)) | Err(KernelError::WouldBlock) => break,
            Err(e) => return Err(e.into()),
        }
    }

    println!("{}", serde_json::to_string_pretty(&kernel.stats())?);
    Ok(())
}

fn run_config(config: KernelConfig, args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = args.validate {
        KernelConfig::load(&path)?.validate()?;
        println!("{}: ok", path.display());
        return Ok(());
    }

    let config = if args.small { KernelConfig::small() } else { config };
    config.validate()?;
    match args.output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
