use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use vramcap_cli::{launch, probe};
use vramcap_core::{Enforcement, VramcapConfig};

#[derive(Parser)]
#[command(name = "vramcap")]
#[command(about = "vramcap - cap the GPU memory CUDA and NVML report to an application")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command with the interposition library preloaded
    Run {
        /// Fraction of device memory to hide (0 < F < 1)
        #[arg(short, long)]
        fraction: Option<f64>,

        /// Reject allocations that exceed the adjusted free memory
        #[arg(long)]
        strict: bool,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to libvramcap_interpose.so
        #[arg(long)]
        library: Option<PathBuf>,

        /// Command to run, after `--`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Query device memory through CUDA and NVML and print what this process sees
    Probe {
        /// CUDA device ordinal
        #[arg(short, long, default_value_t = 0)]
        device: i32,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective quota policy
    Policy {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VramcapConfig> {
    let mut config = match path {
        Some(path) => VramcapConfig::load(&path.to_string_lossy())?,
        None => return Ok(VramcapConfig::from_environment()?),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    vramcap_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            fraction,
            strict,
            config,
            library,
            command,
        } => {
            let mut vramcap_config = load_config(config.as_ref())?;
            if let Some(fraction) = fraction {
                vramcap_config.quota.reserved_fraction = fraction;
            }
            if strict {
                vramcap_config.quota.enforcement = Enforcement::Strict;
            }
            let policy = vramcap_config.policy()?;

            let library = launch::locate_library(library.as_deref())?;
            info!(
                "preloading {} (reserved fraction {}, {})",
                library.display(),
                policy.reserved_fraction(),
                policy.enforcement()
            );

            let existing = std::env::var(vramcap_common::platform::PRELOAD_ENV).ok();
            let env = launch::child_env(&library, &policy, config.as_deref(), existing.as_deref());
            launch::exec(&command, &env)?;
        }

        Commands::Probe { device, json } => {
            let report = probe::probe(device)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            const MIB: u64 = 1024 * 1024;
            println!("Device {}: {}", report.device, report.name);
            println!();
            println!("  cuDeviceTotalMem:  total {} MiB", report.device_total_mem / MIB);
            println!(
                "  cuMemGetInfo:      total {} MiB, free {} MiB, used {} MiB",
                report.mem_get_info.total / MIB,
                report.mem_get_info.free / MIB,
                report.mem_get_info.used / MIB
            );
            match &report.nvml {
                Some(nvml) => println!(
                    "  nvmlMemoryInfo:    total {} MiB, free {} MiB, used {} MiB",
                    nvml.total / MIB,
                    nvml.free / MIB,
                    nvml.used / MIB
                ),
                None => println!("  nvmlMemoryInfo:    unavailable"),
            }
            println!();
            if report.is_consistent() {
                println!("All reported totals agree.");
            } else {
                println!("Reported totals disagree; is the interposition library preloaded?");
            }
        }

        Commands::Policy { config } => {
            let vramcap_config = load_config(config.as_ref())?;
            let policy = vramcap_config.policy()?;
            println!("reserved_fraction = {}", policy.reserved_fraction());
            println!("enforcement = \"{}\"", policy.enforcement());
        }
    }

    Ok(())
}
