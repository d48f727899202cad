//! `mosaic` - check huge-page pool layouts and launch programs under them

mod layout;

use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mosaic_memory::config::csv::parse_layout_csv;
use mosaic_memory::config::{EngineConfig, env};
use mosaic_memory::syscalls::{HugePageSupport, SharedMapper, SystemMapper};
use mosaic_memory::{PageSize, validate};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::layout::{LayoutArgs, plan_json, render_plan, required_pages};

#[derive(Parser, Debug)]
#[command(name = "mosaic", version, about = "Huge-page pool layouts for unmodified programs")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate a CSV layout file
    CheckCsv {
        /// Layout file
        file: PathBuf,
        /// Pool type whose rows are checked
        #[arg(long, default_value = "mmap", value_parser = ["brk", "mmap", "file"])]
        pool: String,
        /// Maximum number of windows read
        #[arg(long, default_value_t = 1024)]
        capacity: usize,
    },
    /// Validate the MOSAIC_* variables of the current environment
    CheckEnv,
    /// Validate a layout given as flags and print its page plan
    Plan {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a program with the interception library preloaded
    Run {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Interception library to preload
        #[arg(short, long)]
        library: PathBuf,
        /// Program and its arguments
        #[arg(last = true, required = true)]
        program: Vec<OsString>,
    },
    /// Show the kernel's huge page pools
    Hugepages,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// `-v` flags and `MOSAIC_VERBOSE_LEVEL` both raise the level; `RUST_LOG`
/// overrides both.
fn init_tracing(verbose: u8) {
    let from_env = std::env::var(env::VERBOSE_LEVEL)
        .ok()
        .and_then(|level| level.trim().parse::<u8>().ok())
        .unwrap_or(0);
    let level = match verbose.max(from_env) {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn execute(cli: Cli) -> Result<ExitCode> {
    let verbose_level = u64::from(cli.verbose);
    match cli.command {
        Commands::CheckCsv {
            file,
            pool,
            capacity,
        } => check_csv(&file, &pool, capacity),
        Commands::CheckEnv => check_env(),
        Commands::Plan { layout, json } => {
            let config = checked(&layout, verbose_level)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan_json(&config))?);
            } else {
                print!("{}", render_plan(&config));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            layout,
            library,
            program,
        } => run(&checked(&layout, verbose_level)?, &library, &program),
        Commands::Hugepages => {
            let support = HugePageSupport::detect();
            if support.pools().is_empty() {
                println!("no huge page pools found");
            }
            for pool in support.pools() {
                println!("{pool}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn checked(layout: &LayoutArgs, verbose_level: u64) -> Result<EngineConfig> {
    let config = layout.to_config(verbose_level);
    config.validate(&mapper()).context("invalid pool layout")?;
    Ok(config)
}

/// Scratch storage for layout checks; the launcher never maps huge pages
fn mapper() -> SharedMapper {
    Arc::new(SystemMapper::base_pages_only())
}

fn check_csv(path: &Path, pool: &str, capacity: usize) -> Result<ExitCode> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let layout = parse_layout_csv(BufReader::new(file), pool, capacity, mapper())
        .with_context(|| format!("reading {}", path.display()))?;
    debug!(pool, windows = layout.intervals.len(), "parsed layout");

    if let Err(violation) = validate(&layout.intervals) {
        let interval = layout.intervals.at(violation.index())?;
        bail!("{violation} ({interval})");
    }

    match layout.pool_size {
        Some(size) => println!("{pool}: pool size {size:#x}"),
        None => println!("{pool}: no pool size row"),
    }
    for interval in &layout.intervals {
        println!("  {interval}");
    }
    Ok(ExitCode::SUCCESS)
}

fn check_env() -> Result<ExitCode> {
    let config = EngineConfig::from_env().context("loading MOSAIC_* configuration")?;
    config.validate(&mapper()).context("invalid pool layout")?;
    print!("{}", render_plan(&config));
    Ok(ExitCode::SUCCESS)
}

fn run(config: &EngineConfig, library: &Path, program: &[OsString]) -> Result<ExitCode> {
    if !library.is_file() {
        bail!("interception library {} not found", library.display());
    }
    let Some((binary, args)) = program.split_first() else {
        bail!("no program given");
    };
    warn_if_pages_missing(config);

    let mut preload = OsString::new();
    if let Some(existing) = std::env::var_os("LD_PRELOAD").filter(|v| !v.is_empty()) {
        preload.push(existing);
        preload.push(":");
    }
    preload.push(library.as_os_str());

    info!(program = ?binary, "launching");
    let status = Command::new(binary)
        .args(args)
        .envs(config.to_env())
        .env("LD_PRELOAD", preload)
        .status()
        .with_context(|| format!("starting {}", binary.to_string_lossy()))?;

    let code = match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    };
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn warn_if_pages_missing(config: &EngineConfig) {
    let support = HugePageSupport::detect();
    for page in [PageSize::HugeMedium, PageSize::HugeLarge] {
        let needed = required_pages(config, page);
        let free = support.free_pages(page);
        if needed > free {
            warn!(page_size = %page, needed, free, "not enough huge pages reserved");
        }
    }
}
