//! jascos - run the kernel in a terminal
//!
//! # Usage
//!
//! ```bash
//! # Boot the built-in filesystem
//! jascos
//!
//! # Boot a filesystem snapshot with a custom config
//! jascos --fs fs.json --config kernel.json
//!
//! # More logging
//! RUST_LOG=jascos=debug jascos
//! ```
//!
//! Each line typed on stdin is delivered to the root process key by key,
//! followed by `Enter`. End of input shuts the kernel down.

use clap::Parser;
use jascos::kernel::{Kernel, KernelConfig};
use jascos::platform::{TextDisplay, spawn_keyboard};
use jascos::runtime::ThreadHost;
use jascos::vfs::TreeFs;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filesystem used when no snapshot is given
const DEFAULT_FS: &str = r##"{
    "$boot": { "$init": "#!init" },
    "$bin": { "$echo": "#!echo" }
}"##;

/// jascos - a simulated multiprocess kernel
#[derive(Parser)]
#[command(name = "jascos")]
#[command(version)]
#[command(about = "Boot the simulated kernel on a text display", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Kernel configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Filesystem snapshot (JSON)
    #[arg(short, long)]
    fs: Option<PathBuf>,

    /// Override the boot path
    #[arg(short, long)]
    boot: Option<String>,

    /// Keep serving after the root process has finished
    #[arg(long)]
    keep_running: bool,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // The display owns stdout; logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(boot) = cli.boot {
        config.boot_path = boot;
    }
    if cli.keep_running {
        config.halt_on_root_exit = false;
    }
    config.validate()?;

    let fs = match &cli.fs {
        Some(path) => TreeFs::from_json(&std::fs::read_to_string(path)?)?,
        None => TreeFs::from_json(DEFAULT_FS)?,
    };

    let mut kernel = Kernel::new(
        config,
        fs,
        ThreadHost::with_builtins(),
        TextDisplay::new(io::stdout()),
    );
    spawn_keyboard(BufReader::new(io::stdin()), kernel.sender())?;
    kernel.spawn_reaper()?;

    let root = kernel.boot();
    info!(%root, "kernel up");

    let halt = futures::executor::block_on(kernel.run());
    info!(?halt, "kernel halted");
    Ok(())
}
