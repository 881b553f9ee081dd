//! CLI for the swc update client.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod install;
mod monitor;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use swc::ClientConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swc", version, about = "Install and monitor software updates")]
struct Cli {
    /// Daemon control socket.
    #[arg(long, global = true, env = swc::ENV_SOCKET, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream an update image to the daemon and wait for the result.
    Install(install::InstallArgs),

    /// Print daemon progress as it happens.
    Monitor(monitor::MonitorArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for progress and results.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Table,
    /// One JSON object per line.
    Json,
}

fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("swc: {e:#}");
        std::process::exit(1);
    }
}

/// Logs to stderr, filtered by `RUST_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let config = self.config();
        match self.command {
            Command::Install(args) => install::run(config, args),
            Command::Monitor(args) => monitor::run(config, args),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "swc", &mut std::io::stdout());
                Ok(())
            }
        }
    }

    /// Settings from the environment, with `--socket` applied on top.
    fn config(&self) -> ClientConfig {
        let config = ClientConfig::from_env();
        match &self.socket {
            Some(path) => config.endpoint(path),
            None => config,
        }
    }
}

/// Interrupts `handle` on SIGINT or SIGTERM.
pub(crate) fn cancel_on_signal(handle: swc::CancelHandle) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        for sig in signals.forever() {
            tracing::info!(signal = sig, "cancelling update");
            handle.cancel();
        }
    });
    Ok(())
}
