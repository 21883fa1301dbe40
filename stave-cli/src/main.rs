//! CLI for the stave messaging layer.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod peer;
mod serve;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use signal_hook::consts::{SIGINT, SIGTERM};
use stave::crypto::{EncryptionScheme, Identity, Tap};
use stave::log::{Fanout, Level, Prefixed, Tracing};
use stave::Logger;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stave", version, about = "Request/reply and broadcast messaging over ZeroMQ")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(clap::Args)]
pub(crate) struct GlobalOpts {
    /// Request/reply address.
    #[arg(long, global = true, default_value = "tcp://127.0.0.1:5000")]
    pub interactive: String,

    /// Broadcast address.
    #[arg(long, global = true, default_value = "tcp://127.0.0.1:5001")]
    pub broadcast: String,

    /// Listener poll timeout in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    pub poll_timeout: Option<u64>,

    /// Also append log lines to this file.
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Minimum level written to --log-file.
    #[arg(long, global = true, default_value = "debug")]
    pub log_level: Level,

    /// Log every payload crossing the wire (debug level).
    #[arg(long, global = true)]
    pub tap: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server answering handshake, echo and broadcast calls.
    Serve,

    /// Send one call and print the response.
    Send(peer::SendArgs),

    /// Print broadcasts until interrupted.
    Listen(peer::ListenArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let filter = EnvFilter::try_from_env("STAVE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("stave: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve => serve::run(&self.opts),
            Command::Send(args) => peer::send(&self.opts, &args),
            Command::Listen(args) => peer::listen(&self.opts, &args),
            Command::Completion { shell } => {
                let mut cmd = Self::command();
                clap_complete::generate(shell, &mut cmd, "stave", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

impl GlobalOpts {
    /// Builds the logger for a component called `name`.
    ///
    /// Always forwards to `tracing`; `--log-file` adds a prefixed file sink.
    pub(crate) fn logger(&self, name: &str) -> Result<Arc<dyn Logger>> {
        let tracing: Arc<dyn Logger> = Arc::new(Tracing);
        let fanout = Fanout::new([tracing]);
        if let Some(path) = &self.log_file {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            fanout.add(Arc::new(Prefixed::new(file).name(name).level(self.log_level)));
        }
        Ok(Arc::new(fanout))
    }

    /// Encryption scheme selected by `--tap`.
    pub(crate) fn encryption(&self, logger: &Arc<dyn Logger>) -> Arc<dyn EncryptionScheme> {
        if self.tap {
            Arc::new(Tap::new(Arc::clone(logger)))
        } else {
            Arc::new(Identity)
        }
    }

    /// Poll timeout override, if given.
    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout.map(Duration::from_millis)
    }
}

/// Blocks until SIGINT or SIGTERM arrives.
pub(crate) fn wait_for_shutdown() -> Result<()> {
    let term = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&term))
            .context("failed to install signal handler")?;
    }
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_defaults() {
        let cli = Cli::try_parse_from(["stave", "serve"]).unwrap();
        assert_eq!(cli.opts.interactive, "tcp://127.0.0.1:5000");
        assert_eq!(cli.opts.broadcast, "tcp://127.0.0.1:5001");
        assert_eq!(cli.opts.poll_timeout(), None);
        assert_eq!(cli.opts.log_level, Level::Debug);
        assert!(!cli.opts.tap);
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stave",
            "listen",
            "--broadcast",
            "tcp://10.0.0.1:7001",
            "--poll-timeout",
            "250",
            "--log-level",
            "warning",
        ])
        .unwrap();
        assert_eq!(cli.opts.broadcast, "tcp://10.0.0.1:7001");
        assert_eq!(cli.opts.poll_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cli.opts.log_level, Level::Warning);
    }
}
