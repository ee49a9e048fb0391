//! courier - post messages to an in-process dispatcher from the command line
//!
//! Reads `sender recipient body...` lines from stdin. A leading `!` marks a
//! line as urgent. Handled messages are printed to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::time::Duration;

use courier_core::{
    config::{parse_duration, Config, NormalMode, ShutdownPolicy},
    Dispatcher, Message, ShutdownReport, StdoutHandler,
};

#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about = "In-process urgent/normal message dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (default: ~/.config/courier/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Number of pool workers for normal messages
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Delay before a normal message is handled (e.g. "500ms", "2s")
    #[arg(short, long, global = true, value_parser = parse_delay)]
    delay: Option<Duration>,

    /// Spawn one detached thread per normal message instead of using a pool
    #[arg(long, global = true)]
    detached: bool,

    /// Handle all pending messages before exiting
    #[arg(long, global = true)]
    drain: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Post a single message and wait for it to be handled
    Send {
        /// Sender identifier
        #[arg(long)]
        from: String,
        /// Recipient identifier
        #[arg(long)]
        to: String,
        /// Handle inline on the consumer thread
        #[arg(short, long)]
        urgent: bool,
        /// Message body
        #[arg(required = true)]
        body: Vec<String>,
    },
    /// Post a normal message followed by an urgent one
    Demo,
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
}

fn parse_delay(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            return Ok(());
        }
        Some(Commands::ConfigPath) => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        _ => {}
    }

    // Load config
    let mut config = if let Some(path) = &cli.config {
        Config::from_file(path).with_context(|| format!("failed to load config from {}", path))?
    } else {
        Config::load_or_default()
    };

    // Apply CLI overrides
    if let Some(workers) = cli.workers {
        config.normal.workers = workers;
    }
    if let Some(delay) = cli.delay {
        config.normal.delay = delay;
    }
    if cli.detached {
        config.normal.mode = NormalMode::Detached;
    }
    if cli.drain {
        config.shutdown.policy = ShutdownPolicy::Drain;
    }

    let report = match cli.command {
        Some(Commands::Send {
            from,
            to,
            urgent,
            body,
        }) => {
            // A single message would otherwise be discarded before its delay ends
            config.shutdown.policy = ShutdownPolicy::Drain;
            let dispatcher = Dispatcher::with_config(config, StdoutHandler)?;
            dispatcher.post(from, to, body.join(" "), urgent)?;
            dispatcher.shutdown()
        }
        Some(Commands::Demo) => run_demo(config)?,
        _ => run_stdin(config)?,
    };

    print_summary(&report);
    Ok(())
}

fn run_demo(mut config: Config) -> Result<ShutdownReport> {
    config.shutdown.policy = ShutdownPolicy::Drain;
    let dispatcher = Dispatcher::with_config(config, StdoutHandler)?;
    dispatcher.post_message(Message::normal("alice", "bob", "hi"))?;
    dispatcher.post_message(Message::urgent("carol", "dave", "fire"))?;
    Ok(dispatcher.shutdown())
}

fn run_stdin(config: Config) -> Result<ShutdownReport> {
    let dispatcher = Dispatcher::with_config(config, StdoutHandler)?;

    let stdin = io::stdin();
    for (number, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        match parse_line(&line) {
            Some(message) => {
                if let Err(e) = dispatcher.post_message(message) {
                    log::warn!("line {}: {}", number + 1, e);
                }
            }
            None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
            None => log::warn!("line {}: expected `sender recipient body...`", number + 1),
        }
    }

    Ok(dispatcher.shutdown())
}

/// Parse `[!]sender recipient body...`.
fn parse_line(line: &str) -> Option<Message> {
    let line = line.trim();
    let (urgent, rest) = match line.strip_prefix('!') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let mut parts = rest.splitn(3, char::is_whitespace);
    let sender = parts.next().filter(|s| !s.is_empty() && !s.starts_with('#'))?;
    let recipient = parts.next().filter(|s| !s.is_empty())?;
    let body = parts.next().map(str::trim).unwrap_or("");
    Some(Message::new(sender, recipient, body, urgent))
}

fn print_summary(report: &ShutdownReport) {
    let stats = &report.stats;
    eprintln!(
        "posted {} | urgent {} | normal {} | failed {} | dropped {} | still running {}",
        stats.posted,
        stats.urgent_handled,
        stats.normal_handled,
        stats.failed,
        stats.dropped,
        stats.in_flight
    );
}
