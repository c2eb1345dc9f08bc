//! Command-line interface for syncbeat.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Default configuration file, resolved against the working directory.
pub const DEFAULT_CONFIG: &str = "syncbeat.yaml";

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

/// Heartbeat supervisor for long-running Unison sync processes.
#[derive(Parser, Debug)]
#[command(name = "syncbeat", version, author)]
#[command(
    about = "Keeps continuous Unison syncs alive by watching their logs",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Whether this invocation detaches into the background.
    pub fn detaches(&self) -> bool {
        matches!(
            self.command,
            Commands::Start {
                foreground: false,
                ..
            }
        )
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start supervising every configured sync point.
    Start {
        /// Path to the configuration file (defaults to `syncbeat.yaml`).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Stay attached to the terminal instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Show the supervisor and per sync point health.
    Status {
        /// Path to the configuration file (defaults to `syncbeat.yaml`).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Stop the supervisor and every sync process.
    Stop {
        /// Path to the configuration file (defaults to `syncbeat.yaml`).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Also delete sync logs and generated profiles.
        #[arg(long)]
        purge: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
