//! CLI arguments for harvest-poller.
//!
//! This module defines the command-line interface structure using the clap library.
//! The binary replays recorded transport responses through one object's pipeline
//! and prints the rendered exposition for every poll.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "harvest-poller",
    about = "Replay recorded storage API responses through a poller pipeline",
    long_about = "Replay recorded storage API responses through a poller pipeline.\n\n\
                  Each --poll file is one poll of the template's object. Counters are \
                  cooked against the previous poll, the template's plugin chain runs, \
                  and the resulting matrices are printed in Prometheus exposition format.",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Object template (YAML)
    #[arg(short = 't', long)]
    pub template: Option<PathBuf>,

    /// Recorded response of the template query, one file per poll
    #[arg(short = 'p', long = "poll")]
    pub polls: Vec<PathBuf>,

    /// Recorded response for an auxiliary API path, as PATH=FILE
    #[arg(long = "aux", value_parser = parse_aux)]
    pub aux: Vec<(String, PathBuf)>,

    /// Treat this poll (1-based) as truncated by the transport
    #[arg(long)]
    pub partial_poll: Option<usize>,

    /// Seconds between recorded polls, used as the poll timestamp step
    #[arg(long, default_value_t = 60)]
    pub interval: u64,

    /// Override the poller name
    #[arg(long)]
    pub poller: Option<String>,

    /// Override the datacenter global label
    #[arg(long)]
    pub datacenter: Option<String>,

    /// Minimum ops per second for latency averages
    #[arg(long)]
    pub latency_io_reqd: Option<u32>,

    /// Aggregate FlexGroup latencies even when a constituent is partial
    #[arg(long)]
    pub allow_partial_aggregation: bool,

    /// Do not append collector health metrics to the output
    #[arg(long)]
    pub disable_health: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and template and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,
}

fn parse_aux(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((path, file)) if !path.is_empty() && !file.is_empty() => {
            Ok((path.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected PATH=FILE, got '{s}'")),
    }
}
