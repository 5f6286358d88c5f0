//! CLI command definitions and handlers.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use peerdrop_core::codec::CompressionMode;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, the defaults are used.
pub fn load_config() -> peerdrop_core::Config {
    peerdrop_core::Config::load().unwrap_or_default()
}

pub mod config;
pub mod loopback;
pub mod quality;

/// PeerDrop - peer-to-peer file transfer protocol tools
#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Transfer files between two in-process peers
    Loopback(LoopbackArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Classify a link and show the chunk size it would get
    Quality(QualityArgs),
}

/// Compression choice on the command line
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CompressArg {
    /// Compress unless the file is already compressed
    Auto,
    /// Always compress
    Always,
    /// Never compress
    Never,
}

impl From<CompressArg> for CompressionMode {
    fn from(arg: CompressArg) -> Self {
        match arg {
            CompressArg::Auto => Self::Auto,
            CompressArg::Always => Self::Always,
            CompressArg::Never => Self::Never,
        }
    }
}

/// Arguments for the loopback command
#[derive(Parser)]
pub struct LoopbackArgs {
    /// Files to transfer
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// One-way latency of the simulated link (e.g., 0ms, 20ms, 1s)
    #[arg(short, long, default_value = "0ms")]
    pub latency: String,

    /// Deliver binary frames as blobs, like some browsers do
    #[arg(long)]
    pub blob: bool,

    /// Directory to write received files to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Override the configured compression mode
    #[arg(short, long, value_enum)]
    pub compress: Option<CompressArg>,

    /// Output a JSON summary instead of progress
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., chunk.max_chunk_size)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// List all available configuration keys
    List,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

/// Arguments for the quality command
#[derive(Parser)]
pub struct QualityArgs {
    /// Measured round-trip time (e.g., 40ms)
    #[arg(long)]
    pub rtt: Option<String>,

    /// Measured bandwidth in megabits per second
    #[arg(long)]
    pub bandwidth: Option<f64>,

    /// Also show the stall timeout for a file of this many bytes
    #[arg(long)]
    pub size: Option<u64>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
