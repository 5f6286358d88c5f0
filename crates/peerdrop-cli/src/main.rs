//! PeerDrop CLI - tools for the PeerDrop transfer protocol
//!
//! The `peerdrop` binary drives the transfer core without a browser:
//! it can run a full host/client transfer over an in-memory channel,
//! manage the protocol configuration, and show how the adaptive
//! chunking reacts to a given link.
//!
//! ## Quick Start
//!
//! ```bash
//! # Transfer files between two in-process peers over a 20ms link
//! peerdrop loopback ./video.mp4 --latency 20ms --output ./received
//!
//! # Inspect the chunk size chosen for a slow link
//! peerdrop quality --rtt 250ms --bandwidth 1.5
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]
#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Loopback(args) => commands::loopback::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
        Command::Quality(args) => commands::quality::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,peerdrop=info,peerdrop_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
