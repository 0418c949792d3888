// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
#[cfg(feature = "gstreamer")]
use montage::BitratePreset;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "montage")]
#[command(about = "Resource graph and playback core of the Montage video editor")]
#[command(version = montage::constants::app_info::version())]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exercise preview and render actions on the in-memory engine
    Simulate {
        /// Also render while the preview is attached
        #[arg(short, long)]
        render: bool,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the active configuration
    Config,

    /// Render media files into one container
    #[cfg(feature = "gstreamer")]
    Render {
        /// Input files or URIs
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Output file path (default: ~/Videos/Montage/render_TIMESTAMP.mkv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output frame width
        #[arg(long)]
        width: Option<u32>,

        /// Output frame height
        #[arg(long)]
        height: Option<u32>,

        /// Bitrate preset (low, medium, high)
        #[arg(short, long, value_parser = cli::parse_bitrate)]
        bitrate: Option<BitratePreset>,

        /// Inputs have no audio track
        #[arg(long)]
        no_audio: bool,
    },

    /// Play a media file on the default display and audio output
    #[cfg(feature = "gstreamer")]
    Preview {
        /// Input file or URI
        input: String,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=montage=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate { render, json } => cli::simulate(config, render, json),
        Commands::Config => cli::show_config(&config),
        #[cfg(feature = "gstreamer")]
        Commands::Render {
            inputs,
            output,
            width,
            height,
            bitrate,
            no_audio,
        } => cli::render(
            config,
            inputs,
            cli::RenderOptions {
                output,
                width,
                height,
                bitrate,
                audio: !no_audio,
            },
        ),
        #[cfg(feature = "gstreamer")]
        Commands::Preview { input, duration } => cli::preview(config, input, duration),
    }
}
