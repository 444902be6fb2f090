// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use daltocam::{Simulation, VisionType};
use daltocam::constants::app;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "daltocam")]
#[command(about = "Live camera preview through a color vision deficiency simulation")]
#[command(version = app::version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available capture devices
    List {
        /// List the built-in test pattern devices instead
        #[arg(long)]
        synthetic: bool,
    },

    /// Run the capture pipeline and report frame statistics
    Preview {
        /// Device index to use (from 'daltocam list'); defaults to the last used device
        #[arg(short, long)]
        device: Option<usize>,

        /// How long to run, in seconds
        #[arg(short = 't', long, default_value = "10")]
        duration: u64,

        /// Vision type to simulate; defaults to the stored preference
        #[arg(short, long)]
        vision: Option<VisionType>,

        /// Simulation algorithm (machado, hcirn); defaults to the stored preference
        #[arg(short, long)]
        simulation: Option<Simulation>,

        /// Use the built-in test pattern instead of a camera
        #[arg(long)]
        synthetic: bool,

        /// Skip the GPU and deliver raw frames
        #[arg(long)]
        no_render: bool,

        /// Save the last delivered frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Filter a still image
    Simulate {
        /// Input image
        input: PathBuf,

        /// Vision type to simulate
        #[arg(short, long)]
        vision: VisionType,

        /// Simulation algorithm (machado, hcirn); defaults to the stored preference
        #[arg(short, long)]
        simulation: Option<Simulation>,

        /// Output PNG (default: next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Filter on the CPU instead of the GPU
        #[arg(long)]
        cpu: bool,
    },

    /// List vision types and simulation algorithms
    Types,

    /// Store the vision type and simulation used by default.
    ///
    /// A running preview without --vision or --simulation picks the change up.
    Select {
        vision: Option<VisionType>,

        #[arg(short, long)]
        simulation: Option<Simulation>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=daltocam=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { synthetic } => cli::list_devices(synthetic),
        Commands::Preview {
            device,
            duration,
            vision,
            simulation,
            synthetic,
            no_render,
            output,
        } => cli::preview(cli::PreviewOptions {
            device,
            duration,
            vision,
            simulation,
            synthetic,
            render: !no_render,
            output,
        }),
        Commands::Simulate {
            input,
            vision,
            simulation,
            output,
            cpu,
        } => cli::simulate(&input, vision, simulation, output, cpu),
        Commands::Types => cli::list_vision_types(),
        Commands::Select { vision, simulation } => cli::select_preferences(vision, simulation),
    }
}
