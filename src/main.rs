use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod adaptive;
mod calibration;
mod classifier;
mod cli;
mod config;
mod coordinator;
mod error;
mod memory;
#[cfg(test)]
mod testing;
mod types;

use types::Target;

#[derive(Parser)]
#[command(name = "leafcare")]
#[command(version)]
#[command(about = "Coffee leaf diagnosis that learns from your corrections")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose an image or every image in a directory
    Diagnose {
        /// Image file or directory
        path: PathBuf,

        /// Confirmed disease label, applied as feedback to every image
        #[arg(long)]
        disease: Option<String>,

        /// Confirmed deficiency label, applied as feedback to every image
        #[arg(long)]
        deficiency: Option<String>,

        /// Print JSON lines instead of a report
        #[arg(long)]
        json: bool,
    },

    /// Read JSON requests on stdin and answer each on stdout
    Session,

    /// Answer JSON requests on a Unix socket
    Serve {
        /// Socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// List the classes a target can predict
    Classes {
        /// disease or deficiency (omit for both)
        #[arg(short, long)]
        target: Option<Target>,
    },

    /// View or set configuration
    Config {
        /// Config key, e.g. learning.memory_capacity
        key: Option<String>,

        /// Config value
        value: Option<String>,

        /// List available classifier backends
        #[arg(long)]
        list_backends: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Diagnose {
            path,
            disease,
            deficiency,
            json,
        } => cli::diagnose::run_diagnose(&path, disease.as_deref(), deficiency.as_deref(), json),
        Commands::Session => cli::session::run_session(),
        Commands::Serve { socket } => cli::server::run_serve(socket),
        Commands::Classes { target } => cli::config::run_classes(target),
        Commands::Config {
            key,
            value,
            list_backends,
        } => cli::config::run_config(key.as_deref(), value.as_deref(), list_backends),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
