//! weft CLI — demo and diagnostics for the weft runtime.
//!
//! Subcommands:
//! - `echo`: TCP echo server over a reactor pool, graceful on SIGINT/SIGTERM.
//! - `fetch`: stream a `gs://` object to stdout via the range reader.
//! - `linecount`: pipeline-style line count across files using channels,
//!   per-reactor fibers, and the offload pool.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use error::CliError;

#[derive(Parser)]
#[command(name = "weft", version = weft::VERSION, about = "weft runtime demos")]
struct Cli {
    /// Default log filter (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TCP echo server until SIGINT/SIGTERM.
    Echo {
        /// Port to listen on; 0 picks an ephemeral port.
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Number of reactors; defaults to the hardware parallelism.
        #[arg(long)]
        reactors: Option<usize>,
    },

    /// Stream an object to stdout.
    Fetch {
        /// Object path, e.g. gs://bucket/path/to/object.
        path: String,

        /// Object-store API base URL (point at an emulator for testing).
        #[arg(long, default_value = weft::object_store::DEFAULT_BASE_URL)]
        base_url: String,

        /// Bearer token for the object store.
        #[arg(long, env = "WEFT_ACCESS_TOKEN", default_value = "")]
        token: String,
    },

    /// Count lines across files using the full runtime stack.
    Linecount {
        /// Input files.
        files: Vec<PathBuf>,

        /// Number of reactors; defaults to the hardware parallelism.
        #[arg(long)]
        reactors: Option<usize>,

        /// Offload worker threads; 0 means hardware parallelism.
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    weft::logging::init_logging(&cli.log_level);

    let result: Result<(), CliError> = match cli.command {
        Commands::Echo { port, reactors } => commands::echo::run(port, reactors),
        Commands::Fetch {
            path,
            base_url,
            token,
        } => commands::fetch::run(path, base_url, token),
        Commands::Linecount {
            files,
            reactors,
            workers,
        } => commands::linecount::run(files, reactors, workers),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
