use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use skiff_core::{Server, ServerConfig, logging};
use tracing::error;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Event-driven static file server")]
#[command(version)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Append-only log file
    log_path: PathBuf,

    /// Document root (overrides SKIFF_DOC_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Worker threads (overrides SKIFF_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = match logging::open_log_file(&cli.log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("skiff: cannot open log file {}: {e}", cli.log_path.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init_file_logging(log) {
        eprintln!("skiff: failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = ServerConfig::from_env().port(cli.port);
    if let Some(root) = cli.root {
        config = config.doc_root(root);
    }
    if let Some(workers) = cli.workers {
        config = config.workers(workers);
    }

    match Server::bind(config).and_then(Server::serve) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            eprintln!("skiff: {e}");
            ExitCode::FAILURE
        }
    }
}
