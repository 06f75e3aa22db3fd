//! turnstiled - handle incoming login requests and start (or stop)
//! service manager instances as necessary.
//!
//! The daemon should never exit under normal circumstances: it ends only
//! on SIGTERM/SIGINT once every child has been reaped (exit 0), or on an
//! unrecoverable condition such as a service manager that survives the
//! kill escalation (exit 1).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;

use turnstiled::config::{Config, DEFAULT_CFG_PATH};
use turnstiled::daemon;

#[derive(Parser)]
#[command(name = "turnstiled")]
#[command(about = "Per-user service manager supervision daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(default_value = DEFAULT_CFG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("turnstiled: bad configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("turnstiled: starting with backend {}", cfg.backend);
    match daemon::run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("turnstiled: {}", e);
            ExitCode::FAILURE
        }
    }
}
