//! Structured logging setup: an `EnvFilter` (env override wins) over a
//! `fmt` layer. The `[logging]` section additionally lets the filter be
//! disabled entirely and names a directory to append a log file under.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

pub fn init_logging(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.dir {
        Some(dir) => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("failed to create log directory {dir}: {err}, logging to stdout");
                init_stdout(filter);
                return;
            }
            let path = std::path::Path::new(dir).join("gordon.log");
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    tracing_subscriber::registry()
                        .with(
                            fmt::layer()
                                .with_writer(Mutex::new(file))
                                .with_ansi(false),
                        )
                        .with(filter)
                        .init();
                }
                Err(err) => {
                    eprintln!("failed to open log file {}: {err}, logging to stdout", path.display());
                    init_stdout(filter);
                }
            }
        }
        None => init_stdout(filter),
    }
}

fn init_stdout(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
