//! Logging initialization.
//!
//! Records go to stderr by default, or to a log file when `--file` is
//! given. `RUST_LOG` overrides the level; otherwise `--verbose` selects
//! trace and the default is info.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Thread-safe log-file writer.
struct SharedWriter(Mutex<File>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Install the global subscriber.
pub fn init(log_file: Option<&Path>, verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "trace" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            // The writer lives as long as the process.
            let shared: &'static SharedWriter =
                Box::leak(Box::new(SharedWriter(Mutex::new(file))));
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_thread_names(true)
                        .with_ansi(false)
                        .with_writer(shared),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_thread_names(true)
                        .with_writer(io::stderr),
                )
                .init();
        }
    }
    Ok(())
}
