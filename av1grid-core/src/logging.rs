//! Logging setup shared by the coordinator and worker binaries: a
//! compact console layer on stderr plus a rolling file appender under
//! `logs/`. Log categories (`net`, `split`, `project`) are tracing
//! targets; `RUST_LOG` overrides the console filter.

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// keeps the non-blocking writer alive for the life of the process
static WORKER_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

pub fn init_logging(file_name: &str) {
  let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", file_name);
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  WORKER_GUARD
    .set(guard)
    .expect("logging initialized twice");

  let console_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let subscriber = tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(non_blocking)
        .with_filter(LevelFilter::DEBUG),
    )
    .with(
      fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(console_filter),
    );

  tracing::subscriber::set_global_default(subscriber)
    .expect("failed to set global default subscriber");
}
