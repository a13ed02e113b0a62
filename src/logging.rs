//! Structured logging (§4.11). Every component that crosses an I/O or
//! lifecycle boundary emits `tracing` events; this module only supplies
//! the optional colorized human formatter and a convenience default
//! subscriber for tests and examples. The crate itself never calls
//! `tracing_subscriber::registry().init()` on its own.

use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Renders an entire log line in a single ANSI color keyed by level, with
/// no timestamps or targets, for embedding applications that want clean
/// console output (§4.11).
pub struct ColorizedEventFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedEventFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Installs a process-global subscriber using [`ColorizedEventFormatter`]
/// and an `RUST_LOG`-driven `EnvFilter` (default `info`), for tests and
/// examples that want console output without writing their own
/// `tracing_subscriber` setup. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init_default_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .event_format(ColorizedEventFormatter)
        .with_env_filter(filter)
        .try_init();
}

/// Installs a daily-rotating file subscriber under `log_dir/log_filename`,
/// for embedding applications that want durable logs rather than console
/// output. The returned [`WorkerGuard`] must be kept alive for the
/// duration of the process; dropping it stops the background writer
/// thread and flushes any buffered lines.
pub fn init_daily_file_subscriber(log_dir: impl AsRef<Path>, log_filename: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init();
    guard
}
