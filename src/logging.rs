// Logging setup
//
// Two sinks share one env filter:
// - the console, human readable (JSON when running under systemd)
// - an append-only log file with one `<timestamp> - <LEVEL> - <message>` line per event

use anyhow::{Context, Result};
use chrono::Local;
use std::env;
use std::fmt;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

/// Event format for the log file: `2024-03-07 23:00:04,512 - INFO - message`
pub struct LogLineFormat;

impl<S, N> FormatEvent<S, N> for LogLineFormat
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
        write!(
            writer,
            "{} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initializes the logging subsystem
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive until the process exits.
///
/// # Log Levels
/// Default: INFO. Can be overridden with `RUST_LOG`.
pub fn init_logging(log_file: &Path) -> Result<WorkerGuard> {
    let directory = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log path {} has no file name", log_file.display()))?;

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt_layer::layer()
        .with_ansi(false)
        .event_format(LogLineFormat)
        .with_writer(file_writer);

    // Systemd sets INVOCATION_ID
    if env::var("INVOCATION_ID").is_ok() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(fmt_layer::layer().json())
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(fmt_layer::layer().with_target(false).with_ansi(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(guard)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// In-memory writer that keeps everything the file layer would write
    #[derive(Clone, Default)]
    pub struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        /// Everything written so far, as text
        pub fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        /// Subscriber formatting events exactly like the log file
        pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
            tracing_subscriber::registry().with(
                fmt_layer::layer()
                    .with_ansi(false)
                    .event_format(LogLineFormat)
                    .with_writer(self.clone()),
            )
        }
    }

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}
