//! Logging setup with hostname and rank prefixes
//!
//! Every rank of a job typically logs into the same terminal or a shared
//! filesystem, so each line carries the originating hostname and rank. The
//! formatter writes plain text without ANSI colors so log files stay
//! greppable.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::LogTarget;

/// Event formatter prefixing each line with `[hostname/N]` where `N` is the
/// job rank.
pub struct RankFormatter {
    prefix: String,
}

impl RankFormatter {
    pub fn new(rank: Option<i32>) -> Self {
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("unknown")
            .to_string();
        let prefix = match rank {
            Some(rank) => format!("{}/{}", hostname, rank),
            None => hostname,
        };
        Self { prefix }
    }
}

impl<S, N> FormatEvent<S, N> for RankFormatter
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
        let meta = event.metadata();

        let now = std::time::SystemTime::now();
        let datetime: chrono::DateTime<chrono::Utc> = now.into();

        write!(writer, "[{}] ", self.prefix)?;
        write!(writer, "{} ", datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        write!(writer, "{:5} ", meta.level())?;
        write!(writer, "{}: ", meta.target())?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Map a repeatable `-v` count onto a default filter directive.
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Errors raised while opening the log destination.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file `{path}`: {source}")]
    OpenFailed {
        path: String,
        source: std::io::Error,
    },
}

/// Initialize tracing for the daemon according to its log target.
///
/// `RUST_LOG` overrides the verbosity-derived filter when set. With
/// [`LogTarget::Disabled`] no subscriber is installed and all log macros
/// become no-ops.
pub fn init_daemon(target: &LogTarget, verbose: u8, rank: i32) -> Result<(), LoggingError> {
    match target {
        LogTarget::Disabled => Ok(()),
        LogTarget::Stdout => {
            init_with_writer(verbose, Some(rank), std::io::stdout);
            Ok(())
        }
        LogTarget::File(path) => {
            let file = open_log_file(path)?;
            init_with_writer(verbose, Some(rank), Arc::new(file));
            Ok(())
        }
    }
}

/// Initialize stderr tracing for client commands, which reserve stdout for
/// stream data.
pub fn init_client(verbose: u8) {
    if verbose == 0 {
        return;
    }
    init_with_writer(verbose, None, std::io::stderr);
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    File::create(path).map_err(|source| LoggingError::OpenFailed {
        path: path.display().to_string(),
        source,
    })
}

fn init_with_writer<W>(verbose: u8, rank: Option<i32>, writer: W)
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbose)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(RankFormatter::new(rank))
        .with_ansi(false)
        .with_writer(writer);

    // a second init (e.g. in tests) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
