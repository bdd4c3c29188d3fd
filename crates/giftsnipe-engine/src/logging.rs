/*
[INPUT]:  Log level (CLI or RUST_LOG), process prefix
[OUTPUT]: Global tracing subscriber writing `[<prefix>] ` lines through a non-blocking writer
[POS]:    Observability layer - shared by the engine and launcher binaries
[UPDATE]: When changing log line layout
*/

use std::fmt;

use anyhow::{Context as _, Result, anyhow};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{Format, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Field whose value overrides the default line prefix.
pub const PREFIX_FIELD: &str = "market";

/// Event formatter that starts every line with `[<prefix>] `.
///
/// The prefix is the event's `market` field when present, otherwise the
/// process-wide default.
pub struct PrefixedFormat {
    default_prefix: String,
    inner: Format,
}

impl PrefixedFormat {
    pub fn new(default_prefix: impl Into<String>) -> Self {
        Self {
            default_prefix: default_prefix.into(),
            inner: Format::default().with_ansi(false),
        }
    }
}

impl<S, N> FormatEvent<S, N> for PrefixedFormat
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
        let mut visitor = PrefixVisitor::default();
        event.record(&mut visitor);
        let prefix = visitor.value.as_deref().unwrap_or(&self.default_prefix);
        write!(writer, "[{prefix}] ")?;
        self.inner.format_event(ctx, writer, event)
    }
}

#[derive(Default)]
struct PrefixVisitor {
    value: Option<String>,
}

impl Visit for PrefixVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == PREFIX_FIELD {
            self.value = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == PREFIX_FIELD && self.value.is_none() {
            self.value = Some(format!("{value:?}"));
        }
    }
}

fn env_filter(log_level: &str) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).context("invalid RUST_LOG")
        }
        _ => EnvFilter::try_new(log_level).context("invalid log level"),
    }
}

/// Install the global subscriber. Keep the guard alive until exit to flush logs.
pub fn init_tracing(log_level: &str, prefix: &str) -> Result<WorkerGuard> {
    let filter = env_filter(log_level)?;
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .event_format(PrefixedFormat::new(prefix))
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}
