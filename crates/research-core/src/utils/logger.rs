use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "info,research_core=debug";
const DEFAULT_LOG_DIR: &str = "logs";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, for development
    Pretty,
    /// One JSON object per line, for production
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Tracing setup, read from `RUST_LOG`, `LOG_FORMAT` and `LOG_DIR`.
/// An empty `LOG_DIR` turns the rolling file off.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub filter: String,
    pub format: LogFormat,
    pub directory: Option<String>,
}

impl LogOptions {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("RUST_LOG").ok(),
            std::env::var("LOG_FORMAT").ok(),
            std::env::var("LOG_DIR").ok(),
        )
    }

    fn from_values(filter: Option<String>, format: Option<String>, dir: Option<String>) -> Self {
        Self {
            filter: filter
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format: LogFormat::parse(format.as_deref()),
            directory: match dir {
                Some(dir) if dir.trim().is_empty() => None,
                Some(dir) => Some(dir),
                None => Some(DEFAULT_LOG_DIR.to_string()),
            },
        }
    }
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer().json().with_thread_ids(true).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(false).boxed(),
    }
}

fn file_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(writer).with_ansi(false).boxed(),
    }
}

/// Installs the global subscriber from the environment. Keep the returned
/// guard alive for the process lifetime so buffered file output is flushed.
pub fn init_logger() -> Result<Option<WorkerGuard>> {
    init_logger_with(LogOptions::from_env())
}

pub fn init_logger_with(options: LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&options.filter)
        .with_context(|| format!("invalid log filter '{}'", options.filter))?;

    let mut layers = vec![console_layer(options.format)];
    let mut guard = None;

    if let Some(directory) = &options.directory {
        // <dir>/app.YYYY-MM-DD.log
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("app")
            .filename_suffix("log")
            .build(directory)
            .with_context(|| format!("cannot open log directory '{}'", directory))?;
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(file_layer(options.format, writer));
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    Ok(guard)
}
