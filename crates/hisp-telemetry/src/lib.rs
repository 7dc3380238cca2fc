//! Logging for the hisp server: JSON lines on stdout, plus an optional
//! SQLite copy of the important events that `GET /logs` can search.

mod layer;
mod sink;

pub use layer::SqliteLogLayer;
pub use sink::{LogQuery, LogRecord, SqliteLogSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info,hisp_server=debug`.
    pub filter: String,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

/// What [`init_telemetry`] set up.
pub struct Telemetry {
    sink: Option<Arc<SqliteLogSink>>,
}

impl Telemetry {
    /// The SQLite sink, if persistence is enabled and the database opened.
    pub fn log_sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.sink.clone()
    }
}

/// Install the global subscriber. Call once, before anything logs.
///
/// A log database that cannot be opened disables persistence instead of
/// failing startup; the reason is logged once the subscriber is live.
pub fn init_telemetry(config: TelemetryConfig) -> Telemetry {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let stdout = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(filter);

    let opened = config
        .log_to_sqlite
        .then(|| open_sink(&config.log_db_path));
    let sink = match &opened {
        Some(Ok(sink)) => Some(Arc::clone(sink)),
        _ => None,
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(sink.clone().map(SqliteLogLayer::new))
        .init();

    if let Some(Err(e)) = opened {
        tracing::warn!(path = %config.log_db_path.display(), error = %e, "log database unavailable, not persisting logs");
    }
    Telemetry { sink }
}

fn open_sink(path: &Path) -> Result<Arc<SqliteLogSink>, rusqlite::Error> {
    SqliteLogSink::new(path).map(Arc::new)
}
