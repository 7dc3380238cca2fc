//! `tracing` layer that persists events to a [`SqliteLogSink`].
//!
//! Events are tagged with the device and connection they concern. The ids
//! come from the event's own `device_id` / `connection_id` fields, falling
//! back to the nearest enclosing span that carries them.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::sink::{NewLogEntry, SqliteLogSink};

/// Which device and connection an event is about. Stored on spans.
#[derive(Clone, Debug, Default)]
struct Correlation {
    device_id: Option<u64>,
    connection_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.connection_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.device_id.is_some() && self.connection_id.is_some()
    }

    fn fill_from(&mut self, outer: &Correlation) {
        if self.device_id.is_none() {
            self.device_id = outer.device_id;
        }
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&outer.connection_id);
        }
    }

    /// Claims `value` if `field` is a correlation id.
    fn claim(&mut self, field: &Field, value: &str) -> bool {
        match field.name() {
            "device_id" => match value.parse() {
                Ok(id) => self.device_id = Some(id),
                Err(_) => return false,
            },
            "connection_id" => self.connection_id = Some(value.to_string()),
            _ => return false,
        }
        true
    }
}

#[derive(Default)]
struct Recorded {
    message: Option<String>,
    correlation: Correlation,
    extra: Map<String, Value>,
}

impl Recorded {
    fn text(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else if !self.correlation.claim(field, &value) {
            self.extra.insert(field.name().to_string(), Value::String(value));
        }
    }
}

impl Visit for Recorded {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "device_id" {
            self.correlation.device_id = Some(value);
        } else {
            self.extra.insert(field.name().to_string(), value.into());
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.text(field, format!("{value:?}"));
    }
}

/// Persists events at or above `min_level` (WARN unless overridden).
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
    min_level: Level,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self {
            sink,
            min_level: Level::WARN,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut recorded = Recorded::default();
        attrs.record(&mut recorded);
        if recorded.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(recorded.correlation);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut recorded = Recorded::default();
        event.record(&mut recorded);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if recorded.correlation.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    recorded.correlation.fill_from(outer);
                }
            }
        }

        let fields = (!recorded.extra.is_empty())
            .then(|| Value::Object(recorded.extra).to_string());
        let entry = NewLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level,
            target: event.metadata().target().to_string(),
            message: recorded.message.unwrap_or_default(),
            fields,
            device_id: recorded.correlation.device_id,
            connection_id: recorded.correlation.connection_id,
        };
        // Logging a sink failure here would recurse into this layer.
        let _ = self.sink.insert(&entry);
    }
}
