//! Tracing layer that feeds application events into the pipeline
//!
//! Every `tracing` event becomes a [`LogEntry`](crate::entry::LogEntry):
//! the event target is the logger name, the `message` field the message,
//! and everything else lands in the entry's fields. Events emitted by the
//! pipeline itself (targets under `telemetry_pipeline`) are skipped so the
//! pipeline never queues its own diagnostics.

use serde_json::Value;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::entry::{keys, Fields, Level};
use crate::pipeline::PipelineFacade;

const INTERNAL_TARGET: &str = "telemetry_pipeline";

/// Tracing layer that forwards events to a [`PipelineFacade`]
pub struct PipelineLayer {
    pipeline: Arc<PipelineFacade>,
}

impl PipelineLayer {
    pub fn new(pipeline: Arc<PipelineFacade>) -> Self {
        Self { pipeline }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Fields,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => {
                self.message = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            name => self.fields.insert(name, value),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let value_str = format!("{:?}", value);
        self.record_value(field, Value::String(value_str));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, Value::String(value.to_string()));
    }
}

impl<S> Layer<S> for PipelineLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(INTERNAL_TARGET) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // request_id doubles as the correlation id when none is given
        if visitor.fields.get(keys::CORRELATION_ID).is_none() {
            if let Some(request_id) = visitor.fields.get(keys::REQUEST_ID).cloned() {
                visitor.fields.insert(keys::CORRELATION_ID, request_id);
            }
        }

        self.pipeline.log(
            metadata.target(),
            Level::from(metadata.level()),
            visitor.message.as_deref().unwrap_or_default(),
            visitor.fields,
        );
    }
}
