//! Tracing capture helper for tests that assert on engine log output.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event as TracingEvent, Level, Subscriber, dispatcher};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Field value with surrounding quotes stripped.
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| v.trim_matches('"').to_string())
    }
}

/// Events recorded while the capture guard is alive.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<CapturedEvent>>>);

impl Captured {
    pub fn all(&self) -> Vec<CapturedEvent> {
        self.0.lock().unwrap().clone()
    }

    /// Events at `level` whose message contains `needle`.
    pub fn matching(&self, level: Level, needle: &str) -> Vec<CapturedEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .collect()
    }
}

struct CaptureLayer {
    events: Captured,
}

struct FieldCapture<'a> {
    fields: &'a mut BTreeMap<String, String>,
}

impl Visit for FieldCapture<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: LayerContext<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut FieldCapture { fields: &mut fields });
        let message = fields.get("message").cloned().unwrap_or_default();
        self.events.0.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            fields,
        });
    }
}

/// Install a thread-local subscriber that captures every event.
///
/// Hold the guard for the duration of the test; tests using this must run on
/// the current-thread runtime (the `#[tokio::test]` default).
pub fn install_tracing_capture() -> (Captured, dispatcher::DefaultGuard) {
    let captured = Captured::default();
    let collector = tracing_subscriber::registry()
        .with(CaptureLayer {
            events: captured.clone(),
        })
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(collector));
    (captured, guard)
}
