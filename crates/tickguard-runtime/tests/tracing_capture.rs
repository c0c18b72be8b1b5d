#![forbid(unsafe_code)]

//! Structured logging integration tests.
//!
//! Capture spans and events emitted by the scheduler and the core
//! primitives with a `tracing-subscriber` layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tickguard_core::{
    ArenaReconciler, CallbackError, DeferredMarks, Priority, TargetArena, TargetHandle,
};
use tickguard_runtime::{SchedulerConfig, TickScheduler};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;

// ============================================================================
// Test Infrastructure
// ============================================================================

#[derive(Debug, Clone)]
struct CapturedSpan {
    name: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: tracing::Level,
    message: String,
    fields: HashMap<String, String>,
    span: Option<String>,
}

#[derive(Default, Clone)]
struct CaptureHandle {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureHandle {
    fn spans(&self) -> Vec<CapturedSpan> {
        self.spans.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    fn warnings(&self) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == tracing::Level::WARN)
            .collect()
    }
}

struct Capture(CaptureHandle);

struct FieldVisitor(Vec<(String, String)>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .push((field.name().to_string(), format!("{value:?}")));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> tracing_subscriber::Layer<S> for Capture
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        _id: &tracing::span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        attrs.record(&mut visitor);
        self.0.spans.lock().unwrap().push(CapturedSpan {
            name: attrs.metadata().name().to_string(),
            fields: visitor.0.into_iter().collect(),
        });
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        let mut fields: HashMap<String, String> = visitor.0.into_iter().collect();
        let message = fields.remove("message").unwrap_or_default();
        let span = ctx.lookup_current().map(|s| s.name().to_string());
        self.0.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            fields,
            span,
        });
    }
}

fn with_capture<F: FnOnce()>(f: F) -> CaptureHandle {
    let handle = CaptureHandle::default();
    let subscriber = tracing_subscriber::registry().with(Capture(handle.clone()));
    tracing::subscriber::with_default(subscriber, f);
    handle
}

fn noop(_: TargetHandle, _: &mut (), _: &mut DeferredMarks) -> Result<(), CallbackError> {
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn tick_runs_inside_scheduler_span() {
    let handle = with_capture(|| {
        let mut s = TickScheduler::<u8>::new(SchedulerConfig::default()).unwrap();
        let mut arena = TargetArena::new();
        let now = Instant::now();
        s.tick_at(now, &mut ArenaReconciler::new(&mut arena, noop));
        s.tick_at(now, &mut ArenaReconciler::new(&mut arena, noop));
    });

    let ticks: Vec<_> = handle
        .spans()
        .into_iter()
        .filter(|s| s.name == "scheduler_tick")
        .collect();
    assert_eq!(ticks.len(), 2);
    assert_eq!(ticks[0].fields.get("tick").map(String::as_str), Some("1"));
    assert_eq!(ticks[1].fields.get("tick").map(String::as_str), Some("2"));

    let complete = handle
        .events()
        .into_iter()
        .find(|e| e.message.contains("tick complete"))
        .expect("tick summary event");
    assert_eq!(complete.span.as_deref(), Some("scheduler_tick"));
}

#[test]
fn failing_batch_handler_logs_warning_with_key() {
    let handle = with_capture(|| {
        let mut s = TickScheduler::<u8>::new(SchedulerConfig::default()).unwrap();
        s.register_coalesced_source("UNIT_HEALTH", "health", Priority::High, Duration::from_millis(16))
            .unwrap();
        s.on_batch("health", Box::new(|_, _| Err(CallbackError::new("bar missing"))))
            .unwrap();
        let base = Instant::now();
        s.dispatch_at("UNIT_HEALTH", 1, base);
        let mut arena = TargetArena::new();
        let report = s.tick_at(
            base + Duration::from_millis(16),
            &mut ArenaReconciler::new(&mut arena, noop),
        );
        assert_eq!(report.flushed.flushed[0].failures, 1);
    });

    let warnings = handle.warnings();
    let failure = warnings
        .iter()
        .find(|e| e.message.contains("handler failed"))
        .expect("handler failure warning");
    assert_eq!(failure.fields.get("key").map(String::as_str), Some("health"));
    assert!(failure.fields["error"].contains("bar missing"));
    assert_eq!(failure.span.as_deref(), Some("scheduler_tick"));
}

#[test]
fn dropped_event_logs_reason() {
    let handle = with_capture(|| {
        let mut s = TickScheduler::<u8>::new(SchedulerConfig::default()).unwrap();
        s.dispatch_at("UNIT_POWER", 1, Instant::now());
    });

    let warnings = handle.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].fields.get("reason").map(String::as_str),
        Some("unregistered")
    );
    assert_eq!(
        warnings[0].fields.get("key").map(String::as_str),
        Some("UNIT_POWER")
    );
}

#[test]
fn ignored_env_override_is_logged() {
    let handle = with_capture(|| {
        let config = SchedulerConfig::from_lookup(|name| {
            (name == "TICKGUARD_WINDOW").then(|| "lots".to_string())
        });
        assert_eq!(config.budget.window, SchedulerConfig::default().budget.window);
    });

    let warnings = handle.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].fields.get("variable").map(String::as_str),
        Some("TICKGUARD_WINDOW")
    );
}

#[test]
fn stale_targets_are_traced_not_warned() {
    let handle = with_capture(|| {
        let mut s = TickScheduler::<u8>::new(SchedulerConfig::default()).unwrap();
        let mut arena: TargetArena<()> = TargetArena::new();
        let gone = arena.insert(());
        arena.remove(gone);
        let now = Instant::now();
        s.mark_dirty_at(gone, "layout", Priority::Medium, now);
        let report = s.tick_at(now, &mut ArenaReconciler::new(&mut arena, noop));
        assert_eq!(report.dirty.skipped_stale, 1);
    });

    assert!(handle.warnings().is_empty());
    assert!(
        handle
            .events()
            .iter()
            .any(|e| e.level == tracing::Level::TRACE && e.message.contains("stale"))
    );
}
