//! Event bus (C12): a single-consumer stream of per-call progress/log/data
//! events, delivered to a user-supplied callback on the controller's
//! cooperative task.
//!
//! Every call forwards its events through one shared [`EventBus`], which
//! funnels them onto a single `mpsc` channel drained by one task. Because a
//! given call only ever has one producer (its executor pipeline or its
//! gate's reader task), arrival order is preserved per call; with multiple
//! calls in flight, the channel interleaves them in whatever order sends
//! land, which is exactly the "no cross-call ordering guarantee" spec calls
//! for.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log severity carried by a `log` event, matching `tracing`'s levels so
/// callbacks can route straight into their own logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One event emitted during a call's lifecycle.
#[derive(Debug, Clone)]
pub enum Event {
    ModuleStart {
        request_id: String,
        host: String,
        module: String,
    },
    ModuleComplete {
        request_id: String,
        host: String,
        module: String,
        replayed: bool,
    },
    Progress {
        request_id: String,
        percent: Option<f64>,
        message: String,
        current: Option<u64>,
        total: Option<u64>,
        task_id: Option<String>,
    },
    Log {
        request_id: String,
        level: LogLevel,
        message: String,
    },
    Data {
        request_id: String,
        stream: String,
        bytes: Vec<u8>,
    },
}

/// Receives every [`Event`] emitted during a context's lifetime. Exactly one
/// consumer runs at a time, so implementations are free to assume no
/// concurrent calls to `on_event`.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

impl<F: Fn(Event) + Send + Sync + 'static> EventSink for F {
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// A sink that drops every event, for contexts that don't care about
/// progress/log/data streams (only the final result and audit record).
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: Event) {}
}

/// Fan-in point for every call's events. Cloning an `EventBus` is cheap; all
/// clones feed the same consumer task.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Start the consumer task and return a handle to feed it plus its
    /// `JoinHandle`, so a context can await it finishing after the last
    /// `EventBus` clone is dropped (closing the channel).
    pub fn spawn(sink: impl EventSink) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.on_event(event);
            }
        });
        (Self { tx }, handle)
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Convert a raw gate `event` frame payload into the matching [`Event`]
/// variant for a given in-flight call. Free-text fields (`Progress::message`,
/// `Log::message`) are passed through `no_log` so a module that forgot to
/// scrub a bound secret out of its own log line still doesn't leak it onto
/// the event stream.
pub fn from_gate_event(
    request_id: &str,
    kind: crate::gate::frame::EventKind,
    payload: Value,
    no_log: &crate::secrets::no_log::NoLogRegistry,
) -> Event {
    use crate::gate::frame::EventKind as Kind;
    match kind {
        Kind::Progress => Event::Progress {
            request_id: request_id.to_string(),
            percent: payload.get("percent").and_then(Value::as_f64),
            message: no_log.redact(payload.get("message").and_then(Value::as_str).unwrap_or_default()),
            current: payload.get("current").and_then(Value::as_u64),
            total: payload.get("total").and_then(Value::as_u64),
            task_id: payload.get("task_id").and_then(Value::as_str).map(str::to_string),
        },
        Kind::Log => Event::Log {
            request_id: request_id.to_string(),
            level: parse_level(payload.get("level").and_then(Value::as_str).unwrap_or("info")),
            message: no_log.redact(payload.get("message").and_then(Value::as_str).unwrap_or_default()),
        },
        Kind::Data => Event::Data {
            request_id: request_id.to_string(),
            stream: payload.get("stream").and_then(Value::as_str).unwrap_or("stdout").to_string(),
            bytes: payload
                .get("bytes")
                .and_then(Value::as_str)
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
        },
    }
}

fn parse_level(s: &str) -> LogLevel {
    match s.to_ascii_lowercase().as_str() {
        "trace" => LogLevel::Trace,
        "debug" => LogLevel::Debug,
        "warn" | "warning" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn delivers_events_in_send_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        let (bus, handle) = EventBus::spawn(move |event: Event| {
            sink_received.lock().unwrap().push(event);
        });

        bus.emit(Event::ModuleStart {
            request_id: "r1".to_string(),
            host: "web1".to_string(),
            module: "ftl2.builtin.debug".to_string(),
        });
        bus.emit(Event::ModuleComplete {
            request_id: "r1".to_string(),
            host: "web1".to_string(),
            module: "ftl2.builtin.debug".to_string(),
            replayed: false,
        });

        drop(bus);
        handle.await.unwrap();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::ModuleStart { .. }));
        assert!(matches!(events[1], Event::ModuleComplete { .. }));
    }

    #[test]
    fn converts_progress_payload() {
        let no_log = crate::secrets::no_log::NoLogRegistry::new();
        let event = from_gate_event(
            "r1",
            crate::gate::frame::EventKind::Progress,
            serde_json::json!({"percent": 42.0, "message": "halfway"}),
            &no_log,
        );
        match event {
            Event::Progress { percent, message, .. } => {
                assert_eq!(percent, Some(42.0));
                assert_eq!(message, "halfway");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn redacts_registered_secrets_from_log_message() {
        let no_log = crate::secrets::no_log::NoLogRegistry::new();
        no_log.register("s3kr1t");
        let event = from_gate_event(
            "r1",
            crate::gate::frame::EventKind::Log,
            serde_json::json!({"level": "info", "message": "connecting with token s3kr1t"}),
            &no_log,
        );
        match event {
            Event::Log { message, .. } => {
                assert!(!message.contains("s3kr1t"));
                assert!(message.contains("[REDACTED]"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
