//! Notification events and the pluggable dispatcher sink (component G).
//!
//! Two event kinds are mandatory: `step-failed` and `step-paused`. The
//! dispatcher hands events to a [`NotificationSink`] implementation; sinks
//! are expected to be cheap to construct and fast to call, since dispatch
//! happens inline with the scheduler's resolve step (the scheduler itself
//! never blocks on a sink's IO taking its own sweet time, but nothing here
//! forces a sink to be async internally).

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The two mandatory notification kinds. A sink may ignore either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StepFailed,
    StepPaused,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepFailed => "step-failed",
            Self::StepPaused => "step-paused",
        }
    }
}

/// Payload common to both mandatory event kinds, with the pause-only field
/// left `None` for `step-failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub run_id: String,
    pub step_id: String,
    pub attempts: u32,
    pub iteration_count: u32,
    /// Tail of the most recent attempt log, if one exists.
    pub log_tail: Option<String>,
    /// Present only for `step-paused`.
    pub manual_input_path: Option<String>,
}

/// A single notification: the event kind plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub payload: NotificationPayload,
}

impl NotificationEvent {
    pub fn step_failed(payload: NotificationPayload) -> Self {
        Self {
            kind: EventKind::StepFailed,
            payload,
        }
    }

    pub fn step_paused(payload: NotificationPayload) -> Self {
        Self {
            kind: EventKind::StepPaused,
            payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": self.kind.as_str(),
            "payload": self.payload,
        })
    }
}

/// A pluggable notification sink. Failures are the sink's own business to
/// report (e.g. by logging); the dispatcher never propagates a sink error
/// back into the scheduler, matching the "notification failures never abort
/// the run" contract.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &NotificationEvent);
}

/// Discards every event. Useful as a default when no sink is configured.
#[derive(Debug, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _event: &NotificationEvent) {}
}

/// Emits a structured log record per event through the ambient tracing
/// stack. Ships as a sane default a host can use without wiring an external
/// transport.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &NotificationEvent) {
        match event.kind {
            EventKind::StepFailed => {
                warn!(
                    run_id = %event.payload.run_id,
                    step_id = %event.payload.step_id,
                    attempts = event.payload.attempts,
                    iteration_count = event.payload.iteration_count,
                    "step-failed"
                );
            }
            EventKind::StepPaused => {
                info!(
                    run_id = %event.payload.run_id,
                    step_id = %event.payload.step_id,
                    manual_input_path = ?event.payload.manual_input_path,
                    "step-paused"
                );
            }
        }
    }
}

/// Dispatches notifications to a configured sink. A sink that panics or
/// otherwise misbehaves is a sink bug, not a scheduler concern: this type
/// never catches anything on the sink's behalf, it simply never blocks the
/// scheduler on dispatch succeeding.
pub struct NotificationDispatcher {
    sink: Box<dyn NotificationSink>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub fn new(sink: Box<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn noop() -> Self {
        Self::new(Box::new(NoopSink))
    }

    pub fn notify(&self, event: NotificationEvent) {
        self.sink.notify(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CapturingSink(Arc<Mutex<Vec<NotificationEvent>>>);

    impl NotificationSink for CapturingSink {
        fn notify(&self, event: &NotificationEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn event_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::StepFailed).unwrap(),
            "\"step-failed\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::StepPaused).unwrap(),
            "\"step-paused\""
        );
    }

    #[test]
    fn dispatcher_forwards_events_to_sink() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = CapturingSink(captured.clone());
        let dispatcher = NotificationDispatcher::new(Box::new(sink));
        dispatcher.notify(NotificationEvent::step_failed(NotificationPayload {
            run_id: "r1".into(),
            step_id: "a".into(),
            attempts: 2,
            iteration_count: 0,
            log_tail: Some("boom".into()),
            manual_input_path: None,
        }));
        let events = captured.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StepFailed);
    }

    #[test]
    fn to_json_includes_event_name_and_payload() {
        let event = NotificationEvent::step_paused(NotificationPayload {
            run_id: "r1".into(),
            step_id: "manual".into(),
            attempts: 0,
            iteration_count: 0,
            log_tail: None,
            manual_input_path: Some("/repo/.agents/runs/r1/manual_inputs/r1__manual.json".into()),
        });
        let json = event.to_json();
        assert_eq!(json["event"], "step-paused");
        assert_eq!(json["payload"]["step_id"], "manual");
    }

    #[test]
    fn noop_sink_does_not_panic() {
        let dispatcher = NotificationDispatcher::noop();
        dispatcher.notify(NotificationEvent::step_failed(NotificationPayload {
            run_id: "r1".into(),
            step_id: "a".into(),
            attempts: 1,
            iteration_count: 0,
            log_tail: None,
            manual_input_path: None,
        }));
    }
}
