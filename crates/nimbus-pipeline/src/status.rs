//! Phase status reporting
//!
//! Every phase is bracketed by `Start(label)` and exactly one
//! `End(ok)`. The guard enforces the pairing under early returns: a
//! guard dropped without `succeed()` reports failure.

use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Where phase events go.
pub trait StatusSink: Send + Sync {
    fn start(&self, label: &str);
    fn end(&self, label: &str, ok: bool);
}

/// Logs phases through tracing.
#[derive(Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn start(&self, label: &str) {
        info!("▶ {label}");
    }

    fn end(&self, label: &str, ok: bool) {
        if ok {
            info!("✓ {label}");
        } else {
            error!("✗ {label}");
        }
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    /// Open a phase. Call `succeed()` on the returned guard on the
    /// success path; every other exit ends the phase as failed.
    pub fn start(&self, label: &str) -> PhaseGuard {
        self.sink.start(label);
        PhaseGuard {
            sink: self.sink.clone(),
            label: label.to_string(),
            done: false,
        }
    }
}

pub struct PhaseGuard {
    sink: Arc<dyn StatusSink>,
    label: String,
    done: bool,
}

impl PhaseGuard {
    pub fn succeed(mut self) {
        self.done = true;
        self.sink.end(&self.label, true);
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if !self.done {
            self.sink.end(&self.label, false);
        }
    }
}

/// Recording sink used by tests.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StatusEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Start(String),
    End(String, bool),
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusSink for CollectingSink {
    fn start(&self, label: &str) {
        self.events
            .lock()
            .unwrap()
            .push(StatusEvent::Start(label.to_string()));
    }

    fn end(&self, label: &str, ok: bool) {
        self.events
            .lock()
            .unwrap()
            .push(StatusEvent::End(label.to_string(), ok));
    }
}

/// Check the start/end pairing invariant: every start has exactly one
/// end, and ends close in LIFO order.
pub fn pairing_is_balanced(events: &[StatusEvent]) -> bool {
    let mut stack: Vec<&str> = Vec::new();
    for event in events {
        match event {
            StatusEvent::Start(label) => stack.push(label),
            StatusEvent::End(label, _) => {
                if stack.pop() != Some(label.as_str()) {
                    return false;
                }
            }
        }
    }
    stack.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_reports_success() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = StatusReporter::new(sink.clone());

        let guard = reporter.start("Installing CAPx");
        guard.succeed();

        assert_eq!(
            sink.events(),
            vec![
                StatusEvent::Start("Installing CAPx".into()),
                StatusEvent::End("Installing CAPx".into(), true),
            ]
        );
    }

    #[test]
    fn test_dropped_guard_reports_failure() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = StatusReporter::new(sink.clone());

        fn failing_phase(reporter: &StatusReporter) -> Result<(), ()> {
            let _guard = reporter.start("Creating the workload cluster");
            Err(())
            // Early return: the guard drops and ends the phase as failed.
        }
        assert!(failing_phase(&reporter).is_err());

        assert_eq!(
            sink.events(),
            vec![
                StatusEvent::Start("Creating the workload cluster".into()),
                StatusEvent::End("Creating the workload cluster".into(), false),
            ]
        );
    }

    #[test]
    fn test_every_start_gets_exactly_one_end() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = StatusReporter::new(sink.clone());

        for i in 0..5 {
            let guard = reporter.start(&format!("phase-{i}"));
            if i % 2 == 0 {
                guard.succeed();
            }
        }

        let events = sink.events();
        let starts = events
            .iter()
            .filter(|e| matches!(e, StatusEvent::Start(_)))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, StatusEvent::End(..)))
            .count();
        assert_eq!(starts, 5);
        assert_eq!(ends, 5);
        assert!(pairing_is_balanced(&events));
    }

    #[test]
    fn test_nested_guards_end_in_lifo_order() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = StatusReporter::new(sink.clone());

        let outer = reporter.start("outer");
        let inner = reporter.start("inner");
        inner.succeed();
        outer.succeed();

        assert!(pairing_is_balanced(&sink.events()));
    }
}
