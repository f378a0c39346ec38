//! Structured event recording
//!
//! The camera layer reports lifecycle and fault events through an injected
//! [`EventSink`]. The sink never fails from the caller's point of view;
//! storage and delivery are the collaborator's problem.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub severity: Severity,
    pub component: String,
    pub message: String,
    pub context: Vec<(String, String)>,
}

impl Event {
    pub fn new(severity: Severity, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            component: component.into(),
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink for structured events. Implementations must not panic.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &Event) {
        let component = event.component.as_str();
        let context = ContextFields(&event.context);
        match event.severity {
            Severity::Debug => debug!(component, %context, "{}", event.message),
            Severity::Info => info!(component, %context, "{}", event.message),
            Severity::Warning => warn!(component, %context, "{}", event.message),
            Severity::Error | Severity::Critical => {
                error!(component, severity = %event.severity, %context, "{}", event.message)
            }
        }
    }
}

struct ContextFields<'a>(&'a [(String, String)]);

impl fmt::Display for ContextFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Keeps every event in memory, and optionally forwards to another sink.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    forward: Option<Box<dyn EventSink>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(sink: impl EventSink + 'static) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(Box::new(sink)),
        }
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count_where(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &Event) {
        self.events.lock().push(event.clone());
        if let Some(forward) = &self.forward {
            forward.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_context() {
        let sink = RecordingSink::new();
        sink.record(
            &Event::new(Severity::Warning, "d435", "frame dropped")
                .with("frame_number", 12)
                .with("stream", "depth"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].context_value("frame_number"), Some("12"));
        assert_eq!(events[0].context_value("stream"), Some("depth"));
        assert_eq!(sink.count_where(|e| e.severity >= Severity::Warning), 1);
    }

    #[test]
    fn context_formats_as_key_value_pairs() {
        let ctx = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "x".to_string())];
        assert_eq!(ContextFields(&ctx).to_string(), "a=1 b=x");
    }
}
