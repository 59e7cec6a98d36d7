//! EventSink port - where run progress goes

use std::sync::Mutex;

use crate::services::logging::LogEvent;

/// Receives progress events from a run.
///
/// Sinks must not fail the run: errors are handled inside `emit`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LogEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &LogEvent) {}
}

/// Keeps events in memory, for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Rendered event strings, in order
    pub fn messages(&self) -> Vec<String> {
        self.events().iter().map(LogEvent::message).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
