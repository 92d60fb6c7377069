//! Observability for the index subsystem
//!
//! - Structured logging (JSON, one line per event)
//! - Atomic counters
//! - Begin/complete scopes
//!
//! # Principles
//!
//! 1. Observability is read-only: it never changes index state
//! 2. No async or background threads
//! 3. Deterministic output
//!
//! # Usage
//!
//! ```ignore
//! use attrindex::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::LayerCommitted, &[("structure", "12")]);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Log an event at its natural severity
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log an event with fields at its natural severity
///
/// Fatal events go to stderr; everything else is INFO on stdout.
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    if event.is_fatal() {
        Logger::fatal(event.as_str(), fields);
    } else {
        Logger::info(event.as_str(), fields);
    }
}

/// Log a per-operation event at TRACE
pub fn trace_event(event: Event, fields: &[(&str, &str)]) {
    Logger::trace(event.as_str(), fields);
}
