//! Event sinks for pipeline observability.
//!
//! Sinks are passed explicitly to the scheduler; there is no process-wide
//! sink, so independent pipeline runs in one process do not interfere.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
