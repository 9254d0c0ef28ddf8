//! Sample source trait definition

use crate::model::{RadioMessage, TelemetrySample};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {0} is closed")]
    Closed(String),

    #[error("source {source_name} failed: {reason}")]
    Failed { source_name: String, reason: String },
}

/// Trait for producers of telemetry samples and radio messages
///
/// Each source is responsible for:
/// - Reporting whether it currently has a live upstream
/// - Handing over whatever arrived since the last poll
/// - Releasing its upstream on close
pub trait SampleSource: Send {
    /// Get the name of this source (e.g., "simulated", "live-ingest")
    fn name(&self) -> &str;

    /// Whether the upstream is currently delivering
    ///
    /// This should be a lightweight check; it runs once per tick.
    fn is_connected(&self) -> bool;

    /// Drain the samples available right now
    ///
    /// Returns an empty vec when nothing arrived. Must not block beyond a
    /// short bounded timeout.
    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError>;

    /// Drain the radio messages available right now
    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError>;

    /// Called on ticks served by another source
    ///
    /// Time-driven sources restart their clock here so the next poll only
    /// covers the time since this tick.
    fn skip_tick(&mut self) {}

    /// Release the upstream. Further polls return `SourceError::Closed`.
    fn close(&mut self);
}
