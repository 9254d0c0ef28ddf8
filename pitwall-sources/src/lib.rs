//! Telemetry sample sources for Pitwall

pub mod channel;
pub mod simulated;

pub use channel::{ChannelSource, IngestError, IngestHandle};
pub use simulated::SimulatedSource;
