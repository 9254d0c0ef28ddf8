//! Pitwall Core Library
//!
//! This crate provides the telemetry data model, the per-driver rolling
//! baselines, the anomaly scorer, and the sample source trait.

pub mod baseline;
pub mod model;
pub mod scorer;
pub mod source;
pub mod units;

pub use baseline::BaselineStore;
pub use model::{AnomalyVerdict, Assessment, Feature, FeatureVector, RadioMessage, TelemetrySample};
pub use scorer::AnomalyScorer;
pub use source::{SampleSource, SourceError};
