//! Type-safe wrappers for telemetry channel units
//!
//! Each channel carries a fixed engineering unit. The newtypes serialize as
//! plain numbers rounded to 4 decimal places to keep broadcast payloads small.

use serde::{Deserialize, Serialize};

/// Round f64 to 4 decimal places for compact JSON serialization
fn round4<S: serde::Serializer>(val: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((*val * 10000.0).round() / 10000.0)
}

/// Kilometres per hour
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Kph(#[serde(serialize_with = "round4")] pub f64);

impl Kph {
    pub fn to_meters_per_second(self) -> f64 {
        self.0 / 3.6
    }
}

/// Meters
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Meters(#[serde(serialize_with = "round4")] pub f64);

/// Fraction (0.0 to 1.0), used for pedal inputs and lap position
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Fraction(#[serde(serialize_with = "round4")] pub f64);

impl Fraction {
    /// Create a new fraction, clamping to [0.0, 1.0]
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    /// Convert to a 0-100 percentage
    pub fn as_percent(&self) -> f64 {
        self.0 * 100.0
    }
}
