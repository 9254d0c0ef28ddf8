//! Telemetry data model
//!
//! Defines the records that flow through the pipeline: raw samples and radio
//! messages in, derived feature vectors and baselines in the middle, anomaly
//! verdicts out. Channels use `Option<T>` because no source is required to
//! provide every channel on every sample.

use crate::units::*;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One reading for one driver at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Capture time (`ts` on the wire)
    #[serde(rename = "ts", with = "timestamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Stable driver/car identifier; empty means missing
    #[serde(default)]
    pub driver_id: String,

    /// Current lap number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lap: Option<u32>,

    /// Distance into the current lap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<Meters>,

    /// Track sector (1-3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<u8>,

    /// Fraction of the lap completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_x: Option<Fraction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kph: Option<Kph>,

    /// Throttle input (0.0 to 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_pct: Option<Fraction>,

    /// Brake input (0.0 to 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brake_pct: Option<Fraction>,

    /// Current gear (-1 = reverse, 0 = neutral, 1+ = forward gears)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gear: Option<i8>,
}

impl TelemetrySample {
    /// Create an empty sample for a driver, stamped now
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            driver_id: driver_id.into(),
            lap: None,
            distance_m: None,
            sector: None,
            track_x: None,
            speed_kph: None,
            throttle_pct: None,
            brake_pct: None,
            gear: None,
        }
    }

    pub fn with_speed(mut self, kph: f64) -> Self {
        self.speed_kph = Some(Kph(kph));
        self
    }

    pub fn with_throttle(mut self, throttle: f64) -> Self {
        self.throttle_pct = Some(Fraction(throttle));
        self
    }

    pub fn with_brake(mut self, brake: f64) -> Self {
        self.brake_pct = Some(Fraction(brake));
        self
    }

    pub fn with_gear(mut self, gear: i8) -> Self {
        self.gear = Some(gear);
        self
    }

    /// The driver id, or `None` when the sample carries none
    pub fn driver(&self) -> Option<&str> {
        let id = self.driver_id.trim();
        (!id.is_empty()).then_some(id)
    }
}

/// A transcribed team radio message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioMessage {
    #[serde(rename = "ts", with = "timestamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub team: String,

    #[serde(default)]
    pub driver_id: String,

    #[serde(default)]
    pub text: String,
}

impl RadioMessage {
    pub fn new(driver_id: impl Into<String>, team: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            team: team.into(),
            driver_id: driver_id.into(),
            text: text.into(),
        }
    }
}

/// Parse a wire timestamp: RFC 3339, or a naive ISO-8601 value taken as UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(_) => raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()),
    }
}

mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Features
// =============================================================================

/// Named numeric features evaluated by the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    SpeedKph,
    ThrottlePct,
    BrakePct,
    Gear,
    /// throttle + brake
    Aggression,
    /// speed / throttle, 0 when throttle is 0
    Efficiency,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::SpeedKph,
        Feature::ThrottlePct,
        Feature::BrakePct,
        Feature::Gear,
        Feature::Aggression,
        Feature::Efficiency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::SpeedKph => "speed_kph",
            Feature::ThrottlePct => "throttle_pct",
            Feature::BrakePct => "brake_pct",
            Feature::Gear => "gear",
            Feature::Aggression => "aggression",
            Feature::Efficiency => "efficiency",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// Features derived from one sample: raw channels plus composites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<Feature, f64>);

impl FeatureVector {
    /// Derive the feature vector for a sample
    ///
    /// Composites are only computed when all of their inputs are present.
    /// Non-finite channel values count as missing.
    pub fn from_sample(sample: &TelemetrySample) -> Self {
        let finite = |v: f64| v.is_finite().then_some(v);

        let speed = sample.speed_kph.and_then(|v| finite(v.0));
        let throttle = sample.throttle_pct.and_then(|v| finite(v.0));
        let brake = sample.brake_pct.and_then(|v| finite(v.0));
        let gear = sample.gear.map(f64::from);

        let mut features = BTreeMap::new();
        if let Some(v) = speed {
            features.insert(Feature::SpeedKph, v);
        }
        if let Some(v) = throttle {
            features.insert(Feature::ThrottlePct, v);
        }
        if let Some(v) = brake {
            features.insert(Feature::BrakePct, v);
        }
        if let Some(v) = gear {
            features.insert(Feature::Gear, v);
        }
        if let (Some(t), Some(b)) = (throttle, brake) {
            features.insert(Feature::Aggression, t + b);
        }
        if let (Some(s), Some(t)) = (speed, throttle) {
            let efficiency = if t > 0.0 { s / t } else { 0.0 };
            features.insert(Feature::Efficiency, efficiency);
        }

        Self(features)
    }

    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.0.get(&feature).copied()
    }

    pub fn insert(&mut self, feature: Feature, value: f64) {
        self.0.insert(feature, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        self.0.iter().map(|(f, v)| (*f, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Feature, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (Feature, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Baselines
// =============================================================================

/// Rolling statistics for one feature of one driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl FeatureStats {
    /// Aggregate a set of values; `None` for an empty set
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // A constant series is exact; summing it would leave rounding residue
        if min == max {
            return Some(Self { mean: min, std: 0.0, min, max, count });
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let std = if variance <= f64::EPSILON * mean * mean {
            0.0
        } else {
            variance.sqrt()
        };

        Some(Self { mean, std, min, max, count })
    }

    /// Standardized score of `value` against these stats (0 when std is 0)
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std == 0.0 {
            return 0.0;
        }
        (value - self.mean) / self.std
    }
}

/// Per-feature statistics for one driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Baseline(BTreeMap<Feature, FeatureStats>);

impl Baseline {
    pub fn get(&self, feature: Feature) -> Option<&FeatureStats> {
        self.0.get(&feature)
    }

    pub fn insert(&mut self, feature: Feature, stats: FeatureStats) {
        self.0.insert(feature, stats);
    }

    pub fn features(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, &FeatureStats)> + '_ {
        self.0.iter().map(|(f, s)| (*f, s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Feature, FeatureStats)> for Baseline {
    fn from_iter<I: IntoIterator<Item = (Feature, FeatureStats)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Snapshot of what the store knows about one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStats {
    pub driver_id: String,
    pub history_count: usize,
    pub baseline_features: Vec<Feature>,
    pub baseline_stats: Baseline,
}

// =============================================================================
// Verdicts
// =============================================================================

/// One feature that deviated beyond the threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeviation {
    pub feature: Feature,
    /// Observed value
    pub value: f64,
    /// Baseline mean
    pub baseline: f64,
    /// Signed standardized score
    pub z_score: f64,
    /// |z_score|
    pub score: f64,
}

/// Result of scoring one sample that crossed the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub driver_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub anomalies: Vec<FeatureDeviation>,
    pub top_anomaly: FeatureDeviation,
    /// min(|z_top| / 5, 1); a bounded normalization, not a probability
    pub confidence: f64,
}

/// Full outcome of evaluating one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// No driver id or no usable channels
    Skipped,
    /// Not enough history for a baseline yet
    ColdStart,
    /// Scored, nothing beyond the threshold
    Normal,
    Anomalous(AnomalyVerdict),
}

impl Assessment {
    pub fn verdict(&self) -> Option<&AnomalyVerdict> {
        match self {
            Assessment::Anomalous(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_verdict(self) -> Option<AnomalyVerdict> {
        match self {
            Assessment::Anomalous(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the sample was actually compared against a baseline
    pub fn was_scored(&self) -> bool {
        matches!(self, Assessment::Normal | Assessment::Anomalous(_))
    }
}
