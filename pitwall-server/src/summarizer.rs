//! Driver summaries triggered by team radio
//!
//! [`TemplateSummarizer`] is the built-in implementation: it classifies the
//! driver from the rolling baseline and fills a fixed template. Anything that
//! produces summaries another way (a language model, a rules engine) plugs in
//! through the [`Summarizer`] trait.

use chrono::{DateTime, Utc};
use pitwall_core::model::{Baseline, Feature, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad characterisation of how a driver is performing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceType {
    Aggressive,
    Conservative,
    Efficient,
    Struggling,
    Excellent,
}

impl PerformanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceType::Aggressive => "aggressive",
            PerformanceType::Conservative => "conservative",
            PerformanceType::Efficient => "efficient",
            PerformanceType::Struggling => "struggling",
            PerformanceType::Excellent => "excellent",
        }
    }

    fn template(&self) -> &'static str {
        match self {
            PerformanceType::Aggressive => {
                "Driver showing aggressive driving patterns with high throttle usage and late braking."
            }
            PerformanceType::Conservative => {
                "Driver maintaining conservative approach with smooth throttle application and early braking."
            }
            PerformanceType::Efficient => {
                "Driver demonstrating excellent fuel efficiency and smooth driving style."
            }
            PerformanceType::Struggling => {
                "Driver experiencing difficulties with car balance and track conditions."
            }
            PerformanceType::Excellent => {
                "Driver performing exceptionally well with optimal lap times and smooth driving."
            }
        }
    }
}

impl fmt::Display for PerformanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary pushed to the subscribers following one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub driver_id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    /// The radio text that triggered the summary
    pub context: Option<String>,
    /// Which summarizer produced the text
    pub source: String,
    pub confidence: f64,
    pub performance_type: PerformanceType,
}

/// Aggregates over one completed lap of one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapStats {
    pub lap_number: u32,
    pub data_points: usize,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub avg_throttle: f64,
    pub avg_brake: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Summary pushed to the driver's subscribers when a lap completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapSummary {
    pub driver_id: String,
    pub lap_number: u32,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub lap_stats: LapStats,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Running aggregates for the lap a driver is currently on
#[derive(Debug, Clone)]
pub struct LapAccumulator {
    lap_number: u32,
    data_points: usize,
    speed: Mean,
    max_speed: f64,
    throttle: Mean,
    brake: Mean,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl LapAccumulator {
    pub fn new(lap_number: u32) -> Self {
        Self {
            lap_number,
            data_points: 0,
            speed: Mean::default(),
            max_speed: 0.0,
            throttle: Mean::default(),
            brake: Mean::default(),
            start: None,
            end: None,
        }
    }

    pub fn lap_number(&self) -> u32 {
        self.lap_number
    }

    pub fn push(&mut self, sample: &TelemetrySample) {
        let speed = sample.speed_kph.map(|v| v.0);
        self.data_points += 1;
        self.speed.push(speed);
        if let Some(speed) = speed.filter(|v| v.is_finite()) {
            self.max_speed = self.max_speed.max(speed);
        }
        self.throttle.push(sample.throttle_pct.map(|v| v.0));
        self.brake.push(sample.brake_pct.map(|v| v.0));
        self.start.get_or_insert(sample.timestamp);
        self.end = Some(sample.timestamp);
    }

    /// `None` when no sample was pushed
    pub fn finish(&self) -> Option<LapStats> {
        Some(LapStats {
            lap_number: self.lap_number,
            data_points: self.data_points,
            avg_speed: self.speed.value(),
            max_speed: self.max_speed,
            avg_throttle: self.throttle.value(),
            avg_brake: self.brake.value(),
            start: self.start?,
            end: self.end?,
        })
    }
}

/// Produces a summary for a driver from a piece of context
pub trait Summarizer: Send {
    fn name(&self) -> &str;

    /// `None` means no summary is available; it is not an error
    fn summarize(
        &self,
        driver_id: &str,
        context: &str,
        baseline: Option<&Baseline>,
    ) -> Option<DriverSummary>;

    /// Summarize a completed lap
    fn summarize_lap(&self, _driver_id: &str, _lap: &LapStats) -> Option<LapSummary> {
        None
    }
}

// Classification thresholds over baseline means
const STRUGGLING_SPEED_KPH: f64 = 150.0;
const EXCELLENT_SPEED_KPH: f64 = 230.0;
const AGGRESSIVE_INPUT: f64 = 0.95;
const EFFICIENT_INPUT: f64 = 0.7;

const EXCELLENT_LAP_KPH: f64 = 250.0;
const GOOD_LAP_KPH: f64 = 200.0;

const CONFIDENCE: f64 = 0.8;
const COLD_CONFIDENCE: f64 = 0.5;

/// Deterministic summarizer filling fixed templates
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateSummarizer;

impl TemplateSummarizer {
    pub fn new() -> Self {
        Self
    }
}

/// Classify a driver from the baseline means of speed and combined inputs
pub fn classify(baseline: &Baseline) -> PerformanceType {
    let mean = |feature| baseline.get(feature).map(|s| s.mean);
    let speed = mean(Feature::SpeedKph);
    let aggression = mean(Feature::Aggression);

    match (speed, aggression) {
        (Some(speed), _) if speed < STRUGGLING_SPEED_KPH => PerformanceType::Struggling,
        (_, Some(inputs)) if inputs > AGGRESSIVE_INPUT => PerformanceType::Aggressive,
        (Some(speed), _) if speed >= EXCELLENT_SPEED_KPH => PerformanceType::Excellent,
        (_, Some(inputs)) if inputs < EFFICIENT_INPUT => PerformanceType::Efficient,
        _ => PerformanceType::Conservative,
    }
}

fn context_notes(context: &str) -> String {
    let lower = context.to_lowercase();
    [
        ("speed", " Notable speed variations detected."),
        ("fuel", " Fuel management strategy being implemented."),
        ("push", " Aggressive driving mode activated."),
    ]
    .iter()
    .filter(|(keyword, _)| lower.contains(keyword))
    .map(|(_, note)| *note)
    .collect()
}

impl Summarizer for TemplateSummarizer {
    fn name(&self) -> &str {
        "simulation"
    }

    fn summarize(
        &self,
        driver_id: &str,
        context: &str,
        baseline: Option<&Baseline>,
    ) -> Option<DriverSummary> {
        let (performance_type, confidence) = match baseline {
            Some(baseline) => (classify(baseline), CONFIDENCE),
            None => (PerformanceType::Conservative, COLD_CONFIDENCE),
        };

        let mut summary = performance_type.template().to_string();
        if baseline.is_none() {
            summary.push_str(" Insufficient data for a full assessment.");
        }
        summary.push_str(&context_notes(context));

        let context = context.trim();
        Some(DriverSummary {
            driver_id: driver_id.to_string(),
            timestamp: Utc::now(),
            summary,
            context: (!context.is_empty()).then(|| context.to_string()),
            source: self.name().to_string(),
            confidence,
            performance_type,
        })
    }

    fn summarize_lap(&self, driver_id: &str, lap: &LapStats) -> Option<LapSummary> {
        let n = lap.lap_number;
        let summary = if lap.avg_speed > EXCELLENT_LAP_KPH {
            format!("Outstanding lap {} with consistent high-speed performance.", n)
        } else if lap.avg_speed > GOOD_LAP_KPH {
            format!("Solid lap {} with good pace and smooth driving.", n)
        } else {
            format!("Challenging lap {} with some areas for improvement.", n)
        };

        Some(LapSummary {
            driver_id: driver_id.to_string(),
            lap_number: n,
            timestamp: Utc::now(),
            summary,
            lap_stats: lap.clone(),
            source: self.name().to_string(),
        })
    }
}
