//! Anomaly scoring against per-driver baselines

use crate::baseline::BaselineStore;
use crate::model::{
    AnomalyVerdict, Assessment, Baseline, DriverStats, FeatureDeviation, FeatureVector,
    TelemetrySample,
};
use tracing::{debug, warn};

pub const DEFAULT_THRESHOLD: f64 = 2.5;

/// |z| at which confidence saturates to 1.0
const CONFIDENCE_SCALE: f64 = 5.0;

/// Scores samples against the driver's own rolling baseline
///
/// The scorer owns its [`BaselineStore`]; whoever owns the scorer owns all
/// per-driver state.
#[derive(Debug)]
pub struct AnomalyScorer {
    store: BaselineStore,
    threshold: f64,
}

impl AnomalyScorer {
    pub fn new(store: BaselineStore, threshold: f64) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BaselineStore {
        &mut self.store
    }

    /// Score a sample, returning a verdict only when it is anomalous
    pub fn score(&mut self, sample: &TelemetrySample) -> Option<AnomalyVerdict> {
        self.evaluate(sample).into_verdict()
    }

    /// Record the sample into the driver's history and assess it
    pub fn evaluate(&mut self, sample: &TelemetrySample) -> Assessment {
        let Some(driver_id) = sample.driver() else {
            debug!("Dropping sample without driver id");
            return Assessment::Skipped;
        };

        let features = FeatureVector::from_sample(sample);
        if features.is_empty() {
            debug!("Dropping sample for {} without usable channels", driver_id);
            return Assessment::Skipped;
        }

        self.store.record(driver_id, features.clone());
        self.store.refresh_baseline(driver_id);

        let Some(baseline) = self.store.get_baseline(driver_id) else {
            return Assessment::ColdStart;
        };

        let anomalies = find_deviations(&features, baseline, self.threshold);
        let Some(top_anomaly) = top_deviation(&anomalies) else {
            return Assessment::Normal;
        };

        Assessment::Anomalous(AnomalyVerdict {
            is_anomaly: true,
            driver_id: driver_id.to_string(),
            timestamp: sample.timestamp,
            confidence: (top_anomaly.score / CONFIDENCE_SCALE).min(1.0),
            top_anomaly,
            anomalies,
        })
    }

    pub fn stats(&self, driver_id: &str) -> DriverStats {
        self.store.stats(driver_id)
    }

    pub fn reset(&mut self, driver_id: &str) {
        self.store.reset(driver_id);
    }
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new(BaselineStore::default(), DEFAULT_THRESHOLD)
    }
}

/// Every feature present in both the vector and the baseline whose |z|
/// exceeds `threshold`, in feature order
pub fn find_deviations(
    features: &FeatureVector,
    baseline: &Baseline,
    threshold: f64,
) -> Vec<FeatureDeviation> {
    features
        .iter()
        .filter_map(|(feature, value)| {
            let stats = baseline.get(feature)?;
            let z_score = stats.z_score(value);
            if !z_score.is_finite() {
                warn!("Non-finite z-score for {} (value {}), skipping", feature, value);
                return None;
            }
            (z_score.abs() > threshold).then_some(FeatureDeviation {
                feature,
                value,
                baseline: stats.mean,
                z_score,
                score: z_score.abs(),
            })
        })
        .collect()
}

/// The deviation with the largest |z|; the first one wins ties
pub fn top_deviation(deviations: &[FeatureDeviation]) -> Option<FeatureDeviation> {
    let (first, rest) = deviations.split_first()?;
    Some(rest.iter().fold(*first, |best, d| if d.score > best.score { *d } else { best }))
}
