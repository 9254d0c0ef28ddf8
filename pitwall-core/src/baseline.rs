//! Per-driver rolling baselines
//!
//! Each driver owns a bounded history of feature vectors (oldest evicted
//! first) and the baseline last computed from it. Drivers never share state.

use crate::model::{Baseline, DriverStats, Feature, FeatureStats, FeatureVector};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::info;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_MIN_SAMPLES: usize = 10;

#[derive(Debug, Default)]
struct DriverHistory {
    history: VecDeque<FeatureVector>,
    baseline: Option<Baseline>,
}

/// Rolling per-driver feature history and baselines
#[derive(Debug)]
pub struct BaselineStore {
    capacity: usize,
    min_samples: usize,
    drivers: HashMap<String, DriverHistory>,
}

impl BaselineStore {
    /// Create a store keeping `capacity` vectors per driver and requiring
    /// `min_samples` of them before a baseline exists
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            min_samples: min_samples.clamp(1, capacity),
            drivers: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Append a feature vector to the driver's history
    ///
    /// Does not recompute the baseline; call [`refresh_baseline`](Self::refresh_baseline).
    pub fn record(&mut self, driver_id: &str, features: FeatureVector) {
        let entry = self.drivers.entry(driver_id.to_string()).or_default();
        if entry.history.len() == self.capacity {
            entry.history.pop_front();
        }
        entry.history.push_back(features);
    }

    /// Recompute the driver's baseline from its full current history
    ///
    /// Returns whether a baseline exists afterwards. Below the minimum sample
    /// count nothing is computed and any existing baseline is left untouched.
    pub fn refresh_baseline(&mut self, driver_id: &str) -> bool {
        let Some(entry) = self.drivers.get_mut(driver_id) else {
            return false;
        };
        if entry.history.len() < self.min_samples {
            return entry.baseline.is_some();
        }

        let mut columns: BTreeMap<Feature, Vec<f64>> = BTreeMap::new();
        for vector in &entry.history {
            for (feature, value) in vector.iter() {
                columns.entry(feature).or_default().push(value);
            }
        }

        let baseline = columns
            .into_iter()
            .filter_map(|(feature, values)| {
                FeatureStats::from_values(&values).map(|stats| (feature, stats))
            })
            .collect();
        entry.baseline = Some(baseline);
        true
    }

    /// The last computed baseline, if any
    pub fn get_baseline(&self, driver_id: &str) -> Option<&Baseline> {
        self.drivers.get(driver_id)?.baseline.as_ref()
    }

    /// Number of vectors currently held for the driver
    pub fn history_len(&self, driver_id: &str) -> usize {
        self.drivers.get(driver_id).map_or(0, |d| d.history.len())
    }

    /// Clear history and baseline for one driver
    pub fn reset(&mut self, driver_id: &str) {
        if self.drivers.remove(driver_id).is_some() {
            info!("Reset baseline for driver {}", driver_id);
        }
    }

    /// Drivers with any recorded history, sorted
    pub fn drivers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self, driver_id: &str) -> DriverStats {
        let baseline = self.get_baseline(driver_id).cloned().unwrap_or_default();
        DriverStats {
            driver_id: driver_id.to_string(),
            history_count: self.history_len(driver_id),
            baseline_features: baseline.features().collect(),
            baseline_stats: baseline,
        }
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_MIN_SAMPLES)
    }
}
