//! Application state management

use crate::config::Config;
use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::registry::SubscriberRegistry;
use pitwall_core::{AnomalyScorer, BaselineStore};
use pitwall_sources::{ChannelSource, IngestHandle, SimulatedSource};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Live WebSocket subscribers
    pub registry: SubscriberRegistry,

    /// Producer side of the live ingest source
    pub ingest: IngestHandle,

    /// Requests into the dispatch loop
    pub dispatch: DispatchHandle,
}

impl AppState {
    pub fn new(registry: SubscriberRegistry, ingest: IngestHandle, dispatch: DispatchHandle) -> Self {
        Self {
            registry,
            ingest,
            dispatch,
        }
    }

    /// Wire up the whole pipeline from configuration
    ///
    /// The returned dispatcher still has to be spawned with
    /// [`Dispatcher::run`].
    pub fn from_config(config: &Config) -> (Self, Dispatcher) {
        let registry = SubscriberRegistry::new(config.subscriber_queue, config.max_delivery_failures);

        let store = BaselineStore::new(config.history_capacity, config.min_samples);
        let scorer = AnomalyScorer::new(store, config.anomaly_threshold);

        let (live, ingest) = ChannelSource::new(config.ingest_capacity, config.live_timeout);
        let fallback = SimulatedSource::new(config.simulated_drivers).with_radio_every(config.radio_every);

        let (dispatcher, dispatch) =
            Dispatcher::new(scorer, registry.clone(), Box::new(live), Box::new(fallback));
        let dispatcher = dispatcher.with_intervals(config.tick_interval, config.error_backoff);

        (Self::new(registry, ingest, dispatch), dispatcher)
    }
}
