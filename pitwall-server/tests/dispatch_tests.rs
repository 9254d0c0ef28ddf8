//! Integration tests for the dispatch loop
//!
//! Drives `Dispatcher::tick` directly against real sources and reads what
//! each subscriber's queue received.

use pitwall_core::model::Baseline;
use pitwall_core::{
    AnomalyScorer, RadioMessage, SampleSource, SourceError, TelemetrySample,
};
use pitwall_server::dispatch::{Dispatcher, Mode};
use pitwall_server::summarizer::{DriverSummary, LapStats, LapSummary, Summarizer};
use pitwall_server::registry::{Message, SubscriberRegistry};
use pitwall_sources::{ChannelSource, IngestHandle, SimulatedSource};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

/// Connected source whose every poll fails
struct BrokenSource {
    polls: Arc<AtomicUsize>,
}

impl SampleSource for BrokenSource {
    fn name(&self) -> &str {
        "broken"
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Failed {
            source_name: "broken".to_string(),
            reason: "upstream went away".to_string(),
        })
    }

    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError> {
        Ok(Vec::new())
    }

    fn close(&mut self) {}
}

/// Connected source that hands out one batch of samples, then fails on radio
struct RadioFailingSource {
    pending: Vec<TelemetrySample>,
}

impl SampleSource for RadioFailingSource {
    fn name(&self) -> &str {
        "radio-failing"
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError> {
        Err(SourceError::Failed {
            source_name: "radio-failing".to_string(),
            reason: "radio feed dropped".to_string(),
        })
    }

    fn close(&mut self) {}
}

/// Fallback that panics when polled and counts skipped ticks
#[derive(Default)]
struct PanickingSource {
    skips: Arc<AtomicUsize>,
}

impl SampleSource for PanickingSource {
    fn name(&self) -> &str {
        "panicking"
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError> {
        panic!("fallback exploded");
    }

    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError> {
        Ok(Vec::new())
    }

    fn skip_tick(&mut self) {
        self.skips.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {}
}

/// Summarizer that panics on every request
struct PanickingSummarizer;

impl Summarizer for PanickingSummarizer {
    fn name(&self) -> &str {
        "panicking"
    }

    fn summarize(&self, _: &str, _: &str, _: Option<&Baseline>) -> Option<DriverSummary> {
        panic!("summary backend exploded");
    }

    fn summarize_lap(&self, _: &str, _: &LapStats) -> Option<LapSummary> {
        panic!("lap summary backend exploded");
    }
}

fn on_lap(speed: f64, lap: u32) -> TelemetrySample {
    let mut sample = TelemetrySample::new("X").with_speed(speed);
    sample.lap = Some(lap);
    sample
}

fn live_dispatcher() -> (Dispatcher, IngestHandle, SubscriberRegistry) {
    let registry = SubscriberRegistry::new(64, 3);
    let (live, ingest) = ChannelSource::new(64, Duration::from_secs(5));
    let fallback = SimulatedSource::new(2);
    let (dispatcher, _handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry.clone(),
        Box::new(live),
        Box::new(fallback),
    );
    (dispatcher, ingest, registry)
}

fn drain(rx: &mut Receiver<Message>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(serde_json::from_str(&message).unwrap());
    }
    messages
}

fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

#[test]
fn test_end_to_end_cold_start_then_anomaly() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (follower, mut rx_follower) = registry.connect();
    registry.connect_to_entity(follower, "X").unwrap();
    let (_watcher, mut rx_watcher) = registry.connect();

    for _ in 0..11 {
        ingest.push_sample(TelemetrySample::new("X").with_speed(200.0)).unwrap();
    }
    ingest.push_sample(TelemetrySample::new("X").with_speed(400.0)).unwrap();

    let report = dispatcher.tick().unwrap();
    assert_eq!(report.mode, Mode::Live);
    assert_eq!(report.samples, 12);
    assert_eq!(report.anomalies, 1);

    let watched = drain(&mut rx_watcher);
    let telemetry = of_type(&watched, "telemetry");
    assert_eq!(telemetry.len(), 12);
    for (i, message) in telemetry.iter().take(11).enumerate() {
        assert!(message["anomaly"].is_null(), "sample {} should not be anomalous", i + 1);
        assert_eq!(message["v"], 1);
    }
    let flagged = &telemetry[11]["anomaly"];
    assert_eq!(flagged["is_anomaly"], true);
    assert_eq!(flagged["top_anomaly"]["feature"], "speed_kph");
    let z = flagged["top_anomaly"]["z_score"].as_f64().unwrap();
    assert!((z - 11f64.sqrt()).abs() < 1e-9, "z was {}", z);
    assert!(of_type(&watched, "anomaly").is_empty(), "unfiltered subscriber gets no targeted events");

    let followed = drain(&mut rx_follower);
    assert_eq!(of_type(&followed, "telemetry").len(), 12);
    let anomalies = of_type(&followed, "anomaly");
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0]["data"]["driver_id"], "X");
    let kinds: Vec<&str> = followed.iter().filter_map(|m| m["type"].as_str()).collect();
    assert_eq!(
        &kinds[kinds.len() - 2..],
        ["telemetry", "anomaly"],
        "anomaly follows the telemetry frame it flags"
    );

    let stats = dispatcher.scorer().stats("X");
    assert_eq!(stats.history_count, 12);
}

#[test]
fn test_samples_without_driver_are_broadcast_unscored() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (_id, mut rx) = registry.connect();

    ingest.push_sample(TelemetrySample::new("").with_speed(200.0)).unwrap();
    let report = dispatcher.tick().unwrap();

    assert_eq!(report.anomalies, 0);
    let messages = drain(&mut rx);
    assert_eq!(of_type(&messages, "telemetry").len(), 1);
    assert!(dispatcher.scorer().store().drivers().is_empty());
}

#[test]
fn test_falls_back_to_simulation_without_live_data() {
    let (mut dispatcher, _ingest, registry) = live_dispatcher();
    let (_id, mut rx) = registry.connect();

    let report = dispatcher.tick().unwrap();
    assert_eq!(report.mode, Mode::Fallback);
    assert_eq!(report.samples, 2);

    let messages = drain(&mut rx);
    let drivers: Vec<&str> = of_type(&messages, "telemetry")
        .iter()
        .filter_map(|m| m["data"]["driver_id"].as_str())
        .collect();
    assert_eq!(drivers, vec!["DRIVER_A", "DRIVER_B"]);
}

#[test]
fn test_live_failure_switches_to_fallback_for_next_tick() {
    let polls = Arc::new(AtomicUsize::new(0));
    let registry = SubscriberRegistry::new(64, 3);
    let (mut dispatcher, _handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry.clone(),
        Box::new(BrokenSource {
            polls: polls.clone(),
        }),
        Box::new(SimulatedSource::new(1)),
    );

    assert!(dispatcher.tick().is_err(), "live failure surfaces as a tick error");
    assert_eq!(polls.load(Ordering::SeqCst), 1);

    let report = dispatcher.tick().unwrap();
    assert_eq!(report.mode, Mode::Fallback);
    assert_eq!(polls.load(Ordering::SeqCst), 1, "failed source is skipped for one tick");

    assert!(dispatcher.tick().is_err(), "live source is retried afterwards");
    assert_eq!(polls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_radio_broadcast_and_summary_targeted() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (follower, mut rx_follower) = registry.connect();
    registry.connect_to_entity(follower, "DRIVER_A").unwrap();
    let (_watcher, mut rx_watcher) = registry.connect();

    ingest
        .push_text(RadioMessage::new("DRIVER_A", "TEAM_A", "Push now, watch the fuel"))
        .unwrap();
    let report = dispatcher.tick().unwrap();
    assert_eq!(report.texts, 1);

    let watched = drain(&mut rx_watcher);
    let radio = of_type(&watched, "radio");
    assert_eq!(radio.len(), 1);
    assert_eq!(radio[0]["data"]["text"], "Push now, watch the fuel");
    assert!(of_type(&watched, "summary").is_empty());

    let followed = drain(&mut rx_follower);
    assert_eq!(of_type(&followed, "radio").len(), 1);
    let summaries = of_type(&followed, "summary");
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0]["data"];
    assert_eq!(summary["driver_id"], "DRIVER_A");
    assert_eq!(summary["source"], "simulation");
    assert!(summary["summary"].as_str().unwrap().contains("Fuel management"));
}

#[test]
fn test_empty_radio_text_gets_no_summary() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (follower, mut rx) = registry.connect();
    registry.connect_to_entity(follower, "DRIVER_A").unwrap();

    ingest.push_text(RadioMessage::new("DRIVER_A", "TEAM_A", "   ")).unwrap();
    dispatcher.tick().unwrap();

    let messages = drain(&mut rx);
    assert_eq!(of_type(&messages, "radio").len(), 1);
    assert!(of_type(&messages, "summary").is_empty());
}

#[test]
fn test_dead_subscriber_does_not_stop_dispatch() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (_dead, rx_dead) = registry.connect();
    let (_live, mut rx_live) = registry.connect();
    drop(rx_dead);

    for _ in 0..3 {
        ingest.push_sample(TelemetrySample::new("X").with_speed(200.0)).unwrap();
        dispatcher.tick().unwrap();
    }

    assert_eq!(of_type(&drain(&mut rx_live), "telemetry").len(), 3);
    assert_eq!(registry.len(), 1, "dead subscriber evicted after repeated failures");
}

#[tokio::test]
async fn test_control_handle_reaches_running_loop() {
    let registry = SubscriberRegistry::new(64, 3);
    let (live, ingest) = ChannelSource::new(64, Duration::from_secs(5));
    let (dispatcher, handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry,
        Box::new(live),
        Box::new(SimulatedSource::new(1)),
    );
    let dispatcher = dispatcher.with_intervals(Duration::from_millis(5), Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(cancel.clone()));

    for _ in 0..4 {
        ingest.push_sample(TelemetrySample::new("X").with_speed(200.0)).unwrap();
    }

    let mut stats = handle.stats("X").await.unwrap();
    for _ in 0..100 {
        if stats.history_count == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        stats = handle.stats("X").await.unwrap();
    }
    assert_eq!(stats.history_count, 4);

    handle.reset("X").await.unwrap();
    assert_eq!(handle.stats("X").await.unwrap().history_count, 0);

    cancel.cancel();
    task.await.unwrap();
    assert!(handle.stats("X").await.is_err(), "stopped loop reports an error");
    assert!(ingest.push_sample(TelemetrySample::new("X")).is_err(), "live source closed on shutdown");
}

#[test]
fn test_radio_failure_keeps_drained_samples() {
    let registry = SubscriberRegistry::new(64, 3);
    let (_id, mut rx) = registry.connect();
    let pending = (0..5).map(|_| TelemetrySample::new("X").with_speed(200.0)).collect();
    let (mut dispatcher, _handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry.clone(),
        Box::new(RadioFailingSource { pending }),
        Box::new(SimulatedSource::new(1)),
    );

    assert!(dispatcher.tick().is_err(), "radio failure surfaces as a tick error");

    assert_eq!(of_type(&drain(&mut rx), "telemetry").len(), 5);
    assert_eq!(dispatcher.scorer().stats("X").history_count, 5);

    let report = dispatcher.tick().unwrap();
    assert_eq!(report.mode, Mode::Fallback, "failed live source is skipped for one tick");
}

#[test]
fn test_summarizer_panic_drops_only_that_item() {
    let (dispatcher, ingest, registry) = live_dispatcher();
    let mut dispatcher = dispatcher.with_summarizer(Box::new(PanickingSummarizer));
    let (follower, mut rx_follower) = registry.connect();
    registry.connect_to_entity(follower, "X").unwrap();

    ingest.push_sample(on_lap(200.0, 1)).unwrap();
    ingest.push_sample(on_lap(200.0, 2)).unwrap();
    ingest.push_sample(on_lap(200.0, 2)).unwrap();
    ingest.push_text(RadioMessage::new("X", "TEAM_A", "Box this lap")).unwrap();
    ingest.push_text(RadioMessage::new("X", "TEAM_A", "Copy")).unwrap();

    let report = dispatcher.tick().unwrap();
    assert_eq!(report.samples, 3);
    assert_eq!(report.texts, 2);

    let followed = drain(&mut rx_follower);
    assert_eq!(of_type(&followed, "telemetry").len(), 3);
    assert_eq!(of_type(&followed, "radio").len(), 2);
    assert!(of_type(&followed, "summary").is_empty());
    assert!(of_type(&followed, "lap_summary").is_empty());
    assert_eq!(dispatcher.scorer().stats("X").history_count, 3);
}

#[tokio::test]
async fn test_dead_loop_cancels_shared_token() {
    let registry = SubscriberRegistry::new(64, 3);
    let (live, _ingest) = ChannelSource::new(64, Duration::from_secs(5));
    let (dispatcher, handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry,
        Box::new(live),
        Box::new(PanickingSource::default()),
    );
    let dispatcher = dispatcher.with_intervals(Duration::from_millis(5), Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let supervisor = dispatcher.spawn_supervised(cancel.clone());

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor finishes")
        .unwrap();
    assert!(outcome.is_err());
    assert!(cancel.is_cancelled(), "server shares the token and stops too");
    assert!(handle.stats("X").await.is_err());
}

#[tokio::test]
async fn test_supervised_loop_stops_cleanly_on_cancel() {
    let (dispatcher, _ingest, _registry) = live_dispatcher();
    let dispatcher = dispatcher.with_intervals(Duration::from_millis(5), Duration::from_millis(5));
    let cancel = CancellationToken::new();
    let supervisor = dispatcher.spawn_supervised(cancel.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(supervisor.await.unwrap().is_ok());
}

#[test]
fn test_live_tick_restarts_fallback_clock() {
    let skips = Arc::new(AtomicUsize::new(0));
    let registry = SubscriberRegistry::new(64, 3);
    let (live, ingest) = ChannelSource::new(64, Duration::from_secs(5));
    let (mut dispatcher, _handle) = Dispatcher::new(
        AnomalyScorer::default(),
        registry,
        Box::new(live),
        Box::new(PanickingSource {
            skips: skips.clone(),
        }),
    );

    for _ in 0..2 {
        ingest.push_sample(TelemetrySample::new("X").with_speed(200.0)).unwrap();
        assert_eq!(dispatcher.tick().unwrap().mode, Mode::Live);
    }
    assert_eq!(skips.load(Ordering::SeqCst), 2, "fallback told about every live tick");
}

#[test]
fn test_lap_summary_sent_when_next_lap_starts() {
    let (mut dispatcher, ingest, registry) = live_dispatcher();
    let (follower, mut rx_follower) = registry.connect();
    registry.connect_to_entity(follower, "X").unwrap();
    let (_watcher, mut rx_watcher) = registry.connect();

    ingest.push_sample(on_lap(260.0, 1)).unwrap();
    ingest.push_sample(on_lap(270.0, 1)).unwrap();
    dispatcher.tick().unwrap();
    assert!(of_type(&drain(&mut rx_follower), "lap_summary").is_empty(), "lap still running");

    ingest.push_sample(on_lap(150.0, 2)).unwrap();
    dispatcher.tick().unwrap();

    let followed = drain(&mut rx_follower);
    let laps = of_type(&followed, "lap_summary");
    assert_eq!(laps.len(), 1);
    let lap = &laps[0]["data"];
    assert_eq!(lap["driver_id"], "X");
    assert_eq!(lap["lap_number"], 1);
    assert_eq!(lap["lap_stats"]["data_points"], 2);
    assert_eq!(lap["lap_stats"]["avg_speed"], 265.0);
    assert_eq!(lap["lap_stats"]["max_speed"], 270.0);
    assert!(lap["summary"].as_str().unwrap().starts_with("Outstanding lap 1"));

    assert!(of_type(&drain(&mut rx_watcher), "lap_summary").is_empty());
}
