//! Integration tests for the live ingest ChannelSource

use pitwall_core::model::{RadioMessage, TelemetrySample};
use pitwall_core::source::SampleSource;
use pitwall_sources::{ChannelSource, IngestError};
use std::time::Duration;

#[test]
fn test_channel_source_name() {
    let (source, _handle) = ChannelSource::new(8, Duration::from_secs(5));
    assert_eq!(source.name(), "live-ingest");
}

#[test]
fn test_not_connected_before_any_data() {
    let (source, _handle) = ChannelSource::new(8, Duration::from_secs(5));
    assert!(!source.is_connected(), "no data yet means no live upstream");
}

#[test]
fn test_push_then_poll_in_order() {
    let (mut source, handle) = ChannelSource::new(8, Duration::from_secs(5));
    for speed in [100.0, 110.0, 120.0] {
        handle.push_sample(TelemetrySample::new("A").with_speed(speed)).unwrap();
    }
    assert!(source.is_connected());

    let samples = source.poll_samples().unwrap();
    let speeds: Vec<f64> = samples.iter().map(|s| s.speed_kph.unwrap().0).collect();
    assert_eq!(speeds, vec![100.0, 110.0, 120.0]);
    assert!(source.poll_samples().unwrap().is_empty(), "queue should be drained");
}

#[test]
fn test_radio_messages_are_queued_separately() {
    let (mut source, handle) = ChannelSource::new(8, Duration::from_secs(5));
    handle.push_text(RadioMessage::new("A", "TEAM_A", "Box box box")).unwrap();

    assert!(source.poll_samples().unwrap().is_empty());
    let texts = source.poll_texts().unwrap();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].text, "Box box box");
}

#[test]
fn test_full_queue_rejects_push() {
    let (_source, handle) = ChannelSource::new(2, Duration::from_secs(5));
    handle.push_sample(TelemetrySample::new("A")).unwrap();
    handle.push_sample(TelemetrySample::new("A")).unwrap();
    assert_eq!(
        handle.push_sample(TelemetrySample::new("A")),
        Err(IngestError::QueueFull)
    );
}

#[test]
fn test_connection_goes_stale_after_timeout() {
    let (mut source, handle) = ChannelSource::new(8, Duration::from_millis(20));
    handle.push_sample(TelemetrySample::new("A")).unwrap();
    source.poll_samples().unwrap();
    assert!(source.is_connected(), "recent activity keeps the source live");

    std::thread::sleep(Duration::from_millis(60));
    assert!(!source.is_connected(), "idle source should report disconnected");
}

#[test]
fn test_close_releases_queues() {
    let (mut source, handle) = ChannelSource::new(8, Duration::from_secs(5));
    handle.push_sample(TelemetrySample::new("A")).unwrap();

    source.close();
    assert!(!source.is_connected());
    assert!(source.poll_samples().is_err());
    assert!(source.poll_texts().is_err());
    assert_eq!(
        handle.push_sample(TelemetrySample::new("A")),
        Err(IngestError::Closed)
    );
}
