//! Live ingest source backed by bounded in-process queues
//!
//! Producers (HTTP ingest handlers, broker consumers) push through an
//! [`IngestHandle`]; the dispatch loop drains the [`ChannelSource`] each tick.
//! The source reports itself connected while data keeps arriving.

use pitwall_core::model::{RadioMessage, TelemetrySample};
use pitwall_core::source::{SampleSource, SourceError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::info;

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_LIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on messages drained per poll
const MAX_BATCH: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("ingest queue is full")]
    QueueFull,

    #[error("ingest source is closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for IngestError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => IngestError::QueueFull,
            TrySendError::Closed(_) => IngestError::Closed,
        }
    }
}

/// Millisecond timestamp of the most recent push, relative to `origin`
#[derive(Debug)]
struct Activity {
    origin: Instant,
    // 0 = nothing received yet
    last_ms: AtomicU64,
}

impl Activity {
    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms.max(1), Ordering::Relaxed);
    }

    fn since_last(&self) -> Option<Duration> {
        match self.last_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(self.origin.elapsed().saturating_sub(Duration::from_millis(ms))),
        }
    }
}

/// Producer side of a [`ChannelSource`]
#[derive(Clone, Debug)]
pub struct IngestHandle {
    samples_tx: mpsc::Sender<TelemetrySample>,
    texts_tx: mpsc::Sender<RadioMessage>,
    activity: Arc<Activity>,
}

impl IngestHandle {
    pub fn push_sample(&self, sample: TelemetrySample) -> Result<(), IngestError> {
        self.samples_tx.try_send(sample)?;
        self.activity.touch();
        Ok(())
    }

    pub fn push_text(&self, message: RadioMessage) -> Result<(), IngestError> {
        self.texts_tx.try_send(message)?;
        self.activity.touch();
        Ok(())
    }
}

/// Consumer side, polled by the dispatch loop
pub struct ChannelSource {
    samples_rx: Option<mpsc::Receiver<TelemetrySample>>,
    texts_rx: Option<mpsc::Receiver<RadioMessage>>,
    activity: Arc<Activity>,
    live_timeout: Duration,
}

impl ChannelSource {
    /// Create a source with queues of `capacity` messages each
    pub fn new(capacity: usize, live_timeout: Duration) -> (Self, IngestHandle) {
        let (samples_tx, samples_rx) = mpsc::channel(capacity.max(1));
        let (texts_tx, texts_rx) = mpsc::channel(capacity.max(1));
        let activity = Arc::new(Activity {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        });

        let source = Self {
            samples_rx: Some(samples_rx),
            texts_rx: Some(texts_rx),
            activity: activity.clone(),
            live_timeout,
        };
        let handle = IngestHandle {
            samples_tx,
            texts_tx,
            activity,
        };
        (source, handle)
    }

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut batch = Vec::new();
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    fn closed(&self) -> SourceError {
        SourceError::Closed(self.name().to_string())
    }
}

impl SampleSource for ChannelSource {
    fn name(&self) -> &str {
        "live-ingest"
    }

    fn is_connected(&self) -> bool {
        let Some(rx) = self.samples_rx.as_ref() else {
            return false;
        };
        let queued = !rx.is_empty() || self.texts_rx.as_ref().is_some_and(|t| !t.is_empty());
        let recent = self
            .activity
            .since_last()
            .is_some_and(|idle| idle < self.live_timeout);
        queued || recent
    }

    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError> {
        match self.samples_rx.as_mut() {
            Some(rx) => Ok(Self::drain(rx)),
            None => Err(self.closed()),
        }
    }

    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError> {
        match self.texts_rx.as_mut() {
            Some(rx) => Ok(Self::drain(rx)),
            None => Err(self.closed()),
        }
    }

    fn close(&mut self) {
        if self.samples_rx.take().is_some() {
            info!("Live ingest source closed");
        }
        self.texts_rx = None;
    }
}
