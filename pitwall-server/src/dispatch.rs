//! Ingestion and dispatch loop
//!
//! Each tick this module:
//! - Picks the live source when it reports connected, the simulation otherwise
//! - Scores every pulled sample against the driver's baseline
//! - Broadcasts telemetry and radio, and targets anomalies and summaries at
//!   the subscribers following the driver
//! - Summarizes each driver's lap once the next one starts
//! - Serves stats and reset requests from the API between ticks
//!
//! A panic while handling one sample or radio message is logged and the
//! item dropped. A panic anywhere else ends the loop; run it through
//! [`Dispatcher::spawn_supervised`] so that cancels the whole server.

use crate::messages::Envelope;
use crate::registry::SubscriberRegistry;
use crate::summarizer::{LapAccumulator, LapStats, Summarizer, TemplateSummarizer};
use anyhow::{anyhow, Context, Result};
use pitwall_core::model::DriverStats;
use pitwall_core::{AnomalyScorer, RadioMessage, SampleSource, TelemetrySample};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const COMMAND_QUEUE: usize = 32;

/// Which source fed a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Fallback,
}

/// What one tick processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub mode: Mode,
    pub samples: usize,
    pub anomalies: usize,
    pub texts: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch loop is not running")]
    Stopped,
}

enum Command {
    Stats {
        driver_id: String,
        reply: oneshot::Sender<DriverStats>,
    },
    Reset {
        driver_id: String,
        reply: oneshot::Sender<()>,
    },
}

/// Requests into the running dispatch loop, which owns all baselines
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatchHandle {
    pub async fn stats(&self, driver_id: &str) -> Result<DriverStats, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats {
                driver_id: driver_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Drop a driver's history and baseline
    pub async fn reset(&self, driver_id: &str) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reset {
                driver_id: driver_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }
}

pub struct Dispatcher {
    scorer: AnomalyScorer,
    live: Box<dyn SampleSource>,
    fallback: Box<dyn SampleSource>,
    summarizer: Box<dyn Summarizer>,
    registry: SubscriberRegistry,
    commands: mpsc::Receiver<Command>,
    /// Lap in progress per driver
    laps: HashMap<String, LapAccumulator>,
    live_failed: bool,
    tick_interval: Duration,
    error_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        scorer: AnomalyScorer,
        registry: SubscriberRegistry,
        live: Box<dyn SampleSource>,
        fallback: Box<dyn SampleSource>,
    ) -> (Self, DispatchHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let dispatcher = Self {
            scorer,
            live,
            fallback,
            summarizer: Box::new(TemplateSummarizer::new()),
            registry,
            commands,
            laps: HashMap::new(),
            live_failed: false,
            tick_interval: TICK_INTERVAL,
            error_backoff: ERROR_BACKOFF,
        };
        (dispatcher, DispatchHandle { tx })
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_intervals(mut self, tick_interval: Duration, error_backoff: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.error_backoff = error_backoff;
        self
    }

    pub fn scorer(&self) -> &AnomalyScorer {
        &self.scorer
    }

    /// Run the loop on its own task and watch it
    ///
    /// If the loop ends before `cancel` fires (a panic outside per-item
    /// handling), the token is cancelled so everything sharing it shuts
    /// down, and the returned handle resolves to an error.
    pub fn spawn_supervised(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        let inner = tokio::spawn(self.run(cancel.clone()));
        tokio::spawn(async move {
            let outcome = inner.await;
            if outcome.is_ok() && cancel.is_cancelled() {
                return Ok(());
            }
            cancel.cancel();
            match outcome {
                Ok(()) => Err(anyhow!("dispatch loop exited before shutdown")),
                Err(e) => {
                    error!("Dispatch loop died: {}", e);
                    Err(anyhow!(e).context("dispatch loop died"))
                }
            }
        })
    }

    /// Main dispatch loop; returns once `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Dispatch loop started (live: {}, fallback: {})",
            self.live.name(),
            self.fallback.name()
        );

        loop {
            self.drain_commands();

            let pause = match self.tick() {
                Ok(report) => {
                    debug!(
                        "Tick ({:?}): {} samples, {} anomalies, {} texts",
                        report.mode, report.samples, report.anomalies, report.texts
                    );
                    self.tick_interval
                }
                Err(e) => {
                    error!("Error in dispatch tick: {:#}", e);
                    self.error_backoff
                }
            };

            let deadline = Instant::now() + pause;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.shutdown();
                        return;
                    }
                    _ = sleep_until(deadline) => break,
                    Some(command) = self.commands.recv() => {
                        handle_command(&mut self.scorer, &mut self.laps, command);
                    }
                }
            }
        }
    }

    /// Pull one batch from the selected source and dispatch it
    ///
    /// Samples are dispatched before radio is polled, so a radio failure
    /// still delivers the samples already drained from the source.
    pub fn tick(&mut self) -> Result<TickReport> {
        let use_live = !std::mem::take(&mut self.live_failed) && self.live.is_connected();
        let mode = if use_live { Mode::Live } else { Mode::Fallback };
        match mode {
            Mode::Live => self.fallback.skip_tick(),
            Mode::Fallback => self.live.skip_tick(),
        }

        let samples = self.poll_samples(mode).map_err(|e| self.source_failed(mode, e))?;
        let mut report = TickReport {
            mode,
            samples: samples.len(),
            anomalies: 0,
            texts: 0,
        };
        for sample in samples {
            if guarded("sample", || self.dispatch_sample(sample)).unwrap_or(false) {
                report.anomalies += 1;
            }
        }

        let texts = self.poll_texts(mode).map_err(|e| self.source_failed(mode, e))?;
        report.texts = texts.len();
        for message in texts {
            guarded("radio message", || self.dispatch_text(message));
        }

        Ok(report)
    }

    fn source_mut(&mut self, mode: Mode) -> &mut dyn SampleSource {
        match mode {
            Mode::Live => self.live.as_mut(),
            Mode::Fallback => self.fallback.as_mut(),
        }
    }

    fn poll_samples(&mut self, mode: Mode) -> Result<Vec<TelemetrySample>> {
        let source = self.source_mut(mode);
        source
            .poll_samples()
            .with_context(|| format!("polling samples from {}", source.name()))
    }

    fn poll_texts(&mut self, mode: Mode) -> Result<Vec<RadioMessage>> {
        let source = self.source_mut(mode);
        source
            .poll_texts()
            .with_context(|| format!("polling radio from {}", source.name()))
    }

    fn source_failed(&mut self, mode: Mode, e: anyhow::Error) -> anyhow::Error {
        if mode == Mode::Live {
            warn!("Live source {} failed, falling back for the next tick", self.live.name());
            self.live_failed = true;
        }
        e
    }

    /// Score and fan out one sample; returns whether it was anomalous
    fn dispatch_sample(&mut self, sample: TelemetrySample) -> bool {
        let verdict = self.scorer.evaluate(&sample).into_verdict();
        let finished_lap = self.track_lap(&sample);

        if let Some(verdict) = &verdict {
            info!(
                "Anomaly for {}: {} z={:.2}",
                verdict.driver_id, verdict.top_anomaly.feature, verdict.top_anomaly.z_score
            );
        }

        let anomalous = verdict.is_some();
        self.broadcast(&Envelope::Telemetry {
            data: sample,
            anomaly: verdict.clone(),
        });

        // Followers see the telemetry frame before the targeted event
        if let Some(verdict) = verdict {
            let driver_id = verdict.driver_id.clone();
            self.send_to_driver(&Envelope::Anomaly { data: verdict }, &driver_id);
        }

        if let Some((driver_id, lap)) = finished_lap {
            self.summarize_lap(&driver_id, &lap);
        }
        anomalous
    }

    /// Fold a sample into its driver's lap; returns the previous lap when
    /// this sample starts a new one
    fn track_lap(&mut self, sample: &TelemetrySample) -> Option<(String, LapStats)> {
        let (driver_id, lap) = (sample.driver()?, sample.lap?);
        let current = self
            .laps
            .entry(driver_id.to_string())
            .or_insert_with(|| LapAccumulator::new(lap));

        if current.lap_number() == lap {
            current.push(sample);
            return None;
        }

        let mut next = LapAccumulator::new(lap);
        next.push(sample);
        let finished = std::mem::replace(current, next).finish()?;
        Some((driver_id.to_string(), finished))
    }

    fn summarize_lap(&self, driver_id: &str, lap: &LapStats) {
        debug!("Lap {} complete for {} ({} samples)", lap.lap_number, driver_id, lap.data_points);
        if let Some(summary) = self.summarizer.summarize_lap(driver_id, lap) {
            self.send_to_driver(&Envelope::LapSummary { data: summary }, driver_id);
        }
    }

    fn dispatch_text(&mut self, message: RadioMessage) {
        let driver_id = message.driver_id.trim().to_string();
        let text = message.text.trim().to_string();
        self.broadcast(&Envelope::Radio { data: message });

        if driver_id.is_empty() || text.is_empty() {
            return;
        }

        let baseline = self.scorer.store().get_baseline(&driver_id);
        match self.summarizer.summarize(&driver_id, &text, baseline) {
            Some(summary) => self.send_to_driver(&Envelope::Summary { data: summary }, &driver_id),
            None => debug!("No summary from {} for {}", self.summarizer.name(), driver_id),
        }
    }

    fn broadcast(&self, envelope: &Envelope) {
        match envelope.to_message() {
            Ok(message) => {
                self.registry.broadcast(&message);
            }
            Err(e) => error!("Failed to serialize envelope: {}", e),
        }
    }

    fn send_to_driver(&self, envelope: &Envelope, driver_id: &str) {
        match envelope.to_message() {
            Ok(message) => {
                self.registry.broadcast_to_entity(&message, driver_id);
            }
            Err(e) => error!("Failed to serialize envelope for {}: {}", driver_id, e),
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            handle_command(&mut self.scorer, &mut self.laps, command);
        }
    }

    fn shutdown(&mut self) {
        info!("Dispatch loop stopping, closing sources");
        self.live.close();
        self.fallback.close();
    }
}

/// Run one item's handling, logging and swallowing a panic
fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Dropped {} after panic: {}", what, reason);
            None
        }
    }
}

fn handle_command(
    scorer: &mut AnomalyScorer,
    laps: &mut HashMap<String, LapAccumulator>,
    command: Command,
) {
    match command {
        Command::Stats { driver_id, reply } => {
            // The requester may have gone away; nothing to do then
            let _ = reply.send(scorer.stats(&driver_id));
        }
        Command::Reset { driver_id, reply } => {
            scorer.reset(&driver_id);
            laps.remove(&driver_id);
            let _ = reply.send(());
        }
    }
}
