//! Single-writer concurrency host for the LeadWatch engine.
//!
//! Exactly one apply thread owns the join engine, aggregator and view; every
//! input — change events from any number of producers and ticks from the
//! timer thread — serializes through one bounded queue, so a frame can never
//! be retired concurrently with an insert into it. Readers receive
//! `Arc`-shared, point-in-time-consistent [`ViewState`] snapshots published
//! once per committed batch (versioned-state exchange, never in-place
//! mutation), and push consumers subscribe to committed delta batches.
//!
//! Backpressure is block-producer: [`MonitorPipeline::ingest`] blocks while
//! the queue is full. [`MonitorPipeline::try_ingest`] is the non-blocking,
//! drop-with-count alternative.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use leadwatch_core::{
    now_utc, ChangeEvent, ConversionMonitor, EngineConfig, EngineCounters, EngineError,
    MetricsDelta, MetricsRow,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("ingestion queue is full")]
    QueueFull,
    #[error("pipeline is shutting down")]
    ShuttingDown,
    #[error("apply thread panicked")]
    WorkerPanicked,
}

/// One committed delta batch, pushed to subscribers after the view version
/// it produced became visible to pull readers.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedBatch {
    pub version: u64,
    pub deltas: Vec<MetricsDelta>,
}

/// Point-in-time-consistent published view. All effects of one upstream
/// event are visible atomically or not at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    pub version: u64,
    pub rows: Vec<MetricsRow>,
    pub counters: EngineCounters,
}

impl ViewState {
    fn empty() -> Self {
        Self {
            version: 0,
            rows: Vec::new(),
            counters: EngineCounters::default(),
        }
    }
}

/// Read handle shared between the apply thread and any number of readers.
/// Writers swap in a fresh `Arc` per commit; readers clone the current one.
#[derive(Debug, Clone)]
pub struct SharedView {
    inner: Arc<RwLock<Arc<ViewState>>>,
}

impl SharedView {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(ViewState::empty()))),
        }
    }

    fn publish(&self, state: ViewState) {
        *self.inner.write() = Arc::new(state);
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<ViewState> {
        Arc::clone(&self.inner.read())
    }
}

#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    events_ingested: AtomicU64,
    events_rejected: AtomicU64,
    ticks_applied: AtomicU64,
    batches_committed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct PipelineTelemetrySnapshot {
    pub events_ingested: u64,
    pub events_rejected: u64,
    pub ticks_applied: u64,
    pub batches_committed: u64,
}

impl PipelineTelemetry {
    fn snapshot(&self) -> PipelineTelemetrySnapshot {
        PipelineTelemetrySnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            ticks_applied: self.ticks_applied.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
        }
    }
}

enum Input {
    Event(ChangeEvent),
    Tick(OffsetDateTime),
    Subscribe(mpsc::Sender<CommittedBatch>),
    Shutdown,
}

/// The running pipeline: a bounded ingestion queue, one apply thread, and an
/// optional wall-clock tick timer.
pub struct MonitorPipeline {
    sender: SyncSender<Input>,
    view: SharedView,
    telemetry: Arc<PipelineTelemetry>,
    apply_thread: Option<JoinHandle<Result<(), EngineError>>>,
    ticker_thread: Option<JoinHandle<()>>,
    ticker_stop: Arc<AtomicBool>,
}

impl MonitorPipeline {
    /// Spawns the apply thread plus a wall-clock ticker that advances the
    /// window every `config.tick_interval`.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the config is invalid.
    pub fn spawn(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::spawn_inner(config, true)
    }

    /// Spawns the apply thread without a ticker. The host drives the window
    /// clock explicitly through [`MonitorPipeline::ingest_tick`]; this is the
    /// deterministic mode used by replay hosts and tests.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the config is invalid.
    pub fn spawn_without_ticker(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::spawn_inner(config, false)
    }

    fn spawn_inner(config: &EngineConfig, with_ticker: bool) -> Result<Self, EngineError> {
        let monitor = ConversionMonitor::new(config)?;
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let view = SharedView::new();
        let telemetry = Arc::new(PipelineTelemetry::default());
        let ticker_stop = Arc::new(AtomicBool::new(false));

        let apply_view = view.clone();
        let apply_telemetry = Arc::clone(&telemetry);
        let apply_thread = std::thread::Builder::new()
            .name("leadwatch-apply".to_string())
            .spawn(move || run_apply_loop(monitor, &receiver, &apply_view, &apply_telemetry))
            .map_err(|err| {
                EngineError::Configuration(format!("failed to spawn apply thread: {err}"))
            })?;

        let ticker_thread = if with_ticker {
            let interval = config.tick_interval.unsigned_abs();
            let stop = Arc::clone(&ticker_stop);
            let tick_sender = sender.clone();
            let handle = std::thread::Builder::new()
                .name("leadwatch-ticker".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(interval);
                        if tick_sender.send(Input::Tick(now_utc())).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|err| {
                    EngineError::Configuration(format!("failed to spawn ticker thread: {err}"))
                })?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            sender,
            view,
            telemetry,
            apply_thread: Some(apply_thread),
            ticker_thread,
            ticker_stop,
        })
    }

    /// Queues one change event, blocking while the queue is full.
    ///
    /// # Errors
    /// Returns [`PipelineError::ShuttingDown`] once the apply thread has
    /// exited.
    pub fn ingest(&self, event: ChangeEvent) -> Result<(), PipelineError> {
        self.sender
            .send(Input::Event(event))
            .map_err(|_| PipelineError::ShuttingDown)?;
        self.telemetry.events_ingested.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking variant of [`MonitorPipeline::ingest`]; a full queue is
    /// reported (and counted) instead of blocking the producer.
    ///
    /// # Errors
    /// Returns [`PipelineError::QueueFull`] when the queue is full and
    /// [`PipelineError::ShuttingDown`] once the apply thread has exited.
    pub fn try_ingest(&self, event: ChangeEvent) -> Result<(), PipelineError> {
        match self.sender.try_send(Input::Event(event)) {
            Ok(()) => {
                self.telemetry.events_ingested.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.telemetry.events_rejected.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::ShuttingDown),
        }
    }

    /// Advances the window clock explicitly. Serializes through the same
    /// queue as events, like timer ticks do.
    ///
    /// # Errors
    /// Returns [`PipelineError::ShuttingDown`] once the apply thread has
    /// exited.
    pub fn ingest_tick(&self, now: OffsetDateTime) -> Result<(), PipelineError> {
        self.sender
            .send(Input::Tick(now))
            .map_err(|_| PipelineError::ShuttingDown)
    }

    /// Registers a push consumer. Each committed batch is delivered in
    /// commit order; a consumer that drops its receiver is silently removed.
    ///
    /// # Errors
    /// Returns [`PipelineError::ShuttingDown`] once the apply thread has
    /// exited.
    pub fn subscribe(&self) -> Result<Receiver<CommittedBatch>, PipelineError> {
        let (sender, receiver) = mpsc::channel();
        self.sender
            .send(Input::Subscribe(sender))
            .map_err(|_| PipelineError::ShuttingDown)?;
        Ok(receiver)
    }

    /// Read handle for pull consumers; cheap to clone and share.
    #[must_use]
    pub fn view(&self) -> SharedView {
        self.view.clone()
    }

    #[must_use]
    pub fn telemetry(&self) -> PipelineTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Stops the ticker, drains everything already queued, commits the final
    /// batch and joins both threads. No half-applied row survives shutdown.
    ///
    /// # Errors
    /// Returns the engine error that stopped the apply thread, if any.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), PipelineError> {
        self.ticker_stop.store(true, Ordering::Relaxed);
        // The apply thread may already be gone after a fatal engine error;
        // a send failure here is not itself a problem.
        let _ = self.sender.send(Input::Shutdown);

        if let Some(handle) = self.ticker_thread.take() {
            if handle.join().is_err() {
                return Err(PipelineError::WorkerPanicked);
            }
        }

        match self.apply_thread.take() {
            None => Ok(()),
            Some(handle) => match handle.join() {
                Ok(result) => result.map_err(PipelineError::Engine),
                Err(_) => Err(PipelineError::WorkerPanicked),
            },
        }
    }
}

impl Drop for MonitorPipeline {
    fn drop(&mut self) {
        if self.apply_thread.is_some() {
            let _ = self.shutdown_inner();
        }
    }
}

fn run_apply_loop(
    mut monitor: ConversionMonitor,
    receiver: &Receiver<Input>,
    view: &SharedView,
    telemetry: &PipelineTelemetry,
) -> Result<(), EngineError> {
    let mut subscribers: Vec<mpsc::Sender<CommittedBatch>> = Vec::new();

    while let Ok(input) = receiver.recv() {
        match input {
            Input::Shutdown => {
                // Flush whatever was queued ahead of the shutdown request.
                while let Ok(queued) = receiver.try_recv() {
                    match queued {
                        Input::Event(event) => {
                            apply_event(&mut monitor, &event, view, telemetry, &mut subscribers)?;
                        }
                        Input::Tick(now) => {
                            apply_tick(&mut monitor, now, view, telemetry, &mut subscribers)?;
                        }
                        Input::Subscribe(_) | Input::Shutdown => {}
                    }
                }
                debug!("apply thread draining complete, shutting down");
                return Ok(());
            }
            Input::Event(event) => {
                apply_event(&mut monitor, &event, view, telemetry, &mut subscribers)?;
            }
            Input::Tick(now) => {
                apply_tick(&mut monitor, now, view, telemetry, &mut subscribers)?;
            }
            Input::Subscribe(sender) => subscribers.push(sender),
        }
    }

    Ok(())
}

fn apply_event(
    monitor: &mut ConversionMonitor,
    event: &ChangeEvent,
    view: &SharedView,
    telemetry: &PipelineTelemetry,
    subscribers: &mut Vec<mpsc::Sender<CommittedBatch>>,
) -> Result<(), EngineError> {
    let deltas = monitor.apply_event(event).map_err(|err| {
        error!(event_id = %event.event_id, "fatal engine error: {err}");
        err
    })?;
    commit(monitor, deltas, view, telemetry, subscribers);
    Ok(())
}

fn apply_tick(
    monitor: &mut ConversionMonitor,
    now: OffsetDateTime,
    view: &SharedView,
    telemetry: &PipelineTelemetry,
    subscribers: &mut Vec<mpsc::Sender<CommittedBatch>>,
) -> Result<(), EngineError> {
    let deltas = monitor.tick(now).map_err(|err| {
        error!("fatal engine error during tick: {err}");
        err
    })?;
    telemetry.ticks_applied.fetch_add(1, Ordering::Relaxed);
    commit(monitor, deltas, view, telemetry, subscribers);
    Ok(())
}

fn commit(
    monitor: &ConversionMonitor,
    deltas: Vec<MetricsDelta>,
    view: &SharedView,
    telemetry: &PipelineTelemetry,
    subscribers: &mut Vec<mpsc::Sender<CommittedBatch>>,
) {
    if deltas.is_empty() {
        return;
    }

    let version = monitor.version();
    view.publish(ViewState {
        version,
        rows: monitor.snapshot(),
        counters: monitor.counters(),
    });
    telemetry.batches_committed.fetch_add(1, Ordering::Relaxed);

    let before = subscribers.len();
    subscribers.retain(|subscriber| {
        subscriber
            .send(CommittedBatch {
                version,
                deltas: deltas.clone(),
            })
            .is_ok()
    });
    if subscribers.len() < before {
        warn!(
            dropped = before - subscribers.len(),
            "removed disconnected subscribers"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadwatch_core::{Coupon, Lead, PredictionEvent};
    use time::Duration;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn ts(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(seconds)
    }

    fn fixture_lead(id: u64, created_at: OffsetDateTime) -> Lead {
        Lead {
            id,
            email: format!("lead{id}@example.com"),
            utm_medium: "email".to_string(),
            utm_source: "klaviyo.com".to_string(),
            created_at,
            converted_at: None,
            conversion_amount: None,
        }
    }

    fn fixture_prediction(lead_id: u64, at: OffsetDateTime, label: bool) -> PredictionEvent {
        PredictionEvent {
            lead_id,
            experiment_bucket: "experiment".to_string(),
            predicted_at: at,
            score: 0.7,
            label,
        }
    }

    fn recv_batch(receiver: &Receiver<CommittedBatch>) -> CommittedBatch {
        match receiver.recv_timeout(std::time::Duration::from_secs(5)) {
            Ok(batch) => batch,
            Err(err) => panic!("expected a committed batch: {err}"),
        }
    }

    #[test]
    fn committed_batches_reach_pull_and_push_readers() {
        let pipeline = must_ok(MonitorPipeline::spawn_without_ticker(&EngineConfig::v1()));
        let subscription = must_ok(pipeline.subscribe());

        must_ok(pipeline.ingest(ChangeEvent::lead_upsert(ts(0), fixture_lead(1, ts(0)))));
        must_ok(pipeline.ingest(ChangeEvent::prediction(
            ts(0),
            fixture_prediction(1, ts(0), true),
        )));

        let batch = recv_batch(&subscription);
        assert_eq!(batch.version, 1);
        assert_eq!(batch.deltas.len(), 1);

        let state = pipeline.view().snapshot();
        assert_eq!(state.version, 1);
        assert_eq!(state.rows.len(), 1);
        assert_eq!(state.rows[0].false_positives, 1);

        must_ok(pipeline.shutdown());
    }

    #[test]
    fn ticks_serialize_with_events_and_retire_rows() {
        let pipeline = must_ok(MonitorPipeline::spawn_without_ticker(&EngineConfig::v1()));
        let subscription = must_ok(pipeline.subscribe());

        must_ok(pipeline.ingest(ChangeEvent::lead_upsert(ts(100), fixture_lead(1, ts(100)))));
        must_ok(pipeline.ingest(ChangeEvent::prediction(
            ts(100),
            fixture_prediction(1, ts(100), true),
        )));
        let _ = recv_batch(&subscription);

        must_ok(pipeline.ingest_tick(ts(130)));
        let batch = recv_batch(&subscription);
        assert!(matches!(batch.deltas[0], MetricsDelta::Delete { .. }));

        let state = pipeline.view().snapshot();
        assert!(state.rows.is_empty());
        assert_eq!(state.counters.rows_retired, 1);

        must_ok(pipeline.shutdown());
    }

    #[test]
    fn shutdown_flushes_queued_events() {
        let pipeline = must_ok(MonitorPipeline::spawn_without_ticker(&EngineConfig::v1()));
        let view = pipeline.view();

        for id in 1..=5_u64 {
            must_ok(pipeline.ingest(ChangeEvent::lead_upsert(ts(0), fixture_lead(id, ts(0)))));
            must_ok(pipeline.ingest(ChangeEvent::prediction(
                ts(0),
                fixture_prediction(id, ts(0), true),
            )));
        }
        must_ok(pipeline.shutdown());

        let state = view.snapshot();
        assert_eq!(state.rows.len(), 1);
        assert_eq!(state.rows[0].num_leads, 5);
    }

    #[test]
    fn telemetry_counts_ingested_events() {
        let pipeline = must_ok(MonitorPipeline::spawn_without_ticker(&EngineConfig::v1()));
        must_ok(pipeline.ingest(ChangeEvent::lead_upsert(ts(0), fixture_lead(1, ts(0)))));
        must_ok(pipeline.ingest(ChangeEvent::coupon_insert(
            ts(0),
            Coupon {
                id: 1,
                lead_id: 1,
                amount: 100,
                created_at: ts(0),
            },
        )));
        let telemetry_before = pipeline.telemetry();
        assert_eq!(telemetry_before.events_ingested, 2);
        must_ok(pipeline.shutdown());
    }

    #[test]
    fn readers_see_consistent_versions() {
        let pipeline = must_ok(MonitorPipeline::spawn_without_ticker(&EngineConfig::v1()));
        let subscription = must_ok(pipeline.subscribe());
        let view = pipeline.view();

        for id in 1..=3_u64 {
            must_ok(pipeline.ingest(ChangeEvent::lead_upsert(ts(0), fixture_lead(id, ts(0)))));
            must_ok(pipeline.ingest(ChangeEvent::prediction(
                ts(0),
                fixture_prediction(id, ts(0), false),
            )));
        }

        let mut last_version = 0;
        for _ in 0..3 {
            let batch = recv_batch(&subscription);
            assert!(batch.version > last_version);
            last_version = batch.version;
        }

        let state = view.snapshot();
        assert_eq!(state.version, last_version);
        assert_eq!(state.rows[0].num_leads, 3);

        must_ok(pipeline.shutdown());
    }
}
