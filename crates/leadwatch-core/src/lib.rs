//! Streaming windowed temporal-join and incremental metrics engine.
//!
//! LeadWatch monitors a live binary-classification model by continuously
//! joining prediction events against delayed conversion outcomes and folding
//! the joined rows into per-(second, bucket) confusion-matrix metrics over a
//! hopping time window (30s wide, hopping every 2s).
//!
//! Everything in this crate is deterministic and single-threaded: all time is
//! an explicit parameter, entity tables are owned exclusively by the
//! [`TemporalJoinEngine`], accumulator cells by the [`MetricsAggregator`], and
//! the committed view by the [`ViewMaterializer`]. State crosses component
//! boundaries only through [`RowDelta`] and [`MetricsDelta`] values, which
//! makes the whole pipeline replayable under simulated clocks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Engine tuning profile.
///
/// `v1()` is the deployed profile; hosts may deserialize an override from
/// JSON but every instance is checked by [`EngineConfig::validate`] before an
/// engine is built around it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub window_size: Duration,
    pub hop_period: Duration,
    pub orphan_capacity: usize,
    pub orphan_ttl: Duration,
    pub skew_tolerance: Duration,
    pub queue_capacity: usize,
    pub tick_interval: Duration,
}

impl EngineConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            window_size: Duration::seconds(30),
            hop_period: Duration::seconds(2),
            orphan_capacity: 4096,
            orphan_ttl: Duration::seconds(30),
            skew_tolerance: Duration::seconds(60),
            queue_capacity: 1024,
            tick_interval: Duration::milliseconds(500),
        }
    }

    /// Validates window geometry and resource bounds.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.hop_period <= Duration::ZERO {
            return Err(EngineError::Configuration(
                "hop_period MUST be positive".to_string(),
            ));
        }

        if self.window_size < self.hop_period {
            return Err(EngineError::Configuration(
                "window_size MUST be >= hop_period".to_string(),
            ));
        }

        if self
            .window_size
            .whole_nanoseconds()
            .rem_euclid(self.hop_period.whole_nanoseconds())
            != 0
        {
            return Err(EngineError::Configuration(
                "window_size MUST be a whole multiple of hop_period".to_string(),
            ));
        }

        if self.orphan_capacity == 0 {
            return Err(EngineError::Configuration(
                "orphan_capacity MUST be >= 1".to_string(),
            ));
        }

        if self.orphan_ttl <= Duration::ZERO {
            return Err(EngineError::Configuration(
                "orphan_ttl MUST be positive".to_string(),
            ));
        }

        if self.skew_tolerance < Duration::ZERO {
            return Err(EngineError::Configuration(
                "skew_tolerance MUST be >= 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(EngineError::Configuration(
                "queue_capacity MUST be >= 1".to_string(),
            ));
        }

        if self.tick_interval <= Duration::ZERO {
            return Err(EngineError::Configuration(
                "tick_interval MUST be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::v1()
    }
}

/// A prospective customer, tracked from signup to optional conversion.
///
/// Arrives as full-row upserts from the change-capture feed. `converted_at`
/// and `conversion_amount` are set at most once and never unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Lead {
    pub id: u64,
    pub email: String,
    pub utm_medium: String,
    pub utm_source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub converted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub conversion_amount: Option<i64>,
}

/// An incentive issued to a lead. Append-only; zero-or-one per lead.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Coupon {
    pub id: u64,
    pub lead_id: u64,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One model prediction for a lead. Append-only, keyed by `lead_id`;
/// a later prediction for the same lead overwrites the earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PredictionEvent {
    pub lead_id: u64,
    pub experiment_bucket: String,
    #[serde(with = "time::serde::rfc3339")]
    pub predicted_at: OffsetDateTime,
    pub score: f64,
    pub label: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangePayload {
    LeadUpsert { lead: Lead },
    CouponInsert { coupon: Coupon },
    Prediction { event: PredictionEvent },
}

/// Typed change-capture envelope handed to the engine by the host.
///
/// Wire decoding and schema validation are the host's concern; by the time an
/// event reaches the engine it is already typed. `committed_at` is the stream
/// clock for the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    pub payload: ChangePayload,
}

impl ChangeEvent {
    #[must_use]
    pub fn lead_upsert(committed_at: OffsetDateTime, lead: Lead) -> Self {
        Self {
            event_id: Ulid::new(),
            committed_at,
            payload: ChangePayload::LeadUpsert { lead },
        }
    }

    #[must_use]
    pub fn coupon_insert(committed_at: OffsetDateTime, coupon: Coupon) -> Self {
        Self {
            event_id: Ulid::new(),
            committed_at,
            payload: ChangePayload::CouponInsert { coupon },
        }
    }

    #[must_use]
    pub fn prediction(committed_at: OffsetDateTime, event: PredictionEvent) -> Self {
        Self {
            event_id: Ulid::new(),
            committed_at,
            payload: ChangePayload::Prediction { event },
        }
    }
}

/// One hopping-window frame. Derived, never stored durably.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WindowFrame {
    #[serde(with = "time::serde::rfc3339")]
    pub frame_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub frame_end: OffsetDateTime,
}

/// Pure hopping-window math: maps a timestamp to the frames it belongs to.
///
/// A timestamp `t` belongs to frame `f` iff `f.frame_start <= t <
/// f.frame_start + window_size` and `f.frame_start` is a whole (epoch-aligned)
/// multiple of `hop_period`. Deterministic and side-effect free, for both
/// real-time and replayed timestamps.
#[derive(Debug, Clone, Copy)]
pub struct WindowAssigner {
    window_size: Duration,
    hop_period: Duration,
    frames_per_window: i32,
}

impl WindowAssigner {
    /// Builds an assigner from a validated config.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the config is invalid.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let frames_per_window = (config.window_size.whole_nanoseconds()
            / config.hop_period.whole_nanoseconds()) as i32;
        Ok(Self {
            window_size: config.window_size,
            hop_period: config.hop_period,
            frames_per_window,
        })
    }

    /// Floors a timestamp to the previous hop boundary (toward negative
    /// infinity, so pre-epoch replay timestamps behave).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn hop_floor(&self, timestamp: OffsetDateTime) -> OffsetDateTime {
        let elapsed = (timestamp - OffsetDateTime::UNIX_EPOCH).whole_nanoseconds();
        let hop = self.hop_period.whole_nanoseconds();
        let floored = elapsed.div_euclid(hop) * hop;
        OffsetDateTime::UNIX_EPOCH + Duration::nanoseconds(floored as i64)
    }

    /// All frames containing `timestamp`, in ascending `frame_start` order.
    /// Exactly `window_size / hop_period` frames.
    #[must_use]
    pub fn frames_for(&self, timestamp: OffsetDateTime) -> Vec<WindowFrame> {
        let newest_start = self.hop_floor(timestamp);
        (0..self.frames_per_window)
            .rev()
            .map(|back| {
                let frame_start = newest_start - self.hop_period * back;
                WindowFrame {
                    frame_start,
                    frame_end: frame_start + self.window_size,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn is_expired(&self, frame: WindowFrame, now: OffsetDateTime) -> bool {
        now >= frame.frame_end
    }

    /// The instant at which the last frame containing `timestamp` closes.
    /// A row anchored at `timestamp` is retired once `now` reaches this.
    #[must_use]
    pub fn retirement_horizon(&self, timestamp: OffsetDateTime) -> OffsetDateTime {
        self.hop_floor(timestamp) + self.window_size
    }

    #[must_use]
    pub fn window_size(&self) -> Duration {
        self.window_size
    }
}

/// One joined (prediction, outcome) observation for a live lead.
///
/// The spine is the Lead stream: predictions and coupons are optional
/// (left-join semantics). `timestamp_second` anchors the row to the unix
/// second of `lead.created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetRow {
    pub timestamp_second: i64,
    pub lead_id: u64,
    pub experiment_bucket: Option<String>,
    pub predicted_score: Option<f64>,
    pub predicted_value: Option<bool>,
    pub outcome_value: Option<bool>,
    pub conversion_amount: Option<i64>,
    pub coupon_amount: Option<i64>,
}

/// Change notification from the join engine to the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowDelta {
    Upsert {
        before: Option<DatasetRow>,
        after: DatasetRow,
    },
    Delete {
        before: DatasetRow,
    },
}

/// Per-event policy counters. Ingestion-path problems are isolated, counted
/// and logged; they never abort the stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineCounters {
    pub malformed_events: u64,
    pub orphans_buffered: u64,
    pub orphans_dropped: u64,
    pub clock_skew_discarded: u64,
    pub late_updates_ignored: u64,
    pub rows_retired: u64,
}

#[derive(Debug, Clone)]
struct Orphan<T> {
    value: T,
    buffered_at: OffsetDateTime,
}

/// Maintains the materialized join of leads, coupons, predictions and the
/// live frame set, emitting [`RowDelta`]s as contributing state changes.
///
/// Exactly one live [`DatasetRow`] exists per lead while any frame containing
/// `lead.created_at` is still open; the row is deleted (with a delta) once
/// the last such frame expires. Coupons and predictions referencing a lead
/// the engine has not seen yet are buffered in bounded orphan buffers and
/// resolved when the lead arrives.
#[derive(Debug, Clone)]
pub struct TemporalJoinEngine {
    assigner: WindowAssigner,
    orphan_capacity: usize,
    orphan_ttl: Duration,
    skew_tolerance: Duration,
    leads: BTreeMap<u64, Lead>,
    coupons: BTreeMap<u64, Coupon>,
    predictions: BTreeMap<u64, PredictionEvent>,
    rows: BTreeMap<u64, DatasetRow>,
    open_frames: BTreeSet<WindowFrame>,
    retirements: BTreeMap<OffsetDateTime, BTreeSet<u64>>,
    orphan_coupons: VecDeque<Orphan<Coupon>>,
    orphan_predictions: VecDeque<Orphan<PredictionEvent>>,
    counters: EngineCounters,
}

impl TemporalJoinEngine {
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the config is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let assigner = WindowAssigner::new(config)?;
        Ok(Self {
            assigner,
            orphan_capacity: config.orphan_capacity,
            orphan_ttl: config.orphan_ttl,
            skew_tolerance: config.skew_tolerance,
            leads: BTreeMap::new(),
            coupons: BTreeMap::new(),
            predictions: BTreeMap::new(),
            rows: BTreeMap::new(),
            open_frames: BTreeSet::new(),
            retirements: BTreeMap::new(),
            orphan_coupons: VecDeque::new(),
            orphan_predictions: VecDeque::new(),
            counters: EngineCounters::default(),
        })
    }

    #[must_use]
    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    #[must_use]
    pub fn live_row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn open_frames(&self) -> Vec<WindowFrame> {
        self.open_frames.iter().copied().collect()
    }

    /// Applies a full-row lead upsert.
    ///
    /// A `converted_at` that becomes set within the window horizon corrects
    /// the row's outcome exactly once and re-emits an update delta (never a
    /// new row). A conversion beyond the horizon never flips an outcome.
    pub fn apply_lead_upsert(&mut self, lead: Lead, now: OffsetDateTime) -> Vec<RowDelta> {
        if let Err(reason) = self.validate_lead(&lead) {
            self.counters.malformed_events += 1;
            warn!(lead_id = lead.id, reason, "skipping malformed lead upsert");
            return Vec::new();
        }

        if lead.created_at - now > self.skew_tolerance {
            self.counters.clock_skew_discarded += 1;
            warn!(
                lead_id = lead.id,
                "lead created_at is beyond skew tolerance, discarding"
            );
            return Vec::new();
        }

        let horizon = self.assigner.retirement_horizon(lead.created_at);
        if now - horizon > self.skew_tolerance {
            self.counters.clock_skew_discarded += 1;
            warn!(
                lead_id = lead.id,
                "lead created_at is beyond skew tolerance in the past, discarding"
            );
            return Vec::new();
        }
        if now >= horizon {
            // Every frame for this lead has already closed; an expired row
            // must never be resurrected.
            self.counters.late_updates_ignored += 1;
            debug!(lead_id = lead.id, "ignoring upsert for retired window");
            return Vec::new();
        }

        let lead_id = lead.id;
        let is_new = !self.leads.contains_key(&lead_id);
        if is_new {
            self.retirements.entry(horizon).or_default().insert(lead_id);
        }
        self.leads.insert(lead_id, lead);

        if is_new {
            for coupon in drain_orphans(&mut self.orphan_coupons, lead_id, |c| c.lead_id) {
                self.coupons.insert(lead_id, coupon);
            }
            for event in drain_orphans(&mut self.orphan_predictions, lead_id, |p| p.lead_id) {
                self.predictions.insert(lead_id, event);
            }
        }

        self.recompute_row(lead_id).into_iter().collect()
    }

    /// Applies a coupon insert, joining by `lead_id` against the lead table.
    ///
    /// A coupon for an unknown lead is buffered pending the lead event; a
    /// buffered coupon that can no longer join a live row is dropped and
    /// counted. A coupon never resurrects an expired row.
    pub fn apply_coupon_insert(&mut self, coupon: Coupon, now: OffsetDateTime) -> Vec<RowDelta> {
        if coupon.amount < 0 {
            self.counters.malformed_events += 1;
            warn!(
                coupon_id = coupon.id,
                "skipping coupon with negative amount"
            );
            return Vec::new();
        }

        if coupon.created_at - now > self.skew_tolerance {
            self.counters.clock_skew_discarded += 1;
            warn!(
                coupon_id = coupon.id,
                "coupon created_at is beyond skew tolerance, discarding"
            );
            return Vec::new();
        }

        let lead_id = coupon.lead_id;
        if self.leads.contains_key(&lead_id) {
            self.coupons.insert(lead_id, coupon);
            return self.recompute_row(lead_id).into_iter().collect();
        }

        self.buffer_orphan_coupon(coupon, now);
        Vec::new()
    }

    /// Applies a prediction event, joining by `lead_id` against the spine.
    ///
    /// The most-recently-applied prediction for a lead wins (overwrite, not
    /// accumulate). Predictions for unknown leads are buffered like coupons.
    pub fn apply_prediction_event(
        &mut self,
        event: PredictionEvent,
        now: OffsetDateTime,
    ) -> Vec<RowDelta> {
        if !event.score.is_finite() || event.experiment_bucket.trim().is_empty() {
            self.counters.malformed_events += 1;
            warn!(lead_id = event.lead_id, "skipping malformed prediction");
            return Vec::new();
        }

        if event.predicted_at - now > self.skew_tolerance {
            self.counters.clock_skew_discarded += 1;
            warn!(
                lead_id = event.lead_id,
                "prediction predicted_at is beyond skew tolerance, discarding"
            );
            return Vec::new();
        }

        let lead_id = event.lead_id;
        if self.leads.contains_key(&lead_id) {
            self.predictions.insert(lead_id, event);
            return self.recompute_row(lead_id).into_iter().collect();
        }

        self.buffer_orphan_prediction(event, now);
        Vec::new()
    }

    /// Advances the window clock: opens newly eligible frames, retires
    /// expired ones, emits deletion deltas for rows whose last frame closed,
    /// and expires orphan-buffer entries past their TTL.
    pub fn tick(&mut self, now: OffsetDateTime) -> Vec<RowDelta> {
        self.open_frames
            .retain(|frame| now < frame.frame_end);
        for frame in self.assigner.frames_for(now) {
            self.open_frames.insert(frame);
        }

        let expired_keys: Vec<OffsetDateTime> = self
            .retirements
            .range(..=now)
            .map(|(horizon, _)| *horizon)
            .collect();

        let mut deltas = Vec::new();
        for horizon in expired_keys {
            let Some(lead_ids) = self.retirements.remove(&horizon) else {
                continue;
            };
            for lead_id in lead_ids {
                self.leads.remove(&lead_id);
                self.coupons.remove(&lead_id);
                self.predictions.remove(&lead_id);
                if let Some(before) = self.rows.remove(&lead_id) {
                    self.counters.rows_retired += 1;
                    deltas.push(RowDelta::Delete { before });
                }
            }
        }

        self.expire_orphans(now);
        deltas
    }

    fn validate_lead(&self, lead: &Lead) -> Result<(), &'static str> {
        if let Some(converted_at) = lead.converted_at {
            if converted_at < lead.created_at {
                return Err("converted_at precedes created_at");
            }
        } else if lead.conversion_amount.is_some() {
            return Err("conversion_amount set without converted_at");
        }

        if let Some(existing) = self.leads.get(&lead.id) {
            if existing.created_at != lead.created_at {
                return Err("created_at changed on upsert");
            }
            if let Some(existing_at) = existing.converted_at {
                if lead.converted_at != Some(existing_at) {
                    return Err("converted_at unset or changed after being set");
                }
                if lead.conversion_amount != existing.conversion_amount
                    && existing.conversion_amount.is_some()
                {
                    return Err("conversion_amount changed after being set");
                }
            }
        }

        Ok(())
    }

    fn buffer_orphan_coupon(&mut self, coupon: Coupon, now: OffsetDateTime) {
        self.counters.orphans_buffered += 1;
        self.orphan_coupons.push_back(Orphan {
            value: coupon,
            buffered_at: now,
        });
        if self.orphan_coupons.len() > self.orphan_capacity {
            let _ = self.orphan_coupons.pop_front();
            self.counters.orphans_dropped += 1;
            warn!("orphan coupon buffer at capacity, dropping oldest");
        }
    }

    fn buffer_orphan_prediction(&mut self, event: PredictionEvent, now: OffsetDateTime) {
        self.counters.orphans_buffered += 1;
        self.orphan_predictions.push_back(Orphan {
            value: event,
            buffered_at: now,
        });
        if self.orphan_predictions.len() > self.orphan_capacity {
            let _ = self.orphan_predictions.pop_front();
            self.counters.orphans_dropped += 1;
            warn!("orphan prediction buffer at capacity, dropping oldest");
        }
    }

    fn expire_orphans(&mut self, now: OffsetDateTime) {
        let ttl = self.orphan_ttl;
        let before = self.orphan_coupons.len() + self.orphan_predictions.len();
        self.orphan_coupons
            .retain(|orphan| orphan.buffered_at + ttl > now);
        self.orphan_predictions
            .retain(|orphan| orphan.buffered_at + ttl > now);
        let dropped = before - self.orphan_coupons.len() - self.orphan_predictions.len();
        if dropped > 0 {
            self.counters.orphans_dropped += u64::try_from(dropped).unwrap_or(u64::MAX);
            debug!(dropped, "expired orphan buffer entries past TTL");
        }
    }

    fn recompute_row(&mut self, lead_id: u64) -> Option<RowDelta> {
        let after = {
            let lead = self.leads.get(&lead_id)?;
            build_row(
                &self.assigner,
                lead,
                self.coupons.get(&lead_id),
                self.predictions.get(&lead_id),
            )
        };

        match self.rows.get(&lead_id) {
            Some(before) if *before == after => None,
            before => {
                let before = before.cloned();
                self.rows.insert(lead_id, after.clone());
                Some(RowDelta::Upsert { before, after })
            }
        }
    }
}

fn drain_orphans<T>(
    buffer: &mut VecDeque<Orphan<T>>,
    lead_id: u64,
    key: impl Fn(&T) -> u64,
) -> Vec<T> {
    let mut kept = VecDeque::with_capacity(buffer.len());
    let mut matched = Vec::new();
    for orphan in buffer.drain(..) {
        if key(&orphan.value) == lead_id {
            matched.push(orphan.value);
        } else {
            kept.push_back(orphan);
        }
    }
    *buffer = kept;
    matched
}

/// Derives the current [`DatasetRow`] for a lead from the three entity
/// tables. A conversion only counts if it landed within `window_size` of the
/// lead's creation, so a late conversion can never retroactively flip an
/// earlier-window outcome.
fn build_row(
    assigner: &WindowAssigner,
    lead: &Lead,
    coupon: Option<&Coupon>,
    prediction: Option<&PredictionEvent>,
) -> DatasetRow {
    let horizon = lead.created_at + assigner.window_size();
    let converted = lead
        .converted_at
        .is_some_and(|converted_at| converted_at <= horizon);

    DatasetRow {
        timestamp_second: lead.created_at.unix_timestamp(),
        lead_id: lead.id,
        experiment_bucket: prediction.map(|p| p.experiment_bucket.clone()),
        predicted_score: prediction.map(|p| p.score),
        predicted_value: prediction.map(|p| p.label),
        outcome_value: Some(converted),
        conversion_amount: if converted {
            lead.conversion_amount
        } else {
            None
        },
        coupon_amount: coupon.map(|c| c.amount),
    }
}

/// Key of one metrics cell: the unix second a lead was created in, plus the
/// experiment bucket its prediction assigned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CellKey {
    pub timestamp_second: i64,
    pub experiment_bucket: String,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
struct CellAccumulator {
    num_leads: i64,
    true_positives: i64,
    false_positives: i64,
    true_negatives: i64,
    false_negatives: i64,
    conversion_cents: i64,
    coupon_cents: i64,
}

impl CellAccumulator {
    fn is_zero(self) -> bool {
        self == Self::default()
    }

    fn is_negative(self) -> bool {
        self.num_leads < 0
            || self.true_positives < 0
            || self.false_positives < 0
            || self.true_negatives < 0
            || self.false_negatives < 0
    }
}

/// Derived classification metrics for one (second, bucket) cell.
///
/// Revenue is reported in fractional currency units (internal accumulation
/// is integer cents); the ratio metrics are `None` when their denominator is
/// zero — never an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsRow {
    pub timestamp_second: i64,
    pub experiment_bucket: String,
    pub num_leads: i64,
    pub true_positives: i64,
    pub false_positives: i64,
    pub true_negatives: i64,
    pub false_negatives: i64,
    pub conversion_revenue: f64,
    pub net_conversion_revenue: f64,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

/// Change notification from the aggregator to view consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetricsDelta {
    Upsert {
        row: MetricsRow,
    },
    Delete {
        timestamp_second: i64,
        experiment_bucket: String,
    },
}

struct Contribution {
    key: CellKey,
    predicted: bool,
    outcome: bool,
    conversion_cents: i64,
    coupon_cents: i64,
}

fn contribution(row: &DatasetRow) -> Option<Contribution> {
    let bucket = row.experiment_bucket.as_ref()?;
    let predicted = row.predicted_value?;
    let outcome = row.outcome_value?;
    Some(Contribution {
        key: CellKey {
            timestamp_second: row.timestamp_second,
            experiment_bucket: bucket.clone(),
        },
        predicted,
        outcome,
        conversion_cents: row.conversion_amount.unwrap_or(0),
        coupon_cents: row.coupon_amount.unwrap_or(0),
    })
}

/// Incrementally folds [`RowDelta`]s into per-(second, bucket) confusion
/// matrix and revenue accumulators.
///
/// The fold is subtract-then-add: a row's prior contribution is removed
/// before its new contribution is applied, which makes the accumulators
/// correct under insert, update and delete alike. A row contributes only
/// when its bucket, prediction and outcome are all known.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    cells: BTreeMap<CellKey, CellAccumulator>,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Folds one batch of row deltas and returns the deltas for every
    /// touched metrics cell.
    ///
    /// # Errors
    /// Returns [`EngineError::InvariantViolation`] if any counter would go
    /// negative. That indicates the subtract-then-add protocol was violated
    /// upstream and is a programming fault, not an input problem.
    pub fn apply(&mut self, deltas: &[RowDelta]) -> Result<Vec<MetricsDelta>, EngineError> {
        let mut touched = BTreeSet::new();

        for delta in deltas {
            match delta {
                RowDelta::Upsert { before, after } => {
                    if let Some(before) = before {
                        self.fold(before, -1, &mut touched);
                    }
                    self.fold(after, 1, &mut touched);
                }
                RowDelta::Delete { before } => {
                    self.fold(before, -1, &mut touched);
                }
            }
        }

        let mut out = Vec::with_capacity(touched.len());
        for key in touched {
            let Some(cell) = self.cells.get(&key).copied() else {
                continue;
            };
            if cell.is_negative() {
                return Err(EngineError::InvariantViolation(format!(
                    "negative counter in cell ({}, {})",
                    key.timestamp_second, key.experiment_bucket
                )));
            }
            if cell.is_zero() {
                self.cells.remove(&key);
                out.push(MetricsDelta::Delete {
                    timestamp_second: key.timestamp_second,
                    experiment_bucket: key.experiment_bucket,
                });
            } else {
                out.push(MetricsDelta::Upsert {
                    row: derive_metrics(&key, cell),
                });
            }
        }

        Ok(out)
    }

    fn fold(&mut self, row: &DatasetRow, sign: i64, touched: &mut BTreeSet<CellKey>) {
        let Some(contribution) = contribution(row) else {
            return;
        };

        let cell = self.cells.entry(contribution.key.clone()).or_default();
        cell.num_leads += sign;
        match (contribution.predicted, contribution.outcome) {
            (true, true) => cell.true_positives += sign,
            (true, false) => cell.false_positives += sign,
            (false, false) => cell.true_negatives += sign,
            (false, true) => cell.false_negatives += sign,
        }
        cell.conversion_cents += sign * contribution.conversion_cents;
        cell.coupon_cents += sign * contribution.coupon_cents;
        touched.insert(contribution.key);
    }
}

#[allow(clippy::cast_precision_loss)]
fn derive_metrics(key: &CellKey, cell: CellAccumulator) -> MetricsRow {
    let tp = cell.true_positives;
    let fp = cell.false_positives;
    let fn_count = cell.false_negatives;

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_count);
    let f1_denominator = tp as f64 + 0.5 * ((fp + fn_count) as f64);
    let f1 = if f1_denominator == 0.0 {
        None
    } else {
        Some(tp as f64 / f1_denominator)
    };

    MetricsRow {
        timestamp_second: key.timestamp_second,
        experiment_bucket: key.experiment_bucket.clone(),
        num_leads: cell.num_leads,
        true_positives: tp,
        false_positives: fp,
        true_negatives: cell.true_negatives,
        false_negatives: fn_count,
        conversion_revenue: cell.conversion_cents as f64 / 100.0,
        net_conversion_revenue: (cell.conversion_cents - cell.coupon_cents) as f64 / 100.0,
        precision,
        recall,
        f1,
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: i64, denominator: i64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

/// Holds the committed [`MetricsRow`] set plus a version that advances once
/// per applied batch, so a whole upstream event becomes visible atomically.
#[derive(Debug, Clone, Default)]
pub struct ViewMaterializer {
    rows: BTreeMap<CellKey, MetricsRow>,
    version: u64,
}

impl ViewMaterializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a whole delta batch as one commit. Empty batches do not
    /// advance the version.
    pub fn apply(&mut self, batch: &[MetricsDelta]) {
        if batch.is_empty() {
            return;
        }
        for delta in batch {
            match delta {
                MetricsDelta::Upsert { row } => {
                    let key = CellKey {
                        timestamp_second: row.timestamp_second,
                        experiment_bucket: row.experiment_bucket.clone(),
                    };
                    self.rows.insert(key, row.clone());
                }
                MetricsDelta::Delete {
                    timestamp_second,
                    experiment_bucket,
                } => {
                    let key = CellKey {
                        timestamp_second: *timestamp_second,
                        experiment_bucket: experiment_bucket.clone(),
                    };
                    self.rows.remove(&key);
                }
            }
        }
        self.version += 1;
    }

    /// The committed rows, ordered by `(timestamp_second, experiment_bucket)`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricsRow> {
        self.rows.values().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, timestamp_second: i64, experiment_bucket: &str) -> Option<&MetricsRow> {
        self.rows.get(&CellKey {
            timestamp_second,
            experiment_bucket: experiment_bucket.to_string(),
        })
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Facade wiring engine, aggregator and materializer into the fixed
/// join-and-aggregate pipeline. One call per upstream event; the returned
/// metrics deltas are already committed to the internal view.
#[derive(Debug, Clone)]
pub struct ConversionMonitor {
    engine: TemporalJoinEngine,
    aggregator: MetricsAggregator,
    view: ViewMaterializer,
}

impl ConversionMonitor {
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the config is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            engine: TemporalJoinEngine::new(config)?,
            aggregator: MetricsAggregator::new(),
            view: ViewMaterializer::new(),
        })
    }

    /// Applies one typed change event using its `committed_at` as the stream
    /// clock.
    ///
    /// # Errors
    /// Returns [`EngineError::InvariantViolation`] on an aggregator logic
    /// fault; per-event input problems are counted, not raised.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<Vec<MetricsDelta>, EngineError> {
        let now = event.committed_at;
        let row_deltas = match &event.payload {
            ChangePayload::LeadUpsert { lead } => self.engine.apply_lead_upsert(lead.clone(), now),
            ChangePayload::CouponInsert { coupon } => {
                self.engine.apply_coupon_insert(coupon.clone(), now)
            }
            ChangePayload::Prediction { event } => {
                self.engine.apply_prediction_event(event.clone(), now)
            }
        };
        self.commit(&row_deltas)
    }

    /// Advances the window clock.
    ///
    /// # Errors
    /// Returns [`EngineError::InvariantViolation`] on an aggregator logic
    /// fault.
    pub fn tick(&mut self, now: OffsetDateTime) -> Result<Vec<MetricsDelta>, EngineError> {
        let row_deltas = self.engine.tick(now);
        self.commit(&row_deltas)
    }

    fn commit(&mut self, row_deltas: &[RowDelta]) -> Result<Vec<MetricsDelta>, EngineError> {
        let metric_deltas = self.aggregator.apply(row_deltas)?;
        self.view.apply(&metric_deltas);
        Ok(metric_deltas)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricsRow> {
        self.view.snapshot()
    }

    #[must_use]
    pub fn get(&self, timestamp_second: i64, experiment_bucket: &str) -> Option<&MetricsRow> {
        self.view.get(timestamp_second, experiment_bucket)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.view.version()
    }

    #[must_use]
    pub fn counters(&self) -> EngineCounters {
        self.engine.counters()
    }

    #[must_use]
    pub fn live_row_count(&self) -> usize {
        self.engine.live_row_count()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::MalformedEvent`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::MalformedEvent(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::MalformedEvent(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::MalformedEvent`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::MalformedEvent(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
