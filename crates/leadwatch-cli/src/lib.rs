//! Command surface for driving the LeadWatch engine from a terminal.
//!
//! Two modes, both deterministic:
//! - [`run_replay`] feeds an NDJSON event log (change events plus explicit
//!   ticks) through the engine and reports the final committed view.
//! - [`run_simulate`] generates a seeded synthetic workload with the same
//!   shape as the production load generator (leads arriving on a fixed
//!   cadence, score-thresholded predictions, coupons for unlikely
//!   converters outside the control bucket, conversions landing within the
//!   next 30 seconds) and runs it through the real engine.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::warn;

use leadwatch_core::{
    ChangeEvent, ConversionMonitor, Coupon, EngineConfig, EngineCounters, EngineError, Lead,
    MetricsRow, PredictionEvent,
};

#[derive(Debug, Parser)]
#[command(name = "lw")]
#[command(about = "LeadWatch conversion-monitor CLI")]
pub struct Cli {
    /// Engine config override, JSON-encoded `EngineConfig`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay an NDJSON event log through the engine.
    Replay(ReplayArgs),
    /// Run a seeded synthetic workload through the engine.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Path to the NDJSON replay log.
    #[arg(long)]
    input: PathBuf,

    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 200)]
    leads: u32,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Milliseconds between lead arrivals.
    #[arg(long, default_value_t = 10)]
    spacing_ms: u32,

    #[arg(long, default_value_t = false)]
    pretty: bool,
}

/// One line of an NDJSON replay log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    LeadUpsert {
        #[serde(with = "time::serde::rfc3339")]
        committed_at: OffsetDateTime,
        lead: Lead,
    },
    CouponInsert {
        #[serde(with = "time::serde::rfc3339")]
        committed_at: OffsetDateTime,
        coupon: Coupon,
    },
    Prediction {
        #[serde(with = "time::serde::rfc3339")]
        committed_at: OffsetDateTime,
        event: PredictionEvent,
    },
    Tick {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

/// Final committed view after a replay or simulation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayReport {
    pub version: u64,
    pub rows: Vec<MetricsRow>,
    pub counters: EngineCounters,
    pub malformed_lines: u64,
}

/// Parsed-CLI execution entrypoint, kept separate from `main` so host
/// projects can embed the command surface.
///
/// # Errors
/// Returns an error for unreadable inputs, invalid config overrides, or a
/// fatal engine fault.
pub fn run_cli(cli: Cli) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Replay(args) => {
            let file = File::open(&args.input)
                .with_context(|| format!("failed to open {}", args.input.display()))?;
            let report = run_replay(&config, BufReader::new(file))?;
            print_report(&report, args.pretty)
        }
        Command::Simulate(args) => {
            let report = run_simulate(&config, args.leads, args.seed, args.spacing_ms)?;
            print_report(&report, args.pretty)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::v1());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn print_report(report: &ReplayReport, pretty: bool) -> Result<()> {
    let body = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    println!("{body}");
    Ok(())
}

/// Replays an NDJSON event log through a fresh engine. Malformed lines are
/// skipped and counted; engine-level input problems are counted by the
/// engine itself. Only a logic fault aborts the run.
///
/// # Errors
/// Returns an error on I/O failure or a fatal engine fault.
pub fn run_replay(config: &EngineConfig, reader: impl BufRead) -> Result<ReplayReport> {
    let mut monitor = ConversionMonitor::new(config)?;
    let mut malformed_lines = 0_u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read replay line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayRecord>(&line) {
            Ok(record) => {
                apply_record(&mut monitor, record)
                    .with_context(|| format!("fatal engine fault at replay line {line_no}"))?;
            }
            Err(err) => {
                malformed_lines += 1;
                warn!(line_no, "skipping malformed replay line: {err}");
            }
        }
    }

    Ok(report_of(&monitor, malformed_lines))
}

fn apply_record(monitor: &mut ConversionMonitor, record: ReplayRecord) -> Result<(), EngineError> {
    match record {
        ReplayRecord::LeadUpsert { committed_at, lead } => monitor
            .apply_event(&ChangeEvent::lead_upsert(committed_at, lead))
            .map(|_| ()),
        ReplayRecord::CouponInsert {
            committed_at,
            coupon,
        } => monitor
            .apply_event(&ChangeEvent::coupon_insert(committed_at, coupon))
            .map(|_| ()),
        ReplayRecord::Prediction {
            committed_at,
            event,
        } => monitor
            .apply_event(&ChangeEvent::prediction(committed_at, event))
            .map(|_| ()),
        ReplayRecord::Tick { at } => monitor.tick(at).map(|_| ()),
    }
}

fn report_of(monitor: &ConversionMonitor, malformed_lines: u64) -> ReplayReport {
    ReplayReport {
        version: monitor.version(),
        rows: monitor.snapshot(),
        counters: monitor.counters(),
        malformed_lines,
    }
}

const MEDIUM_TO_SOURCES: &[(&str, &[&str])] = &[
    ("email", &["klaviyo.com"]),
    ("social", &["facebook.com", "twitter.com", "instagram.com"]),
    ("organic", &["none", "google.com"]),
    ("referral", &["hackernews.com", "reddit.com"]),
];

/// Generates a seeded synthetic workload and runs it through the engine.
///
/// Workload shape mirrors the production load generator: one lead every
/// `spacing_ms`, a uniform score thresholded at 0.5 into a label, a control
/// bucket for `id % 10 <= 1`, a coupon when a non-control lead looks
/// unlikely to convert (with a second conversion chance), and conversions
/// landing uniformly within the next 30 seconds. Window ticks run on the
/// configured hop period. Identical seeds produce identical reports.
///
/// # Errors
/// Returns an error on invalid config or a fatal engine fault.
pub fn run_simulate(
    config: &EngineConfig,
    leads: u32,
    seed: u64,
    spacing_ms: u32,
) -> Result<ReplayReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base = OffsetDateTime::UNIX_EPOCH;

    // (time, tick-before-event rank, arrival order, record)
    let mut timeline: Vec<(OffsetDateTime, u8, usize, ReplayRecord)> = Vec::new();
    let mut seq = 0_usize;
    let mut push = |timeline: &mut Vec<_>, at: OffsetDateTime, rank: u8, record: ReplayRecord| {
        timeline.push((at, rank, seq, record));
        seq += 1;
    };

    let mut last_created = base;
    for index in 0..leads {
        let id = u64::from(index) + 1;
        let created_at = base + Duration::milliseconds(i64::from(spacing_ms) * i64::from(index));
        let lead = rand_lead(&mut rng, id, created_at);

        let score: f64 = rng.gen();
        let label = score > 0.5;
        let experiment_bucket = if id % 10 <= 1 { "control" } else { "experiment" };

        push(
            &mut timeline,
            created_at,
            1,
            ReplayRecord::LeadUpsert {
                committed_at: created_at,
                lead: lead.clone(),
            },
        );
        push(
            &mut timeline,
            created_at,
            1,
            ReplayRecord::Prediction {
                committed_at: created_at,
                event: PredictionEvent {
                    lead_id: id,
                    experiment_bucket: experiment_bucket.to_string(),
                    predicted_at: created_at,
                    score,
                    label,
                },
            },
        );

        let mut sent_coupon = false;
        if !label && experiment_bucket != "control" {
            push(
                &mut timeline,
                created_at,
                1,
                ReplayRecord::CouponInsert {
                    committed_at: created_at,
                    coupon: Coupon {
                        id,
                        lead_id: id,
                        amount: rng.gen_range(500..=5_000),
                        created_at,
                    },
                },
            );
            sent_coupon = true;
        }

        let mut did_convert = rng.gen::<f64>() < score;
        if sent_coupon && !did_convert {
            // The coupon buys the lead a second chance to convert.
            did_convert = rng.gen::<f64>() < score;
        }

        if did_convert {
            let converted_at = created_at + Duration::seconds_f64(rng.gen::<f64>() * 30.0);
            let mut converted = lead;
            converted.converted_at = Some(converted_at);
            converted.conversion_amount = Some(rng.gen_range(1_000..=25_000));
            push(
                &mut timeline,
                converted_at,
                1,
                ReplayRecord::LeadUpsert {
                    committed_at: converted_at,
                    lead: converted,
                },
            );
        }

        last_created = created_at;
    }

    // Ticks cover the arrival span only. Running them past the retirement
    // horizon would drain the view and make the report trivially empty.
    let mut tick_at = base;
    while tick_at <= last_created {
        push(&mut timeline, tick_at, 0, ReplayRecord::Tick { at: tick_at });
        tick_at += config.hop_period;
    }

    timeline.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

    let mut monitor = ConversionMonitor::new(config)?;
    for (_, _, _, record) in timeline {
        apply_record(&mut monitor, record).context("fatal engine fault during simulation")?;
    }

    Ok(report_of(&monitor, 0))
}

fn rand_lead(rng: &mut StdRng, id: u64, created_at: OffsetDateTime) -> Lead {
    let (utm_medium, sources) = match MEDIUM_TO_SOURCES.choose(rng) {
        Some(entry) => *entry,
        None => ("organic", &["none"] as &[&str]),
    };
    let utm_source = sources.choose(rng).copied().unwrap_or("none");

    let local_len = rng.gen_range(4..=20);
    let domain_len = rng.gen_range(3..=5);
    let mut email = rand_letters(rng, local_len);
    email.push('@');
    email.push_str(&rand_letters(rng, domain_len));
    email.push_str(".com");

    Lead {
        id,
        email,
        utm_medium: utm_medium.to_string(),
        utm_source: utm_source.to_string(),
        created_at,
        converted_at: None,
        conversion_amount: None,
    }
}

fn rand_letters(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn simulate_is_deterministic_under_a_fixed_seed() {
        let config = EngineConfig::v1();
        let first = must_ok(run_simulate(&config, 50, 42, 10));
        let second = must_ok(run_simulate(&config, 50, 42, 10));
        assert_eq!(first, second);
    }

    #[test]
    fn simulate_respects_the_control_split() {
        let config = EngineConfig::v1();
        let report = must_ok(run_simulate(&config, 100, 3, 10));
        let buckets: Vec<&str> = report
            .rows
            .iter()
            .map(|row| row.experiment_bucket.as_str())
            .collect();
        assert!(buckets.contains(&"experiment"));
        assert!(buckets.contains(&"control"));
    }

    #[test]
    fn simulate_reports_consistent_matrices() {
        let config = EngineConfig::v1();
        let report = must_ok(run_simulate(&config, 120, 11, 10));
        assert_eq!(report.counters.malformed_events, 0);
        for row in &report.rows {
            let matrix_sum = row.true_positives
                + row.false_positives
                + row.true_negatives
                + row.false_negatives;
            assert_eq!(matrix_sum, row.num_leads);
        }
    }
}
