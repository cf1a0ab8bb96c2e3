use std::io::Cursor;

use leadwatch_cli::{run_replay, ReplayRecord, ReplayReport};
use leadwatch_core::{parse_rfc3339_utc, Coupon, EngineConfig, Lead, PredictionEvent};
use time::{Duration, OffsetDateTime};

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn ts(value: &str) -> OffsetDateTime {
    must_ok(parse_rfc3339_utc(value))
}

fn lead(id: u64, created_at: OffsetDateTime) -> Lead {
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

fn prediction(lead_id: u64, predicted_at: OffsetDateTime, score: f64, label: bool) -> PredictionEvent {
    PredictionEvent {
        lead_id,
        experiment_bucket: "experiment".to_string(),
        predicted_at,
        score,
        label,
    }
}

fn ndjson(records: &[ReplayRecord]) -> String {
    records
        .iter()
        .map(|record| must_ok(serde_json::to_string(record)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn replay(log: &str) -> ReplayReport {
    must_ok(run_replay(&EngineConfig::v1(), Cursor::new(log)))
}

#[test]
fn unconverted_positive_prediction_reports_a_false_positive() {
    let at = ts("2024-01-01T00:00:00Z");
    let log = ndjson(&[
        ReplayRecord::LeadUpsert {
            committed_at: at,
            lead: lead(1, at),
        },
        ReplayRecord::Prediction {
            committed_at: at,
            event: prediction(1, at, 0.9, true),
        },
    ]);

    let report = replay(&log);
    assert_eq!(report.malformed_lines, 0);
    assert_eq!(report.rows.len(), 1);

    let row = &report.rows[0];
    assert_eq!(row.timestamp_second, at.unix_timestamp());
    assert_eq!(row.experiment_bucket, "experiment");
    assert_eq!(row.num_leads, 1);
    assert_eq!(row.false_positives, 1);
    assert_eq!(row.true_positives, 0);
    assert_eq!(row.precision, Some(0.0));
    assert_eq!(row.recall, None);
    assert_eq!(row.f1, Some(0.0));
}

#[test]
fn converted_lead_reports_revenue_net_of_coupon_spend() {
    let at = ts("2024-01-01T00:00:00Z");
    let mut converted = lead(1, at);
    converted.converted_at = Some(at + Duration::seconds(10));
    converted.conversion_amount = Some(500);

    let log = ndjson(&[
        ReplayRecord::LeadUpsert {
            committed_at: at,
            lead: lead(1, at),
        },
        ReplayRecord::CouponInsert {
            committed_at: at,
            coupon: Coupon {
                id: 1,
                lead_id: 1,
                amount: 100,
                created_at: at,
            },
        },
        ReplayRecord::Prediction {
            committed_at: at,
            event: prediction(1, at, 0.8, true),
        },
        ReplayRecord::LeadUpsert {
            committed_at: at + Duration::seconds(10),
            lead: converted,
        },
    ]);

    let report = replay(&log);
    let row = &report.rows[0];
    assert_eq!(row.true_positives, 1);
    assert!((row.conversion_revenue - 5.0).abs() < f64::EPSILON);
    assert!((row.net_conversion_revenue - 4.0).abs() < f64::EPSILON);
    assert_eq!(row.precision, Some(1.0));
    assert_eq!(row.recall, Some(1.0));
}

#[test]
fn malformed_lines_are_skipped_and_counted() {
    let at = ts("2024-01-01T00:00:00Z");
    let good = ndjson(&[
        ReplayRecord::LeadUpsert {
            committed_at: at,
            lead: lead(1, at),
        },
        ReplayRecord::Prediction {
            committed_at: at,
            event: prediction(1, at, 0.3, false),
        },
    ]);
    let log = format!("{good}\nnot json at all\n\n{{\"kind\":\"unknown\"}}\n");

    let report = replay(&log);
    assert_eq!(report.malformed_lines, 2);
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].true_negatives, 1);
}

#[test]
fn orphan_coupon_joins_once_its_lead_arrives() {
    let at = ts("2024-01-01T00:00:00Z");
    let mut converted = lead(7, at);
    converted.converted_at = Some(at + Duration::seconds(5));
    converted.conversion_amount = Some(1_000);

    let log = ndjson(&[
        ReplayRecord::CouponInsert {
            committed_at: at,
            coupon: Coupon {
                id: 9,
                lead_id: 7,
                amount: 250,
                created_at: at,
            },
        },
        ReplayRecord::LeadUpsert {
            committed_at: at,
            lead: lead(7, at),
        },
        ReplayRecord::Prediction {
            committed_at: at,
            event: prediction(7, at, 0.6, true),
        },
        ReplayRecord::LeadUpsert {
            committed_at: at + Duration::seconds(5),
            lead: converted,
        },
    ]);

    let report = replay(&log);
    assert_eq!(report.counters.orphans_buffered, 1);
    assert_eq!(report.counters.orphans_dropped, 0);
    let row = &report.rows[0];
    assert!((row.net_conversion_revenue - 7.5).abs() < f64::EPSILON);
}

#[test]
fn tick_past_the_horizon_retires_rows_from_the_view() {
    let at = ts("2024-01-01T00:00:00Z");
    let log = ndjson(&[
        ReplayRecord::LeadUpsert {
            committed_at: at,
            lead: lead(1, at),
        },
        ReplayRecord::Prediction {
            committed_at: at,
            event: prediction(1, at, 0.9, true),
        },
        ReplayRecord::Tick {
            at: at + Duration::seconds(32),
        },
    ]);

    let report = replay(&log);
    assert!(report.rows.is_empty());
    assert_eq!(report.counters.rows_retired, 1);
    assert!(report.version >= 2);
}
