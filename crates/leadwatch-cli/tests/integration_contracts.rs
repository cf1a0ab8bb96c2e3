use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::Value;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn replay_contract_pack_validates_fixtures() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/replay/v1/schemas");
    let fixture_dir = repo.join("contracts/replay/v1/fixtures");

    let report = read_json(&fixture_dir.join("replay-report.sample.json"));
    assert_schema(&schema_dir.join("replay-report.schema.json"), &report);
}

#[test]
fn fixture_report_round_trips_through_the_typed_model() {
    let repo = repo_root();
    let fixture = repo.join("contracts/replay/v1/fixtures/replay-report.sample.json");
    let raw = read_json(&fixture);

    let typed: leadwatch_cli::ReplayReport = match serde_json::from_value(raw.clone()) {
        Ok(value) => value,
        Err(err) => panic!("fixture does not match the typed report model: {err}"),
    };
    let back = match serde_json::to_value(&typed) {
        Ok(value) => value,
        Err(err) => panic!("failed to re-serialize typed report: {err}"),
    };
    assert_eq!(raw, back);
}
