use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

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

fn schema_errors(schema_path: &Path, value: &Value) -> Vec<String> {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        .unwrap_or_default()
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let errors = schema_errors(schema_path, value);
    assert!(
        errors.is_empty(),
        "schema validation failed for {}:\n{}",
        schema_path.display(),
        errors.join("\n")
    );
}

fn heatcast_json(db_path: &Path, args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_heatcast"))
        .arg("--db")
        .arg(db_path)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to run heatcast {args:?}: {err}"));
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "heatcast {args:?} did not print JSON: {err}\nstderr={}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn contract_pack_validates_fixtures() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/v1/schemas");
    let fixture_dir = repo.join("contracts/v1/fixtures");

    let ranked = read_json(&fixture_dir.join("prediction.sample.json"));
    assert_schema(&schema_dir.join("prediction.schema.json"), &ranked);

    let short = read_json(&fixture_dir.join("prediction-insufficient.sample.json"));
    assert_schema(&schema_dir.join("prediction.schema.json"), &short);

    let mut drifted = ranked.clone();
    drifted["records"][0]["confidence_tier"] = Value::from("S");
    assert!(!schema_errors(&schema_dir.join("prediction.schema.json"), &drifted).is_empty());
}

#[test]
fn live_outputs_match_contract_schemas() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/v1/schemas");
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let db_path =
        std::env::temp_dir().join(format!("heatcast-integration-{}.sqlite3", Ulid::new()));

    for name in ["race-20260207-24-01.json", "race-20260207-24-02-short.json"] {
        let file = fixtures.join(name);
        let file = file.to_string_lossy();
        heatcast_json(&db_path, &["race", "import", "--file", &file]);
    }

    let ranked = heatcast_json(
        &db_path,
        &[
            "predict",
            "--race-id",
            "20260207-24-01",
            "--json",
            "--set",
            "dynamic_integration=true",
        ],
    );
    assert_schema(&schema_dir.join("prediction.schema.json"), &ranked);
    assert_eq!(ranked["records"][0]["integration_mode"]["mode"], Value::from("dynamic"));

    let short = heatcast_json(&db_path, &["predict", "--race-id", "20260207-24-02", "--json"]);
    assert_schema(&schema_dir.join("prediction.schema.json"), &short);

    let report = heatcast_json(&db_path, &["batch", "--json"]);
    assert_schema(&schema_dir.join("batch-report.schema.json"), &report);

    let flags = heatcast_json(&db_path, &["flags", "list", "--json"]);
    assert_schema(&schema_dir.join("flags.schema.json"), &flags);
}
