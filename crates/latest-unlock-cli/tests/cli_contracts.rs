#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
}

fn lu_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_lu"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run lu command {:?}: {err}", args),
    }
}

fn assert_success(output: &Output, context: &str) {
    assert!(
        output.status.success(),
        "{context} failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
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

fn seed(db_path: &Path, scope_id: &str) {
    let output = lu_output(
        db_path,
        &[
            "dataset",
            "seed",
            "--scope-id",
            scope_id,
            "--actors",
            "6",
            "--targets",
            "5",
            "--attempts-per-group",
            "3",
            "--delete-every",
            "9",
        ],
    );
    assert_success(&output, "dataset seed");
    let report = stdout_json(&output);
    assert_eq!(report["contract_version"], serde_json::json!("seed_report.v1"));
    assert_eq!(report["inserted_rows"], serde_json::json!(90));
}

fn latest_ids(db_path: &Path, strategy: &str) -> Vec<i64> {
    let output = lu_output(
        db_path,
        &[
            "unlocks",
            "latest",
            "--scope-id",
            "1",
            "--strategy",
            strategy,
            "--json",
        ],
    );
    assert_success(&output, "unlocks latest");
    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], serde_json::json!("latest_unlocks.v1"));

    let mut ids = payload["records"]
        .as_array()
        .unwrap_or_else(|| panic!("records must be an array: {payload}"))
        .iter()
        .map(|item| {
            item["id"]
                .as_i64()
                .unwrap_or_else(|| panic!("record id must be an integer: {item}"))
        })
        .collect::<Vec<_>>();
    ids.sort_unstable();
    ids
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_lu")).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["unlocks", "strategy", "benchmark", "dataset", "config"] {
        assert!(stdout.contains(required), "missing `{required}` in help: {stdout}");
    }
}

#[test]
fn benchmark_run_json_matches_schema() {
    let db_path = temp_path("lu-contract-benchmark", "sqlite3");
    seed(&db_path, "1");

    let output = lu_output(
        &db_path,
        &["benchmark", "run", "--scope-id", "1", "--join-timeout-ms", "30000", "--json"],
    );
    assert_success(&output, "benchmark run");

    let payload = stdout_json(&output);
    assert_schema("benchmark-run.schema.json", &payload);
    assert_eq!(payload["winner"]["count"], payload["loser"]["count"]);
    assert_eq!(payload["winner"]["count"], serde_json::json!(30));
    assert_ne!(payload["winner"]["type"], payload["loser"]["type"]);

    let _ = fs::remove_file(&db_path);
}

#[test]
fn strategy_select_json_matches_schema() {
    let db_path = temp_path("lu-contract-select", "sqlite3");
    seed(&db_path, "1");

    let output = lu_output(&db_path, &["strategy", "select", "--scope-id", "1", "--json"]);
    assert_success(&output, "strategy select");

    let payload = stdout_json(&output);
    assert_schema("strategy-decision.schema.json", &payload);
    assert_eq!(payload["decision"]["strategy"], serde_json::json!("grouped_max_join"));
    assert_eq!(
        payload["decision"]["reason_code"],
        serde_json::json!("join.small_table_low_duplication")
    );

    let _ = fs::remove_file(&db_path);
}

#[test]
fn empty_scope_selects_join_and_has_no_eligible_targets() {
    let db_path = temp_path("lu-contract-empty", "sqlite3");

    let output = lu_output(&db_path, &["strategy", "select", "--scope-id", "77", "--json"]);
    assert_success(&output, "strategy select on empty scope");
    let payload = stdout_json(&output);
    assert_schema("strategy-decision.schema.json", &payload);
    assert_eq!(payload["decision"]["reason_code"], serde_json::json!("join.empty_dataset"));

    let output = lu_output(&db_path, &["unlocks", "eligible", "--scope-id", "77", "--json"]);
    assert_success(&output, "unlocks eligible");
    assert_eq!(stdout_json(&output)["target_ids"], serde_json::json!([]));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn forced_strategies_return_identical_latest_rows() {
    let db_path = temp_path("lu-contract-latest", "sqlite3");
    seed(&db_path, "1");

    let joined = latest_ids(&db_path, "grouped-max-join");
    let ranked = latest_ids(&db_path, "partitioned-rank");
    let auto = latest_ids(&db_path, "auto");

    assert_eq!(joined.len(), 30);
    assert_eq!(joined, ranked);
    assert_eq!(joined, auto);

    let _ = fs::remove_file(&db_path);
}

#[test]
fn logs_stay_on_stderr_when_verbose() {
    let db_path = temp_path("lu-contract-logs", "sqlite3");
    seed(&db_path, "1");

    let output = match Command::new(env!("CARGO_BIN_EXE_lu"))
        .env("RUST_LOG", "debug")
        .arg("--db")
        .arg(&db_path)
        .args(["unlocks", "stats", "--scope-id", "1", "--json"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run stats command: {err}"),
    };
    assert_success(&output, "unlocks stats");

    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], serde_json::json!("dataset_statistics.v1"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("computed dataset statistics"));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn config_show_reflects_partial_config_file() {
    let db_path = temp_path("lu-contract-config", "sqlite3");
    let config_path = temp_path("lu-contract-config", "json");
    if let Err(err) = fs::write(&config_path, r#"{"selector":{"huge_table_rows":2000000}}"#) {
        panic!("failed to write config fixture: {err}");
    }

    let output = match Command::new(env!("CARGO_BIN_EXE_lu"))
        .arg("--db")
        .arg(&db_path)
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run config show: {err}"),
    };
    assert_success(&output, "config show");

    let payload = stdout_json(&output);
    assert_eq!(payload["config_version"], serde_json::json!(1));
    assert_eq!(payload["selector"]["huge_table_rows"], serde_json::json!(2_000_000));
    assert_eq!(payload["selector"]["low_duplication"], serde_json::json!(3.0));
    assert_eq!(payload["benchmark"]["join_timeout_ms"], serde_json::json!(10_000));

    let _ = fs::remove_file(&config_path);
}

#[test]
fn invalid_config_exits_non_zero_with_reason() {
    let db_path = temp_path("lu-contract-bad-config", "sqlite3");
    let config_path = temp_path("lu-contract-bad-config", "json");
    if let Err(err) = fs::write(&config_path, r#"{"config_version":2}"#) {
        panic!("failed to write config fixture: {err}");
    }

    let output = match Command::new(env!("CARGO_BIN_EXE_lu"))
        .arg("--db")
        .arg(&db_path)
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run config show: {err}"),
    };

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported config_version"), "stderr={stderr}");

    let _ = fs::remove_file(&config_path);
}
