#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn workspace() -> Result<TempDir, Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let version = temp.path().join("configurations").join("receipts-v1");
    std::fs::create_dir_all(&version)?;
    std::fs::write(
        version.join("manifest.json"),
        serde_json::to_vec(&json!({"entrypoint": ["sh", "-c", "echo hi"]}))?,
    )?;
    Ok(temp)
}

fn runengine(root: &Path) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("runengine")?;
    cmd.current_dir(root)
        .env("RUST_LOG", "off")
        .env(
            "RUNENGINE_DATABASE_URL",
            format!("sqlite://{}", root.join("runs.db").display()),
        )
        .env("RUNENGINE_CONFIGURATIONS_ROOT", root.join("configurations"))
        .env("RUNENGINE_ENVIRONMENTS_ROOT", root.join("environments"))
        .env("RUNENGINE_HEARTBEAT_INTERVAL_MS", "100")
        .args(["--config", "missing.toml"]);
    Ok(cmd)
}

fn stdout_json(output: &std::process::Output) -> Result<Value, Box<dyn std::error::Error>> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn malformed_run_id_is_invalid_input() -> TestResult {
    let temp = workspace()?;
    runengine(temp.path())?
        .args(["status", "not-a-uuid"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains(r#""code":"INVALID""#));
    Ok(())
}

#[test]
fn unknown_run_and_version_are_not_found() -> TestResult {
    let temp = workspace()?;
    runengine(temp.path())?
        .args(["status", "6f1c9a3e-8d7b-4c2a-9e0f-123456789abc"])
        .assert()
        .code(5)
        .stdout(predicate::str::contains(r#""status":"error""#));
    runengine(temp.path())?
        .args(["submit", "receipts-v9"])
        .assert()
        .code(5)
        .stdout(predicate::str::contains("NOTFOUND"));
    Ok(())
}

#[test]
fn input_must_be_json() -> TestResult {
    let temp = workspace()?;
    runengine(temp.path())?
        .args(["submit", "receipts-v1", "--input", "{oops"])
        .assert()
        .code(8);
    Ok(())
}

#[test]
fn submitted_validate_only_run_completes_under_work_until_idle() -> TestResult {
    let temp = workspace()?;
    let submitted = runengine(temp.path())?
        .args(["submit", "receipts-v1", "--validate-only", "--input", r#"{"doc":"r.pdf"}"#])
        .output()?;
    assert!(submitted.status.success());
    let submitted = stdout_json(&submitted)?;
    assert_eq!(submitted["command"], "submit");
    assert_eq!(submitted["status"], "ok");
    assert_eq!(submitted["payload"]["state"], "queued");
    let run_id = submitted["payload"]["run_id"]
        .as_str()
        .ok_or("missing run_id")?
        .to_string();

    runengine(temp.path())?
        .args(["work", "--until-idle"])
        .assert()
        .success();

    let status = stdout_json(&runengine(temp.path())?.args(["status", &run_id]).output()?)?;
    assert_eq!(status["payload"]["state"], "succeeded");
    assert_eq!(status["payload"]["attempt"], 1);

    let events = stdout_json(&runengine(temp.path())?.args(["events", &run_id]).output()?)?;
    let kinds = events["payload"]["events"]
        .as_array()
        .ok_or("missing events")?
        .iter()
        .filter_map(|event| event["event_type"].as_str())
        .collect::<Vec<_>>();
    assert_eq!(kinds.first(), Some(&"enqueue"));
    assert_eq!(kinds.last(), Some(&"exit"));

    runengine(temp.path())?
        .args(["events", &run_id, "--follow"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""event_type":"exit""#));

    runengine(temp.path())?
        .args(["cancel", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("already_terminal"));
    Ok(())
}
