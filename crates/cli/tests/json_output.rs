//! `--json` output must stay machine-readable while logging is on.

use std::process::Command;

use serde_json::Value;

fn overseer(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_overseer"))
        .args(["--memory", "--worker-command", "true"])
        .args(args)
        .env("RUST_LOG", "debug")
        .output()
        .expect("failed to run overseer")
}

#[test]
fn test_tick_json_is_clean_stdout() {
    let output = overseer(&["tick", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    // Host CPU load decides between an empty-queue and a pressure refusal.
    let action = report["action"].as_str().unwrap();
    assert!(["no_dispatchable_task", "resource_exhausted"].contains(&action));
    assert!(String::from_utf8_lossy(&output.stderr).contains(action));
}

#[test]
fn test_status_json_is_clean_stdout() {
    let output = overseer(&["status", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let status: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(status.get("window").is_some());
    assert!(status.get("max_seats").is_some());
}
