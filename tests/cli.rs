//! Binary tests for the offline commands

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CAPTURE: &str = concat!(
    r#"{"content":{"parts":[{"thought":true,"text":"pondering"}]},"author":"astra"}"#,
    "\n",
    r#"{"content":{"parts":[{"text":"Bonjour, "}]},"author":"astra"}"#,
    "\n",
    r#"{"content":{"parts":[{"text":"ça va?"}]},"author":"astra"}"#,
    "\n",
    r#"{"content":{"parts":[{"text":"Bonjour, ça va?"}]},"author":"astra"}"#,
    "\n",
);

fn relay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("agent-relay").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("RELAY_UPSTREAM_URL")
        .env_remove("RELAY_DEADLINE_MS");
    cmd
}

#[test]
fn replay_prints_one_frame_per_unit() {
    let dir = TempDir::new().unwrap();
    let capture = dir.path().join("capture.ndjson");
    fs::write(&capture, CAPTURE).unwrap();

    let assert = relay(&dir)
        .args(["replay", "capture.ndjson", "--chunk-size", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""text":"pondering""#))
        .stdout(predicate::str::contains(r#""text":"ça va?""#))
        .stdout(predicate::str::ends_with("data: [DONE]\n\n"));

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout.matches("data: ").count(), 4);
    assert!(!stdout.contains("Bonjour, ça va?"));
}

#[test]
fn replay_reads_stdin_and_prints_final_text() {
    let dir = TempDir::new().unwrap();

    relay(&dir)
        .args(["replay", "--final-text"])
        .write_stdin(CAPTURE)
        .assert()
        .success()
        .stdout(predicate::str::ends_with("data: [DONE]\n\nBonjour, ça va?\n"));
}

#[test]
fn config_prints_effective_settings() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(".agent-relay.json"),
        r#"{"stream": {"default_author": "planner"}}"#,
    )
    .unwrap();

    relay(&dir)
        .arg("config")
        .env("RELAY_DEADLINE_MS", "1234")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""default_author": "planner""#))
        .stdout(predicate::str::contains(r#""deadline_ms": 1234"#));
}

#[test]
fn version_command() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("agent-relay version"));
}
