// CLI integration tests: JSON output, exit codes, config loading and signal shutdown.
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_keyplane");
    let mut command = Command::new(exe);
    command.env_remove("KEYPLANE_CONFIG").env_remove("RUST_LOG");
    command
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    parse_json(line)
}

#[test]
fn put_with_defaults_reports_declared_id() {
    let output = cmd().arg("put").output().expect("put");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["cmd"], "put");
    assert_eq!(value["key_expr"], "/demo/example/keyplane-put");
    assert_eq!(value["value"], "Put from Rust!");
    assert_eq!(value["expr_id"], 1);
    assert_eq!(value["matching"], false);
    assert!(value["time"].as_str().is_some_and(|time| time.contains('T')));
}

#[test]
fn put_with_attachment_and_explicit_peer() {
    let output = cmd()
        .args([
            "put",
            "/demo/example",
            "hello",
            "mem/cli-put",
            "--attach",
            "k=v",
        ])
        .output()
        .expect("put");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["key_expr"], "/demo/example");
    assert_eq!(value["value"], "hello");
}

#[test]
fn invalid_key_expression_exits_with_json_error() {
    let output = cmd()
        .args(["put", "demo//example", "x"])
        .output()
        .expect("put");
    assert_eq!(output.status.code(), Some(3));
    assert!(output.stdout.is_empty());
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "InvalidExpression");
    assert!(err["error"]["message"].as_str().is_some());
}

#[test]
fn unsupported_peer_is_a_connection_error() {
    let output = cmd()
        .args(["put", "/demo/example", "x", "tcp/127.0.0.1:7447"])
        .output()
        .expect("put");
    assert_eq!(output.status.code(), Some(6));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Connection");
    assert!(err["error"]["hint"].as_str().is_some());
}

#[test]
fn bad_attachment_flag_is_usage_error() {
    let output = cmd()
        .args(["put", "/demo/example", "x", "--attach", "novalue"])
        .output()
        .expect("put");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn get_without_queryables_prints_nothing_and_succeeds() {
    let output = cmd()
        .args(["get", "/demo/example/**?x=1", "mem/cli-get", "--timeout-ms", "200"])
        .output()
        .expect("get");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn config_file_from_env_selects_peer() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, r#"{{"peer":"tcp/10.0.0.1:7447"}}"#).expect("write config");
    let output = cmd()
        .env("KEYPLANE_CONFIG", file.path())
        .args(["put", "/demo/example", "x"])
        .output()
        .expect("put");
    assert_eq!(output.status.code(), Some(6));

    let output = cmd()
        .env("KEYPLANE_CONFIG", file.path())
        .args(["put", "/demo/example", "x", "mem/cli-config"])
        .output()
        .expect("put");
    assert!(output.status.success(), "positional peer overrides config");
}

#[test]
fn malformed_config_file_is_usage_error() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, r#"{{"workers":0}}"#).expect("write config");
    let output = cmd()
        .arg("--config")
        .arg(file.path())
        .arg("put")
        .output()
        .expect("put");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn pub_stops_after_count() {
    let output = cmd()
        .args([
            "pub",
            "/demo/example/ticker",
            "tick",
            "mem/cli-pub-count",
            "--interval-ms",
            "10",
            "--count",
            "3",
        ])
        .output()
        .expect("pub");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<Value> = text.lines().map(parse_json).collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["payload"], "[   0] tick");
    assert_eq!(lines[2]["payload"], "[   2] tick");
    assert_eq!(lines[2]["seq"], 2);
}

#[cfg(unix)]
#[test]
fn pub_exits_cleanly_on_sigterm() {
    let mut child = cmd()
        .args([
            "pub",
            "/demo/example/keyplane-pub",
            "Pub from Rust!",
            "mem/cli-pub-signal",
            "--interval-ms",
            "50",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn pub");
    let stdout = child.stdout.take().expect("stdout");
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    reader.read_line(&mut line).expect("first line");
    let first = parse_json(line.trim());
    assert_eq!(first["cmd"], "pub");
    assert_eq!(first["payload"], "[   0] Pub from Rust!");

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("kill");
    assert!(status.success());
    let status = child.wait().expect("wait");
    assert_eq!(status.code(), Some(0));
}
