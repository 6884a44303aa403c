//! End-to-end tests for the `gpgraph` binary.

use std::io::Write;
use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::NamedTempFile;

fn write_script(script: &Value) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(script.to_string().as_bytes())
        .expect("failed to write script");
    file
}

fn gpgraph(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gpgraph"))
        .args(args)
        .env("GPGRAPH_MEMORY_CAPACITY", "1048576")
        .output()
        .expect("failed to run gpgraph")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn pipeline() -> Value {
    json!({
        "buffers": [
            { "name": "a", "size": 8, "fill": 1 },
            { "name": "b", "size": 8 }
        ],
        "nodes": [
            { "name": "inc", "op": { "kind": "kernel", "function": "increment", "buffer": "a" } },
            { "name": "dbl", "after": ["inc"], "op": { "kind": "kernel", "function": "double", "buffer": "a" } },
            { "name": "copy", "after": ["dbl"], "op": { "kind": "memcpy", "src": "a", "dst": "b" } }
        ]
    })
}

#[test]
fn run_prints_summary() {
    let script = write_script(&pipeline());
    let output = gpgraph(&["run", script.path().to_str().unwrap(), "--replays", "2"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let summary = stdout_json(&output);
    assert_eq!(summary["nodes"], 3);
    assert_eq!(summary["edges"], 2);
    assert_eq!(summary["replays"], 2);
    assert_eq!(summary["kernel_launches"], 4);
    // ((1 + 1) * 2 + 1) * 2 = 10
    assert_eq!(summary["buffers"]["a"], json!(vec![10; 8]));
    assert_eq!(summary["buffers"]["b"], json!(vec![10; 8]));
}

#[test]
fn validate_accepts_a_well_formed_graph() {
    let script = write_script(&pipeline());
    let output = gpgraph(&["validate", script.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0));
    let report = stdout_json(&output);
    assert_eq!(report["valid"], true);
    assert_eq!(report["nodes"], 3);
}

#[test]
fn validate_reports_free_without_alloc() {
    let script = write_script(&json!({
        "buffers": [{ "name": "a", "size": 8 }],
        "nodes": [
            { "name": "rel", "op": { "kind": "free", "alloc": "a" } }
        ]
    }));
    let output = gpgraph(&["validate", script.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));

    let report = stdout_json(&output);
    assert_eq!(report["valid"], false);
    let diagnostics = report["diagnostics"].as_array().unwrap();
    assert!(!diagnostics.is_empty());
    assert!(report["error"].as_str().unwrap().contains("free"));
}

#[test]
fn unfreed_allocation_needs_auto_free_to_relaunch() {
    let script = write_script(&json!({
        "nodes": [
            { "name": "tmp", "op": { "kind": "alloc", "size": 64 } },
            { "name": "zero", "after": ["tmp"], "op": { "kind": "memset", "dst": "tmp", "value": 0 } }
        ]
    }));
    let path = script.path().to_str().unwrap();

    let output = gpgraph(&["run", path, "--replays", "2"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("never freed"));

    let output = gpgraph(&["run", path, "--replays", "2", "--auto-free"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["replays"], 2);
}

#[test]
fn dot_renders_edges() {
    let script = write_script(&pipeline());
    let output = gpgraph(&["dot", script.path().to_str().unwrap()]);
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.starts_with("digraph gpgraph {"));
    assert!(text.contains("n0 -> n1;"));
    assert!(text.contains("n1 -> n2;"));
}

#[test]
fn malformed_script_exits_with_script_error() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"{ not json").unwrap();
    let output = gpgraph(&["run", file.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(3));

    let output = gpgraph(&["dot", "/nonexistent/script.json"]);
    assert_eq!(output.status.code(), Some(3));
}
