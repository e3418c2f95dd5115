//! CLI integration tests

use std::process::{Command, Output};

fn cmmdctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cmmdctl"))
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = cmmdctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("CMMD placement controller"),
        "Should show app name"
    );
    assert!(stdout.contains("requests"), "Should show requests command");
    assert!(stdout.contains("nodes"), "Should show nodes command");
    assert!(stdout.contains("explain"), "Should show explain command");
    assert!(
        stdout.contains("--agent-service"),
        "Should show agent service option"
    );
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = cmmdctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("cmmdctl"), "Should show binary name");
}

#[test]
fn test_requests_help() {
    let output = cmmdctl(&["requests", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Requests help should succeed");
    assert!(
        stdout.contains("--namespace"),
        "Should show namespace option"
    );
}

#[test]
fn test_nodes_help() {
    let output = cmmdctl(&["nodes", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Nodes help should succeed");
    assert!(stdout.contains("--selector"), "Should show selector option");
}

#[test]
fn test_explain_help() {
    let output = cmmdctl(&["explain", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Explain help should succeed");
    assert!(stdout.contains("<NAME>"), "Should show name argument");
    assert!(
        stdout.contains("--namespace"),
        "Should show namespace option"
    );
}

/// Explain needs a request name
#[test]
fn test_explain_requires_name() {
    let output = cmmdctl(&["explain"]);
    assert!(!output.status.success(), "Explain without name should fail");
}

/// Test invalid output format
#[test]
fn test_invalid_format() {
    let output = cmmdctl(&["--format", "yaml", "requests"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Invalid format should fail");
    assert!(stderr.contains("invalid value"), "Should report invalid value");
}
