//! CLI integration tests

use std::process::Command;

fn canvasctl(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "canvas-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = canvasctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("SD Multiplayer"), "Should show app name");
    assert!(stdout.contains("crd"), "Should show crd command");
    assert!(stdout.contains("list"), "Should show list command");
    assert!(stdout.contains("scale"), "Should show scale command");
    assert!(stdout.contains("restart"), "Should show restart command");
    assert!(stdout.contains("pods"), "Should show pods command");
    assert!(stdout.contains("logs"), "Should show logs command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = canvasctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("canvasctl"), "Should show binary name");
}

/// The CRD is rendered without a cluster
#[test]
fn test_crd_output() {
    let output = canvasctl(&["crd"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "crd should succeed offline");
    assert!(stdout.contains("kind: CustomResourceDefinition"));
    assert!(stdout.contains("sdmultiplayers.ai.example.com"));
}

/// Test scale command requires arguments
#[test]
fn test_scale_requires_arguments() {
    let output = canvasctl(&["scale"]);

    assert!(!output.status.success(), "scale without args should fail");
}

/// Test invalid output format is rejected
#[test]
fn test_invalid_format() {
    let output = canvasctl(&["--format", "invalid", "list"]);

    assert!(!output.status.success(), "Invalid format should fail");
}
