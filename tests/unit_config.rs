/// Tests for CLI argument parsing and launch validation. None of these
/// reach a namespace or a cgroup, so they run unprivileged.

use std::process::{Command, Output};

fn craterun(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_craterun"))
        .args(args)
        .output()
        .expect("failed to execute craterun")
}

/// Verify the binary can print help without error.
#[test]
fn cli_help_works() {
    let output = craterun(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0));
    assert!(
        stdout.contains("craterun") || stdout.contains("CrateRun"),
        "help output should mention craterun"
    );
}

#[test]
fn run_help_lists_resource_flags() {
    let output = craterun(&["run", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--rootfs", "--memory", "--cpu", "--pids", "--io-weight", "--userns"] {
        assert!(stdout.contains(flag), "run --help should list {flag}");
    }
}

/// Verify `run` requires --rootfs and a command.
#[test]
fn cli_run_requires_rootfs() {
    let output = craterun(&["run", "--", "/bin/sh"]);
    assert_eq!(output.status.code(), Some(1), "run without --rootfs should fail");
}

/// Verify `run` requires at least one command argument.
#[test]
fn cli_run_requires_cmd() {
    let output = craterun(&["run", "--rootfs", "/nonexistent"]);
    assert_eq!(output.status.code(), Some(1), "run without command should fail");
}

#[test]
fn out_of_range_limits_are_usage_errors() {
    for (flag, value) in [
        ("--cpu", "0"),
        ("--cpu", "150"),
        ("--pids", "5"),
        ("--io-weight", "2000"),
        ("--memory", "99999999999"),
    ] {
        let output = craterun(&["run", "--rootfs", "/nonexistent", flag, value, "--", "/bin/true"]);
        assert_eq!(output.status.code(), Some(1), "{flag} {value} should be rejected");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains(flag), "error should name {flag}, got: {stderr}");
    }
}

#[test]
fn missing_rootfs_is_reported() {
    let output = craterun(&["run", "--rootfs", "/nonexistent/rootfs", "--", "/bin/true"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("does not exist"),
        "should report missing rootfs, got: {stderr}"
    );
}

#[test]
fn directory_that_is_not_a_rootfs_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let output = craterun(&[
        "run",
        "--rootfs",
        tmp.path().to_str().unwrap(),
        "--",
        "/bin/true",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("does not look like a filesystem root"),
        "got: {stderr}"
    );
}

/// `/` is refused before anything privileged happens, so this needs no root.
#[test]
fn host_root_is_refused() {
    let output = craterun(&["run", "--rootfs", "/", "--", "/bin/true"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("refusing"),
        "error message should warn about using / as rootfs, got: {stderr}"
    );
}
