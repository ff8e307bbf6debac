//! Integration tests for the `scanwarden` CLI binary.
//!
//! Run the binary as a subprocess against `--storage memory`, so none of
//! these need a running PostgreSQL instance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

fn scanwarden_bin() -> String {
    let path = env!("CARGO_BIN_EXE_scanwarden");
    assert!(
        Path::new(path).exists(),
        "scanwarden binary not found at {path}"
    );
    path.to_owned()
}

/// Runs `scanwarden` with `args` and returns (`exit_code`, stdout, stderr).
fn run(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(scanwarden_bin())
        .args(args)
        .env_remove("DATABASE_URL")
        .output()
        .expect("failed to execute scanwarden");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0, "scanwarden --version should exit 0");
    assert!(
        stdout.contains("scanwarden"),
        "version output should contain 'scanwarden': {stdout}"
    );
}

#[test]
fn test_help_flag() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0, "scanwarden --help should exit 0");
    assert!(stdout.contains("run"), "help should list 'run' command");
    assert!(
        stdout.contains("status"),
        "help should list 'status' command"
    );
    assert!(
        stdout.contains("DATABASE_URL"),
        "help should document DATABASE_URL"
    );
}

#[test]
fn test_run_with_memory_storage_has_no_due_targets() {
    let (code, _stdout, _) = run(&["--storage", "memory", "run"]);
    assert_eq!(
        code, 0,
        "a freshly-provisioned in-memory store has no due targets, so the \
         dispatcher should report success (exit 0)"
    );
}

#[test]
fn test_status_with_memory_storage() {
    let (code, stdout, _) = run(&["--storage", "memory", "status", "--log-lines", "5"]);
    assert_eq!(code, 0, "status against an idle store should exit 0");
    assert!(
        stdout.contains("scheduler_execution lease"),
        "status should report the lease: {stdout}"
    );
    assert!(
        stdout.contains("resource governor"),
        "status should report governor state: {stdout}"
    );
    assert!(stdout.contains("not held"), "no lease has been taken yet: {stdout}");
}

#[test]
fn test_postgres_storage_without_database_url_fails() {
    let (code, _, stderr) = run(&["--storage", "postgres", "run"]);
    assert_ne!(
        code, 0,
        "--storage postgres with no DATABASE_URL should fail"
    );
    assert!(
        stderr.contains("DATABASE_URL") || stderr.contains("database-url"),
        "should explain the missing connection string: {stderr}"
    );
}

#[test]
fn test_unknown_subcommand_fails() {
    let (code, _, stderr) = run(&["bogus-command"]);
    assert_ne!(code, 0, "an unknown subcommand should fail");
    assert!(
        stderr.contains("error") || stderr.contains("Error"),
        "clap should report a usage error: {stderr}"
    );
}
