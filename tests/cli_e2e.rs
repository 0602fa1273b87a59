// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end checks of the `pspawn` command line.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn run_mirrors_child_stdout_and_exit_code() {
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args(["run", "--", "/bin/echo", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}

#[test]
fn run_propagates_nonzero_exit_codes() {
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args(["run", "--", "/bin/sh", "-c", "exit 5"])
        .assert()
        .code(5);
}

#[test]
fn run_json_reports_pid_and_code() {
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args(["run", "--json", "--", "/bin/true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"code\":0").and(predicate::str::contains("\"pid\":")));
}

#[test]
fn run_applies_cwd_and_env_overrides() {
    let dir = tempfile::tempdir().expect("tempdir");
    let canonical = dir.path().canonicalize().expect("canonicalize");
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args([
            "run",
            "--cwd",
            dir.path().to_str().expect("utf8"),
            "--env",
            "PSPAWN_MARK=from-cli",
            "--",
            "/bin/sh",
            "-c",
            "pwd; echo $PSPAWN_MARK",
        ])
        .assert()
        .success()
        .stdout(
            predicate::str::contains(canonical.to_str().expect("utf8").to_string())
                .and(predicate::str::contains("from-cli")),
        );
}

#[test]
fn debug_flag_is_accepted_after_the_subcommand() {
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args(["run", "--debug", "--", "/bin/true"])
        .assert()
        .success();
}

#[test]
fn missing_program_fails_with_a_message() {
    Command::cargo_bin("pspawn")
        .expect("binary")
        .args(["run", "--", "/does/not/exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ENOENT"));
}
