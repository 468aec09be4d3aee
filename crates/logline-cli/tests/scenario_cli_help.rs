//! Smoke tests for the CLI's argument surface — no database required.

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn top_level_help_lists_every_subcommand() {
    Command::cargo_bin("logline")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("db"))
        .stdout(contains("manifest"))
        .stdout(contains("boot"))
        .stdout(contains("records"));
}

#[test]
fn boot_requires_function_and_user() {
    Command::cargo_bin("logline")
        .unwrap()
        .args(["boot", "--user", "alice"])
        .assert()
        .failure();
}

#[test]
fn records_tail_requires_entity_type() {
    Command::cargo_bin("logline")
        .unwrap()
        .args(["records", "tail"])
        .assert()
        .failure();
}
