//! Integration tests for the corkboard CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn corkboard() -> Command {
    Command::cargo_bin("corkboard").unwrap()
}

#[test]
fn help_lists_subcommands() {
    corkboard()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("init-db"));
}

#[test]
fn version_flag_works() {
    corkboard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("corkboard"));
}

#[test]
fn init_db_creates_database_file() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("board.db");

    corkboard()
        .arg("init-db")
        .arg("--db-path")
        .arg(&db_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized"));

    assert!(db_path.exists());
}

#[test]
fn init_db_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("board.db");

    for _ in 0..2 {
        corkboard()
            .arg("init-db")
            .arg("--db-path")
            .arg(&db_path)
            .assert()
            .success();
    }
    assert!(db_path.exists());
}

#[test]
fn unknown_subcommand_fails() {
    corkboard()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
