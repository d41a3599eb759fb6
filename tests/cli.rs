use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn studysync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("studysync").unwrap();
    cmd.env("STUDYSYNC_HOME", dir.path())
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn status_on_empty_queue() {
    let dir = TempDir::new().unwrap();

    studysync(&dir)
        .args(["sync", "status", "-o", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\": 0"))
        .stdout(predicate::str::contains("\"failed\": 0"));

    assert!(dir.path().join("queue.db").exists());
}

#[test]
fn list_on_empty_queue() {
    let dir = TempDir::new().unwrap();

    studysync(&dir)
        .args(["sync", "list", "--status", "failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No failed mutations in queue."));
}

#[test]
fn data_dir_flag_overrides_env() {
    let env_dir = TempDir::new().unwrap();
    let flag_dir = TempDir::new().unwrap();

    studysync(&env_dir)
        .arg("--data-dir")
        .arg(flag_dir.path())
        .args(["sync", "status"])
        .assert()
        .success();

    assert!(flag_dir.path().join("queue.db").exists());
    assert!(!env_dir.path().join("queue.db").exists());
}

#[test]
fn dismiss_missing_item_fails() {
    let dir = TempDir::new().unwrap();

    studysync(&dir)
        .args(["sync", "dismiss", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn retry_without_target_fails() {
    let dir = TempDir::new().unwrap();

    studysync(&dir)
        .args(["sync", "retry"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--all"));
}

#[test]
fn malformed_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "queue: [not, a, map]").unwrap();

    studysync(&dir)
        .args(["sync", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn completions_do_not_need_a_data_dir() {
    Command::cargo_bin("studysync")
        .unwrap()
        .env_remove("STUDYSYNC_HOME")
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("studysync"));
}
