use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_describes_the_daemon() {
    Command::cargo_bin("wpkgd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Control daemon"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("set-network-user"));
}

#[test]
fn client_commands_fail_without_a_daemon() {
    let temp = tempdir().unwrap();
    Command::cargo_bin("wpkgd")
        .unwrap()
        .env("HOME", temp.path())
        .arg("query")
        .assert()
        .failure()
        .stderr(predicate::str::contains("control socket not available"));
}

#[test]
fn serve_requires_a_config_file() {
    let temp = tempdir().unwrap();
    Command::cargo_bin("wpkgd")
        .unwrap()
        .env("HOME", temp.path())
        .arg("serve")
        .assert()
        .failure();
}

#[test]
fn sys_mode_requires_root() {
    if nix::unistd::Uid::effective().is_root() {
        return;
    }
    let temp = tempdir().unwrap();
    Command::cargo_bin("wpkgd")
        .unwrap()
        .env("HOME", temp.path())
        .args(["--sys", "cancel"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--sys requires root privileges"));
}
