#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{TestServer, base_config, write_script};
use tempfile::tempdir;
use wpkgd::{blacklist, ipc::send_request};

#[test]
fn execute_streams_progress_frames_in_order() {
    let temp = tempdir().unwrap();
    // The pauses keep the consumer ahead of the child, so both lines are
    // parsed before the post-exit drain kicks in.
    let command = write_script(
        temp.path(),
        "deployer.sh",
        "echo 'Installing package Foo'\nsleep 0.3\necho 'Installing package Bar'\nsleep 0.3\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Execute").unwrap();

    assert_eq!(
        frames[0].to_string(),
        "100 Initializing Wpkg-GP software installation"
    );
    let foo = frames
        .iter()
        .position(|f| f.payload.starts_with("Installing package Foo"))
        .expect("progress frame for Foo");
    let bar = frames
        .iter()
        .position(|f| f.payload.starts_with("Installing package Bar"))
        .expect("progress frame for Bar");
    assert!(foo < bar, "child output order must be preserved");
    assert!(frames.iter().all(|f| f.code == 100 || f.code == 101));

    server.stop();
}

#[test]
fn progress_frames_pad_over_a_previous_spinner() {
    let temp = tempdir().unwrap();
    let command =
        write_script(temp.path(), "deployer.sh", "echo 'Installing package Foo'\n");
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Execute").unwrap();
    let progress = frames
        .iter()
        .find(|f| f.payload.starts_with("Installing package Foo"))
        .unwrap();
    assert!(progress.payload.ends_with("      "));

    server.stop();
}

#[test]
fn quiet_child_triggers_heartbeat_frames() {
    let temp = tempdir().unwrap();
    let command = write_script(
        temp.path(),
        "deployer.sh",
        "echo 'Preparing'\nsleep 2\necho 'Done'\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Execute").unwrap();

    let heartbeat = frames
        .iter()
        .find(|f| f.code == 101)
        .expect("at least one heartbeat during two quiet seconds");
    assert!(heartbeat.payload.starts_with("Preparing"));
    assert!(heartbeat.payload.contains("..."));
    // Spinner frames keep the payload width stable.
    assert_eq!(heartbeat.payload.len(), "Preparing".len() + 7);

    server.stop();
}

#[test]
fn child_error_exit_is_reported_with_the_last_line() {
    let temp = tempdir().unwrap();
    let command = write_script(
        temp.path(),
        "deployer.sh",
        "echo 'Installing package Foo'\necho 'could not fetch manifest'\nsleep 0.3\nexit 1\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Execute").unwrap();

    let last = frames.last().unwrap();
    assert_eq!(
        last.to_string(),
        "200 Wpkg returned an error: could not fetch manifest"
    );

    server.stop();
}

#[test]
fn blacklisted_host_is_refused() {
    let temp = tempdir().unwrap();
    // A script-style command so the gate can derive the blacklist location.
    let script_dir = temp.path().join("share");
    fs::create_dir_all(&script_dir).unwrap();
    fs::write(
        script_dir.join("blacklist.txt"),
        "#comment\n!all!\nsomehost\n",
    )
    .unwrap();
    let command = format!("cscript {}/wpkg.js", script_dir.display());
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    // ExecuteNoReboot skips the boot-console pause after the denial.
    let frames = send_request(&server.socket, "ExecuteNoReboot").unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].code, 100);
    assert_eq!(frames[1].code, 205);
    assert_eq!(
        frames[1].payload,
        "Info: Client was blocked from server to execute wpkg."
    );

    server.stop();
}

#[test]
fn hostname_blacklist_blocks_only_listed_hosts() {
    let temp = tempdir().unwrap();
    let script_dir = temp.path().join("share");
    fs::create_dir_all(&script_dir).unwrap();
    fs::write(
        script_dir.join("blacklist.txt"),
        format!("{}\n", blacklist::local_hostname()),
    )
    .unwrap();
    let command = format!("cscript {}/wpkg.js", script_dir.display());
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "ExecuteNoReboot").unwrap();
    assert_eq!(frames.last().unwrap().code, 205);

    server.stop();
}

#[test]
fn boot_execution_can_be_disabled() {
    let temp = tempdir().unwrap();
    let command = write_script(temp.path(), "deployer.sh", "echo 'nope'\n");
    let mut config = base_config(&command, temp.path());
    config.disable_at_boot_up = 1;
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "ExecuteFromGPE").unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0].to_string(),
        "200 Execution at startup is disabled, will not run"
    );

    // A plain Execute still runs.
    let frames = send_request(&server.socket, "Execute").unwrap();
    assert!(frames.iter().any(|f| f.payload.starts_with("nope")));

    server.stop();
}

#[test]
fn running_marker_is_false_after_a_run() {
    let temp = tempdir().unwrap();
    let command = write_script(temp.path(), "deployer.sh", "echo 'one line'\n");
    let config = base_config(&command, temp.path());
    let marker = temp.path().join("running_state");
    let server = TestServer::start(config);

    send_request(&server.socket, "Execute").unwrap();

    assert_eq!(fs::read_to_string(marker).unwrap(), "false");

    server.stop();
}
