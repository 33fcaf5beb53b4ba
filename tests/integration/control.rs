#[path = "common/mod.rs"]
mod common;

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::Shutdown,
    os::unix::net::UnixStream,
};

use common::{TestServer, base_config, write_script};
use tempfile::tempdir;
use wpkgd::ipc::send_request;

#[test]
fn unknown_command_is_echoed_back() {
    let temp = tempdir().unwrap();
    let config = base_config("sh deploy.sh", temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Frobnicate").unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].code, 203);
    assert_eq!(frames[0].payload, "Unknown command: Frobnicate");

    server.stop();
}

#[test]
fn cancel_while_idle_reports_not_running() {
    let temp = tempdir().unwrap();
    let config = base_config("sh deploy.sh", temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Cancel").unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].code, 202);

    server.stop();
}

#[test]
fn set_network_user_acknowledges() {
    let temp = tempdir().unwrap();
    let config = base_config("sh deploy.sh", temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "SetNetworkUser alice s3cr3t").unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].code, 100);
    assert_eq!(frames[0].payload, "Network credentials updated");

    server.stop();
}

#[test]
fn concurrent_run_is_refused_with_busy() {
    let temp = tempdir().unwrap();
    let command = write_script(
        temp.path(),
        "slow.sh",
        "echo 'Working on it'\nexec sleep 5\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    // Client A starts a run and waits for the first frame, which is only
    // written after the single-flight gate has been taken.
    let mut client_a = UnixStream::connect(&server.socket).unwrap();
    client_a.write_all(b"Execute").unwrap();
    client_a.shutdown(Shutdown::Write).unwrap();
    let mut reader_a = BufReader::new(client_a);
    let mut first = String::new();
    reader_a.read_line(&mut first).unwrap();
    assert!(first.starts_with("100 "), "unexpected first frame: {first}");

    // Client B is refused with exactly one busy frame.
    let frames = send_request(&server.socket, "Query").unwrap();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].to_string().starts_with("201 "));

    // A second execute is refused the same way.
    let frames = send_request(&server.socket, "Execute").unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].code, 201);

    // Wait for the child's first output so the kill has a target.
    let mut line = String::new();
    while !line.contains("Working on it") {
        line.clear();
        reader_a.read_line(&mut line).unwrap();
    }

    // Cancel is always accepted and kills the child.
    let frames = send_request(&server.socket, "Cancel").unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].code, 105);

    // Client A's stream ends once the run winds down.
    let mut rest = String::new();
    reader_a.read_to_string(&mut rest).unwrap();

    server.stop();
}

#[test]
fn cancelled_run_frees_the_daemon_for_the_next_one() {
    let temp = tempdir().unwrap();
    let command = write_script(
        temp.path(),
        "slow.sh",
        "echo 'Working on it'\nexec sleep 5\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let mut client_a = UnixStream::connect(&server.socket).unwrap();
    client_a.write_all(b"Execute").unwrap();
    client_a.shutdown(Shutdown::Write).unwrap();
    let mut reader_a = BufReader::new(client_a);
    let mut line = String::new();
    while !line.contains("Working on it") {
        line.clear();
        reader_a.read_line(&mut line).unwrap();
    }

    let frames = send_request(&server.socket, "Cancel").unwrap();
    assert_eq!(frames[0].code, 105);
    let mut rest = String::new();
    reader_a.read_to_string(&mut rest).unwrap();

    // The gate is free again: a cancel now reports nothing running.
    let frames = send_request(&server.socket, "Cancel").unwrap();
    assert_eq!(frames[0].code, 202);

    server.stop();
}

#[test]
fn empty_request_just_closes_the_connection() {
    let temp = tempdir().unwrap();
    let config = base_config("sh deploy.sh", temp.path());
    let server = TestServer::start(config);

    let mut stream = UnixStream::connect(&server.socket).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut rest = String::new();
    stream.read_to_string(&mut rest).unwrap();
    assert!(rest.is_empty());

    server.stop();
}
