#[path = "common/mod.rs"]
mod common;

use common::{TestServer, base_config, write_script};
use tempfile::tempdir;
use wpkgd::ipc::send_request;

fn query_script_body(entries: &str) -> String {
    format!(
        "echo 'WPKG 1.3.1'\n\
         echo 'Query of the local package database'\n\
         echo ''\n\
         echo 'Pending actions:'\n\
         {entries}"
    )
}

#[test]
fn query_reports_pending_tasks_as_triples() {
    let temp = tempdir().unwrap();
    let body = query_script_body(
        "echo '  Foo'\n\
         echo '  Revision: 1.0'\n\
         echo '  Action: Installation pending'\n\
         echo '  Bar'\n\
         echo '  Revision (new): 2.1'\n\
         echo '  Action: Upgrade pending'\n",
    );
    let command = write_script(temp.path(), "deployer.sh", &body);
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Query").unwrap();

    assert_eq!(
        frames[0].to_string(),
        "100 Initializing Wpkg-GP software query"
    );
    let tasks: Vec<String> = frames
        .iter()
        .filter(|f| f.code == 103)
        .map(|f| f.payload.clone())
        .collect();
    assert_eq!(
        tasks,
        vec![
            "TASK: install\tNAME: Foo\tREVISION: 1.0",
            "TASK: update\tNAME: Bar\tREVISION: 2.1",
        ]
    );

    server.stop();
}

#[test]
fn query_with_no_tasks_reports_104() {
    let temp = tempdir().unwrap();
    let command =
        write_script(temp.path(), "deployer.sh", &query_script_body(""));
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Query").unwrap();

    let last = frames.last().unwrap();
    assert_eq!(last.to_string(), "104 No pending wpkg tasks");

    server.stop();
}

#[test]
fn query_filters_metadata_lines() {
    let temp = tempdir().unwrap();
    let body = query_script_body(
        "echo '  Baz'\n\
         echo '  ID: baz-2'\n\
         echo '  Revision (old): 0.9'\n\
         echo '  Revision: 1.1'\n\
         echo '  Status: Not installed'\n\
         echo '  Action: Remove pending'\n",
    );
    let command = write_script(temp.path(), "deployer.sh", &body);
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Query").unwrap();

    let tasks: Vec<&str> = frames
        .iter()
        .filter(|f| f.code == 103)
        .map(|f| f.payload.as_str())
        .collect();
    assert_eq!(tasks, vec!["TASK: remove\tNAME: Baz\tREVISION: 1.1"]);

    server.stop();
}

#[test]
fn query_child_error_is_reported() {
    let temp = tempdir().unwrap();
    let command = write_script(
        temp.path(),
        "deployer.sh",
        "echo 'database is locked'\nexit 1\n",
    );
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Query").unwrap();

    let last = frames.last().unwrap();
    assert_eq!(last.to_string(), "200 Wpkg returned an error: database is locked");

    server.stop();
}

#[test]
fn query_passes_dry_run_arguments_to_the_deployer() {
    let temp = tempdir().unwrap();
    let args_file = temp.path().join("args.txt");
    let body = format!("printf '%s' \"$*\" > {}\n", args_file.display());
    let command = write_script(temp.path(), "deployer.sh", &body);
    let config = base_config(&command, temp.path());
    let server = TestServer::start(config);

    let frames = send_request(&server.socket, "Query").unwrap();
    assert_eq!(frames.last().unwrap().code, 104);

    let recorded = std::fs::read_to_string(args_file).unwrap();
    assert_eq!(recorded, "/query:Iudr /dryrun");

    server.stop();
}
