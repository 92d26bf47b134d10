use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn marksync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("marksync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

fn run_ok(home: &Path, args: &[&str]) -> String {
    let output = marksync_cmd(home).args(args).output().expect("run marksync");
    assert!(
        output.status.success(),
        "marksync {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

#[test]
fn init_writes_config_and_database() {
    let home = TempDir::new().expect("home");
    marksync_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("config.yaml"));

    let root = home.path().join(".marksync");
    assert!(root.join("config.yaml").exists());
    assert!(root.join("marksync.db").exists());

    // Idempotent.
    marksync_cmd(home.path()).arg("init").assert().success();
}

#[test]
fn project_lifecycle() {
    let home = TempDir::new().expect("home");
    run_ok(home.path(), &["project", "create", "bootrom"]);
    run_ok(home.path(), &["project", "create", "kernel"]);

    marksync_cmd(home.path())
        .args(["project", "create", "bootrom"])
        .assert()
        .failure()
        .stderr(contains("already exists"));

    let listed = run_ok(home.path(), &["project", "list", "--json"]);
    let json: serde_json::Value = serde_json::from_str(&listed).expect("json");
    let names: Vec<&str> = json
        .as_array()
        .expect("array")
        .iter()
        .map(|p| p["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, ["bootrom", "kernel"]);
    assert_eq!(json[0]["live_records"], 0);
    assert_eq!(json[0]["next_change_id"], 1);

    run_ok(home.path(), &["project", "drop", "bootrom"]);
    marksync_cmd(home.path())
        .args(["project", "drop", "bootrom"])
        .assert()
        .failure()
        .stderr(contains("not found"));

    marksync_cmd(home.path())
        .args(["project", "list"])
        .assert()
        .success()
        .stdout(contains("kernel").and(contains("bootrom").not()));
}

#[test]
fn invalid_names_are_rejected() {
    let home = TempDir::new().expect("home");
    marksync_cmd(home.path())
        .args(["project", "create", "has:::delimiter"])
        .assert()
        .failure()
        .stderr(contains("invalid project name"));
    marksync_cmd(home.path())
        .args(["user", "add", "white space", "--password", "pw"])
        .assert()
        .failure()
        .stderr(contains("invalid user name"));
}

#[test]
fn user_add_list_remove() {
    let home = TempDir::new().expect("home");
    run_ok(
        home.path(),
        &["user", "add", "alice", "--password", "pw", "--real-name", "Alice Liddell"],
    );
    run_ok(home.path(), &["user", "add", "bob", "--password", "pw"]);

    marksync_cmd(home.path())
        .args(["user", "list"])
        .assert()
        .success()
        .stdout(contains("alice").and(contains("Alice Liddell")).and(contains("bob")));

    run_ok(home.path(), &["user", "remove", "bob"]);
    marksync_cmd(home.path())
        .args(["user", "remove", "bob"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn dump_of_empty_and_unknown_projects() {
    let home = TempDir::new().expect("home");
    run_ok(home.path(), &["project", "create", "bootrom"]);

    let dumped = run_ok(home.path(), &["dump", "bootrom"]);
    assert!(dumped.is_empty(), "unexpected output: {dumped}");

    marksync_cmd(home.path())
        .args(["dump", "firmware"])
        .assert()
        .failure()
        .stderr(contains("project 'firmware' not found"));
}

#[test]
fn server_status_and_stop_when_not_running() {
    let home = TempDir::new().expect("home");
    let status = run_ok(home.path(), &["server", "status"]);
    let json: serde_json::Value = serde_json::from_str(&status).expect("json");
    assert_eq!(json["running"], false);
    assert!(json["socket"]
        .as_str()
        .expect("socket path")
        .ends_with("control.sock"));

    marksync_cmd(home.path())
        .args(["server", "stop"])
        .assert()
        .success()
        .stdout(contains("not running"));
}

#[test]
fn malformed_config_is_reported_with_its_path() {
    let home = TempDir::new().expect("home");
    let root = home.path().join(".marksync");
    std::fs::create_dir_all(&root).expect("root");
    std::fs::write(root.join("config.yaml"), "server: [not, a, map]\n").expect("write");

    marksync_cmd(home.path())
        .args(["project", "list"])
        .assert()
        .failure()
        .stderr(contains("config.yaml"));
}
