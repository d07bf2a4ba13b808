//! CLI contract tests: run the binary against a throwaway home directory.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

struct Sandbox {
    home: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let config = home.path().join("config.toml");
        let db = home.path().join("data").join("whatsmux.db");
        fs::create_dir_all(db.parent().expect("has parent")).expect("mkdir");
        fs::write(
            &config,
            format!(
                "[server]\nbind = \"127.0.0.1:9911\"\n\n[database]\npath = {:?}\n",
                db.display().to_string()
            ),
        )
        .expect("write config");
        Self { home, config }
    }

    fn home(&self) -> &Path {
        self.home.path()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("whatsmux").expect("binary builds");
        cmd.env("HOME", self.home())
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config);
        cmd
    }
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf-8 output")
}

#[test]
fn check_config_prints_the_resolved_settings() {
    let sandbox = Sandbox::new();

    let out = stdout_of(sandbox.command().arg("check-config"));

    assert!(out.contains("127.0.0.1:9911"));
    assert!(out.contains("whatsmux.db"));
    assert!(out.contains("https://graph.facebook.com/v21.0"));
    assert!(out.contains("max attempts unlimited"));
}

#[test]
fn check_config_rejects_malformed_files() {
    let sandbox = Sandbox::new();
    fs::write(&sandbox.config, "[server\n").expect("write config");

    sandbox.command().arg("check-config").assert().failure();
}

#[test]
fn grant_credits_accumulates_in_the_database() {
    let sandbox = Sandbox::new();

    let first = stdout_of(
        sandbox
            .command()
            .args(["grant-credits", "--user", "alice", "--amount", "5"]),
    );
    assert!(first.contains("balance 5"));

    let second = stdout_of(
        sandbox
            .command()
            .args(["grant-credits", "--user", "alice", "--amount", "3"]),
    );
    assert!(second.contains("balance 8"));

    let reseller = stdout_of(sandbox.command().args([
        "grant-credits",
        "--user",
        "alice",
        "--kind",
        "reseller",
        "--amount",
        "2",
    ]));
    assert!(reseller.contains("balance 2"));
}

#[test]
fn grant_credits_rejects_bad_input() {
    let sandbox = Sandbox::new();

    sandbox
        .command()
        .args(["grant-credits", "--user", "alice", "--amount", "0"])
        .assert()
        .failure();
    sandbox
        .command()
        .args(["grant-credits", "--user", "alice", "--kind", "robot", "--amount", "1"])
        .assert()
        .failure();
}
