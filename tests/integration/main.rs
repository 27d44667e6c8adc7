//! Integration tests for casmesh

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn casmesh() -> Command {
        let mut cmd = cargo_bin_cmd!("casmesh");
        cmd.env_remove("CASMESH_CONFIG");
        cmd
    }

    /// Config file pointing the data root into `temp`
    fn write_config(temp: &TempDir) -> PathBuf {
        let data_root = temp.path().join("data");
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            format!("[general]\ndata_root = \"{}\"\n", data_root.display()),
        )
        .unwrap();
        path
    }

    fn data_root(temp: &TempDir) -> PathBuf {
        temp.path().join("data")
    }

    fn with_config(config: &Path) -> Command {
        let mut cmd = casmesh();
        cmd.arg("-c").arg(config);
        cmd
    }

    #[test]
    fn help_displays() {
        casmesh()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressable cache mesh node"));
    }

    #[test]
    fn version_displays() {
        casmesh()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("casmesh"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("custom.toml");
        with_config(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let temp = TempDir::new().unwrap();
        with_config(&temp.path().join("missing.toml"))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[checkpoint]"))
            .stdout(predicate::str::contains("max_attempts = 12"));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("nested").join("config.toml");
        with_config(&config)
            .args(["config", "init"])
            .assert()
            .success();
        let written = std::fs::read_to_string(&config).unwrap();
        assert!(written.contains("[monitor]"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.toml");
        std::fs::write(&config, "[checkpoint]\nretained_checkpoints = 0\n").unwrap();
        with_config(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn monitor_reports_missing_restores() {
        use casmesh::coordination::{ActivityRecord, Operation, OperationResult};
        use casmesh::location::MachineLocation;
        use chrono::{Duration, Utc};

        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        let activity = data_root(&temp).join("activity");
        std::fs::create_dir_all(&activity).unwrap();

        let worker = MachineLocation::new("/mesh/machines/worker-7");
        let row = ActivityRecord::at(
            &worker,
            "default",
            Operation::Heartbeat,
            OperationResult::Success,
            Utc::now() - Duration::minutes(10),
            None,
        );
        let segment = format!("{}.jsonl", row.precise_time_stamp.format("%Y-%m-%d"));
        std::fs::write(
            activity.join(segment),
            format!("{}\n", serde_json::to_string(&row).unwrap()),
        )
        .unwrap();

        with_config(&config)
            .args(["monitor", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"Missing\""))
            .stdout(predicate::str::contains("worker-7"));
    }

    #[test]
    fn monitor_without_activity() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        with_config(&config)
            .arg("monitor")
            .assert()
            .success()
            .stdout(predicate::str::contains("No activity in window"));
    }

    #[test]
    fn checkpoint_show_none_published() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        with_config(&config)
            .args(["checkpoint", "show", "--stamp", "east"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpoint published for stamp east"));

        with_config(&config)
            .args(["checkpoint", "show", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("null"));
    }

    #[test]
    fn teardown_writes_request() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        with_config(&config)
            .args(["teardown", "node-1"])
            .assert()
            .success();
        assert!(data_root(&temp).join("teardown").join("node-1").exists());
    }

    #[test]
    fn teardown_rejects_path_like_ids() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        with_config(&config)
            .args(["teardown", "../escape"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid service id"));
    }

    #[test]
    fn serve_exits_on_pending_teardown() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        let requests = data_root(&temp).join("teardown");
        std::fs::create_dir_all(&requests).unwrap();
        std::fs::write(requests.join("node-1"), "now").unwrap();

        with_config(&config)
            .args(["serve", "--service-id", "node-1", "--machine"])
            .arg(data_root(&temp).join("machines").join("a"))
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .success()
            .stdout(predicate::str::contains("Node stopped"));

        assert!(!requests.join("node-1").exists());
        let segments = std::fs::read_dir(data_root(&temp).join("activity")).unwrap();
        assert!(segments.count() > 0);
    }

    #[test]
    fn serve_rejects_path_like_stamp() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        with_config(&config)
            .args(["serve", "--stamp", "../other", "--machine"])
            .arg(data_root(&temp).join("machines").join("a"))
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid stamp"));
        assert!(!data_root(&temp).join("activity").exists());
    }
}
