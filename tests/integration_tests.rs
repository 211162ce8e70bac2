//! Integration tests for the recyconnect binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a recyconnect Command isolated from the caller's env.
fn recyconnect(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("recyconnect");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("RECYCONNECT_CONFIG")
        .env_remove("RECYCONNECT_PORT")
        .env_remove("RECYCONNECT_DB_PATH")
        .env_remove("RECYCONNECT_SUPERUSER_EMAIL")
        .env_remove("RECYCONNECT_SUPERUSER_PASSWORD");
    cmd
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = temp_dir();
        recyconnect(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_version() {
        let dir = temp_dir();
        recyconnect(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("recyconnect"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = temp_dir();
        recyconnect(&dir).arg("frobnicate").assert().failure();
    }
}

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = temp_dir();
        let db_path = dir.path().join("data").join("market.db");
        recyconnect(&dir)
            .args(["init-db", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = temp_dir();
        for _ in 0..2 {
            recyconnect(&dir)
                .arg("init-db")
                .env("RECYCONNECT_SUPERUSER_EMAIL", "root@example.com")
                .env("RECYCONNECT_SUPERUSER_PASSWORD", "super-secret-1")
                .assert()
                .success();
        }
        assert!(dir.path().join(".recyconnect/recyconnect.db").exists());
    }

    #[test]
    fn test_init_db_uses_config_file_path() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("recyconnect.toml"),
            "[server]\ndb_path = \"custom/app.db\"\n",
        )
        .unwrap();
        recyconnect(&dir).arg("init-db").assert().success();
        assert!(dir.path().join("custom/app.db").exists());
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = temp_dir();
        recyconnect(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8000"))
            .stdout(predicate::str::contains("Superuser password: not set"));
    }

    #[test]
    fn test_config_env_override_and_password_hidden() {
        let dir = temp_dir();
        recyconnect(&dir)
            .args(["config", "show"])
            .env("RECYCONNECT_PORT", "9191")
            .env("RECYCONNECT_SUPERUSER_PASSWORD", "keep-me-secret")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9191"))
            .stdout(predicate::str::contains("keep-me-secret").not());
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = temp_dir();
        recyconnect(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join("recyconnect.toml").exists());

        recyconnect(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("recyconnect.toml"),
            "[accounts]\nsession_ttl_hours = 0\n",
        )
        .unwrap();
        recyconnect(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("session_ttl_hours"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = temp_dir();
        fs::write(dir.path().join("recyconnect.toml"), "[server\n").unwrap();
        recyconnect(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load configuration"));
    }

    #[test]
    fn test_malformed_env_file_fails() {
        let dir = temp_dir();
        fs::write(dir.path().join(".env"), "RECYCONNECT_PORT 9191\n").unwrap();
        recyconnect(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains(".env"));
    }
}
