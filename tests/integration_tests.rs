//! Integration tests for the dealflow CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use dealflow::crm::models::NewAppointment;
use dealflow::db::Database;

/// Helper to create a dealflow Command with no environment overrides
fn dealflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("dealflow");
    cmd.current_dir(dir.path())
        .env_remove("DEALFLOW_PORT")
        .env_remove("DEALFLOW_DB_PATH")
        .env_remove("DEALFLOW_CALENDAR_TOKEN")
        .env_remove("DEALFLOW_COPILOT_ENDPOINT");
    cmd
}

fn init_project(dir: &TempDir) {
    dealflow(dir).arg("init").assert().success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("stages"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir).arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"))
            .stdout(predicate::str::contains("Database ready"));

        assert!(dir.path().join(".dealflow/dealflow.toml").exists());
        assert!(dir.path().join(".dealflow/dealflow.db").exists());
    }

    #[test]
    fn test_init_keeps_existing_config_without_tty() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let path = dir.path().join(".dealflow/dealflow.toml");
        fs::write(&path, "[server]\nport = 4321\n").unwrap();

        // No terminal to confirm on, so the prompt declines
        dealflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Kept existing"));
        assert!(fs::read_to_string(&path).unwrap().contains("4321"));

        dealflow(&dir).args(["init", "--force"]).assert().success();
        assert!(!fs::read_to_string(&path).unwrap().contains("4321"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No dealflow.toml found"))
            .stdout(predicate::str::contains("port = 3150"));
    }

    #[test]
    fn test_config_show_masks_secrets() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".dealflow")).unwrap();
        fs::write(
            dir.path().join(".dealflow/dealflow.toml"),
            "[calendar]\ntoken = \"super-secret\"\n",
        )
        .unwrap();

        dealflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("super-secret").not())
            .stdout(predicate::str::contains("********"));
    }

    #[test]
    fn test_config_show_applies_env_override() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .env("DEALFLOW_PORT", "8181")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8181"));
    }

    #[test]
    fn test_env_file_read_from_project_dir() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join(".env"), "DEALFLOW_PORT=8282\n").unwrap();
        let elsewhere = TempDir::new().unwrap();
        fs::write(elsewhere.path().join(".env"), "DEALFLOW_PORT=9393\n").unwrap();

        dealflow(&elsewhere)
            .arg("--project-dir")
            .arg(project.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8282"))
            .stdout(predicate::str::contains("9393").not());
    }

    #[test]
    fn test_config_validate_warns_about_missing_services() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("calendar.token"))
            .stdout(predicate::str::contains("copilot.endpoint"));
    }

    #[test]
    fn test_config_validate_clean_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".dealflow")).unwrap();
        fs::write(
            dir.path().join(".dealflow/dealflow.toml"),
            "[calendar]\ntoken = \"t\"\n\n[copilot]\nendpoint = \"http://localhost:9000\"\n",
        )
        .unwrap();
        dealflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_invalid_toml_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".dealflow")).unwrap();
        fs::write(dir.path().join(".dealflow/dealflow.toml"), "[server\nport = ").unwrap();
        dealflow(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("dealflow.toml"));
    }

    #[test]
    fn test_config_init_writes_file() {
        let dir = TempDir::new().unwrap();
        dealflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[copilot] endpoint"));
        let content = fs::read_to_string(dir.path().join(".dealflow/dealflow.toml")).unwrap();
        assert!(content.contains("[server]"));
    }
}

// =============================================================================
// Stages and stats
// =============================================================================

mod pipeline_commands {
    use super::*;

    #[test]
    fn test_stages_seed_is_idempotent() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        for _ in 0..2 {
            dealflow(&dir)
                .args(["stages", "seed", "--team", "7"])
                .assert()
                .success()
                .stdout(predicate::str::contains("Team 7 has 9 stages."));
        }
        dealflow(&dir)
            .args(["stages", "list", "--team", "7"])
            .assert()
            .success()
            .stdout(predicate::str::contains("won"))
            .stdout(predicate::str::contains("Disqualified"));
    }

    #[test]
    fn test_stages_list_empty_team() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        dealflow(&dir)
            .args(["stages", "list", "--team", "3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No stages for team 3"));
    }

    #[test]
    fn test_stats_for_board_and_closer() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        dealflow(&dir)
            .args(["stages", "seed", "--team", "1"])
            .assert()
            .success();

        {
            let db = Database::new(&dir.path().join(".dealflow/dealflow.db")).unwrap();
            for (email, closer) in [("a@example.com", "cara"), ("b@example.com", "cara"), ("c@example.com", "dev")] {
                db.create_appointment(&NewAppointment {
                    team_id: 1,
                    lead_name: "Lead".into(),
                    lead_email: email.into(),
                    start_time: "2026-03-10T17:00:00Z".into(),
                    setter: None,
                    closer: Some(closer.into()),
                    pipeline_stage: Some("booked".into()),
                    calendar_invitee_ref: None,
                    original_appointment_id: None,
                })
                .unwrap();
            }
        }

        dealflow(&dir)
            .args(["stats", "--team", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Appointments Booked"))
            .stdout(predicate::str::contains("Total"));

        dealflow(&dir)
            .args(["stats", "--team", "1", "--closer", "cara"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Closer cara"))
            .stdout(predicate::str::contains("Appointments: 2"))
            .stdout(predicate::str::contains("Close rate:"));
    }
}
