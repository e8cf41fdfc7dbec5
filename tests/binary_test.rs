//! Binary execution tests for the reminder cache CLI
//!
//! These tests verify that the binary runs its maintenance commands against an
//! isolated cache directory and prints JSON.

use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn cli(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("reminder-cache").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("REMINDER_CACHE_DIR")
        .env_remove("REMINDER_TEMP_DIR")
        .arg("--quiet");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_binary_help() {
    let home = TempDir::new().unwrap();
    let output = cli(&home).arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("clean"));
    assert!(help.contains("migrate"));
}

#[test]
fn test_print_cache_dir_precedence() {
    let home = TempDir::new().unwrap();
    let env_dir = TempDir::new().unwrap();
    let flag_dir = TempDir::new().unwrap();

    let output = cli(&home).arg("print-cache-dir").output().unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        home.path().join(".reminder-cache").display().to_string()
    );

    let output = cli(&home)
        .env("REMINDER_CACHE_DIR", env_dir.path())
        .arg("print-cache-dir")
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        env_dir.path().display().to_string()
    );

    let output = cli(&home)
        .env("REMINDER_CACHE_DIR", env_dir.path())
        .args(["--cache-dir", flag_dir.path().to_str().unwrap(), "print-cache-dir"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        flag_dir.path().display().to_string()
    );
}

#[test]
fn test_stats_reports_directories_and_store() {
    let home = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    fs::create_dir_all(cache.path().join("images")).unwrap();
    fs::write(cache.path().join("images").join("a.png"), vec![0u8; 64]).unwrap();

    let output = cli(&home)
        .env("REMINDER_CACHE_DIR", cache.path())
        .arg("stats")
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let json = stdout_json(&output);
    assert_eq!(json["directories"]["images"]["file_count"], 1);
    assert_eq!(json["directories"]["images"]["total_bytes"], 64);
    assert_eq!(json["store"]["total_records"], 0);
}

#[test]
fn test_clean_requires_force_or_dry_run() {
    let home = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let file = cache.path().join("temp").join("x.tmp");
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(&file, b"x").unwrap();

    let output = cli(&home)
        .args(["--cache-dir", cache.path().to_str().unwrap(), "clean", "--temp"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(file.exists());

    let output = cli(&home)
        .args([
            "--cache-dir",
            cache.path().to_str().unwrap(),
            "clean",
            "--temp",
            "--dry-run",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["total_files"], 1);
    assert!(file.exists());

    let output = cli(&home)
        .args([
            "--cache-dir",
            cache.path().to_str().unwrap(),
            "clean",
            "--temp",
            "--force",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(!file.exists());
}

#[test]
fn test_clean_rejects_bad_age() {
    let home = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let output = cli(&home)
        .args([
            "--cache-dir",
            cache.path().to_str().unwrap(),
            "clean",
            "--all",
            "--dry-run",
            "--older-than",
            "soon",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_migrate_dry_run_from_home() {
    let home = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let legacy = home.path().join(".reminder_cache");
    fs::create_dir_all(&legacy).unwrap();
    fs::write(legacy.join("task_cache.json"), b"[]").unwrap();

    let output = cli(&home)
        .args([
            "--cache-dir",
            cache.path().to_str().unwrap(),
            "migrate",
            "--dry-run",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["would_migrate"].as_array().unwrap().len(), 1);
    assert!(!cache.path().join("tasks").join("task_cache.json").exists());
}
