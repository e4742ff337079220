use anyhow::Result;
use std::path::Path;
use std::process::{Command, Output};

fn quarry(data_dir: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_quarry"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()?;
    Ok(output)
}

fn stdout_of(output: &Output) -> Result<String> {
    assert!(
        output.status.success(),
        "quarry failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8(output.stdout.clone())?)
}

/// Test that the CLI can initialize a data directory
#[test]
fn test_cli_init_command() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output_str = stdout_of(&quarry(dir.path(), &["init"])?)?;
    assert!(output_str.contains("Store ready: 0 tables"), "Unexpected init output: {}", output_str);
    assert!(dir.path().join("quarry.db").exists());
    Ok(())
}

/// Records written by one invocation are visible to the next
#[test]
fn test_cli_record_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    stdout_of(&quarry(dir.path(), &["create-table", "users"])?)?;

    let id = stdout_of(&quarry(dir.path(), &["insert", "users", "alice"])?)?;
    let id = id.trim();
    assert_eq!(stdout_of(&quarry(dir.path(), &["get", "users", id])?)?.trim(), "alice");

    stdout_of(&quarry(dir.path(), &["update", "users", id, "616c6963652032", "--hex"])?)?;
    assert_eq!(stdout_of(&quarry(dir.path(), &["get", "users", id])?)?.trim(), "alice 2");
    assert_eq!(
        stdout_of(&quarry(dir.path(), &["get", "users", id, "--hex"])?)?.trim(),
        "616c6963652032"
    );

    let tables = stdout_of(&quarry(dir.path(), &["tables"])?)?;
    assert!(tables.contains("users"));
    assert!(tables.contains("(1 tables)"));

    stdout_of(&quarry(dir.path(), &["delete", "users", id])?)?;
    let output = quarry(dir.path(), &["get", "users", id])?;
    assert!(!output.status.success(), "Deleted record is still readable");
    Ok(())
}

/// Maintenance commands print JSON reports
#[test]
fn test_cli_maintenance_commands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    stdout_of(&quarry(dir.path(), &["create-table", "t"])?)?;
    stdout_of(&quarry(dir.path(), &["insert", "t", "row"])?)?;

    let stats: serde_json::Value = serde_json::from_str(&stdout_of(&quarry(dir.path(), &["stats"])?)?)?;
    assert_eq!(stats["tables"], 1);

    let verify: serde_json::Value = serde_json::from_str(&stdout_of(&quarry(dir.path(), &["verify"])?)?)?;
    assert_eq!(verify["tables_checked"], 1);
    assert_eq!(verify["records_checked"], 1);

    let vacuum: serde_json::Value = serde_json::from_str(&stdout_of(&quarry(dir.path(), &["vacuum"])?)?)?;
    assert_eq!(vacuum["tables"], 1);

    let checkpoint = stdout_of(&quarry(dir.path(), &["checkpoint"])?)?;
    assert!(checkpoint.starts_with("Checkpoint at LSN"));
    Ok(())
}

/// Errors surface as a failing exit status
#[test]
fn test_cli_reports_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = quarry(dir.path(), &["get", "missing", "1"])?;
    assert!(!output.status.success());

    let output = quarry(dir.path(), &["--buffer-size", "1", "init"])?;
    assert!(!output.status.success(), "Undersized buffer pool accepted");
    Ok(())
}
