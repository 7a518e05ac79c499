//! Integration tests for the `coder-bridge` binary.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

#[cfg(unix)]
const FAKE_CLI: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "2.1.0 (Fake Code)"; exit 0 ;;
  --help) echo "  --output-format <format>"; exit 0 ;;
  -p)
    case "$2" in
      status) echo "permission denied" >&2; exit 1 ;;
      *) echo "{\"type\":\"result\",\"result\":\"ran $2\"}"; exit 0 ;;
    esac ;;
esac
exit 0
"#;

#[cfg(unix)]
fn write_fake_cli(dir: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-claude");
    fs::write(&path, FAKE_CLI)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[cfg(unix)]
fn write_config(dir: &Path, binary: &Path) -> Result<PathBuf> {
    let config = format!(
        r#"
binary:
  names: []
  search_paths:
    - "{}"
recovery:
  error_log: null
  base_delay_ms: 1
"#,
        binary.display()
    );
    let path = dir.join("coder-bridge.yml");
    fs::write(&path, config)?;
    Ok(path)
}

fn run(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_coder-bridge"))
        .args(args)
        .current_dir(dir)
        .env_remove("CODER_BRIDGE_BINARY")
        .env_remove("RUST_LOG")
        .output()?)
}

#[test]
fn test_config_without_file_prints_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let output = run(temp_dir.path(), &["config"])?;

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max_sessions: 10"));
    assert!(stdout.contains("interactive_threshold: 200"));
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    fs::write(
        temp_dir.path().join("coder-bridge.yml"),
        "session:\n  buffer_size: 0\n",
    )?;

    let output = run(temp_dir.path(), &["config"])?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Configuration validation failed"));
    Ok(())
}

#[test]
fn test_config_warnings_go_to_stderr() -> Result<()> {
    let temp_dir = TempDir::new()?;
    fs::write(
        temp_dir.path().join("coder-bridge.yml"),
        "session:\n  completion:\n    markers: []\n",
    )?;

    let output = run(temp_dir.path(), &["config"])?;

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("session.completion.markers"));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("markers: []"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_locate_prints_binary_info() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cli = write_fake_cli(temp_dir.path())?;
    write_config(temp_dir.path(), &cli)?;

    let output = run(temp_dir.path(), &["locate", "--refresh"])?;

    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(info["version"], "2.1.0 (Fake Code)");
    assert_eq!(info["path"], cli.display().to_string());
    assert_eq!(info["capabilities"]["structuredOutput"], true);
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_binary_env_override() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cli = write_fake_cli(temp_dir.path())?;
    fs::write(temp_dir.path().join("coder-bridge.yml"), "binary:\n  names: []\n")?;

    let output = Command::new(env!("CARGO_BIN_EXE_coder-bridge"))
        .arg("locate")
        .current_dir(temp_dir.path())
        .env("CODER_BRIDGE_BINARY", &cli)
        .output()?;

    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(info["path"], cli.display().to_string());
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_locate_reports_missing_binary() -> Result<()> {
    // A real install in a system location would be found
    if ["/usr/local/bin/claude", "/opt/homebrew/bin/claude"]
        .iter()
        .any(|p| Path::new(p).exists())
    {
        return Ok(());
    }

    let temp_dir = TempDir::new()?;
    fs::write(
        temp_dir.path().join("coder-bridge.yml"),
        "binary:\n  names: []\n  search_paths: [\"./absent\"]\n",
    )?;

    let output = Command::new(env!("CARGO_BIN_EXE_coder-bridge"))
        .arg("locate")
        .current_dir(temp_dir.path())
        .env("HOME", temp_dir.path())
        .env_remove("CODER_BRIDGE_BINARY")
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No usable CLI binary found"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_exec_headless_success_and_failure() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let cli = write_fake_cli(temp_dir.path())?;
    write_config(temp_dir.path(), &cli)?;

    let output = run(temp_dir.path(), &["exec", "hello"])?;
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(result["type"], "headless");
    assert_eq!(result["success"], true);
    assert_eq!(result["result"][0]["result"], "ran hello");

    let output = run(temp_dir.path(), &["exec", "status", "--text"])?;
    assert_eq!(output.status.code(), Some(1));
    let result: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(result["type"], "simple");
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["kind"], "exit_status");
    Ok(())
}
