//! Fetcher that runs an external command and parses its stdout as JSON.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tokio::process::Command;

pub async fn run_json(command: &[String]) -> Result<Value> {
  let (program, args) = command
    .split_first()
    .ok_or_else(|| eyre!("No fetch command given"))?;

  let output = Command::new(program)
    .args(args)
    .output()
    .await
    .map_err(|e| eyre!("Failed to run {}: {}", program, e))?;

  if !output.status.success() {
    return Err(eyre!(
      "{} exited with {}: {}",
      program,
      output.status,
      String::from_utf8_lossy(&output.stderr).trim()
    ));
  }

  serde_json::from_slice(&output.stdout)
    .map_err(|e| eyre!("Failed to parse output of {} as JSON: {}", program, e))
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use serde_json::json;

  fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test]
  async fn test_parses_stdout() {
    let value = run_json(&cmd(&["echo", r#"{"users": [1, 2]}"#])).await.unwrap();
    assert_eq!(value, json!({"users": [1, 2]}));
  }

  #[tokio::test]
  async fn test_non_zero_exit_is_error() {
    let err = run_json(&cmd(&["sh", "-c", "echo offline >&2; exit 3"]))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("offline"));
  }

  #[tokio::test]
  async fn test_invalid_json_is_error() {
    let err = run_json(&cmd(&["echo", "not json"])).await.unwrap_err();
    assert!(err.to_string().contains("Failed to parse"));
  }

  #[tokio::test]
  async fn test_empty_command_is_error() {
    assert!(run_json(&[]).await.is_err());
  }
}
