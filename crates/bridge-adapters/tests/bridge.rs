//! End-to-end tests through the `Bridge` facade.
//!
//! Headless runs use a fake CLI shell script; interactive sessions use the
//! scripted launcher so no real terminal is needed.

#![cfg(unix)]

use bridge_adapters::testing::{ScriptedLauncher, ScriptedReply};
use bridge_adapters::{BinaryLocator, Bridge};
use bridge_core::{BinaryConfig, BridgeConfig, RateLimitPolicy, RecoveryState};
use bridge_proto::{
    BridgeError, BridgeEvent, CloseReason, ErrorKind, ExecutionMode, ExecutionRequest,
    OutputPayload, OutputStream, RequestedMode,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const FAKE_CLI: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "2.1.0 (Fake Code)"; exit 0 ;;
  --help) echo "Usage: fake [options]"; echo "  --output-format <format>"; exit 0 ;;
  -p)
    case "$2" in
      status) echo "permission denied" >&2; exit 1 ;;
      *) echo "{\"type\":\"result\",\"result\":\"ran $2\"}"; exit 0 ;;
    esac ;;
esac
exit 0
"#;

fn write_fake_cli(dir: &Path) -> PathBuf {
    let path = dir.join("fake-claude");
    std::fs::write(&path, FAKE_CLI).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(binary: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.binary = BinaryConfig {
        names: Vec::new(),
        search_paths: vec![binary.display().to_string()],
        ..BinaryConfig::default()
    };
    config.recovery.error_log = None;
    config.recovery.base_delay_ms = 1;
    config
}

fn interactive_script(line: &str) -> ScriptedReply {
    match line {
        "hang" => ScriptedReply::Silent,
        "build feature X" => ScriptedReply::chunks(["...working...\n", "</result>\n$ "]),
        _ => ScriptedReply::chunks(["ok</result>\n> "]),
    }
}

fn build(config: BridgeConfig) -> (Bridge, ScriptedLauncher) {
    let launcher = ScriptedLauncher::new(interactive_script);
    let locator = BinaryLocator::new(config.binary.clone())
        .with_home(None)
        .with_workdir(None)
        .without_well_known();
    let bridge = Bridge::with_components(config, Arc::new(launcher.clone()), locator).unwrap();
    (bridge, launcher)
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_locate_probes_fake_cli() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, _launcher) = build(test_config(&cli));

    let info = bridge.locate().await.unwrap();
    assert_eq!(info.path, cli);
    assert_eq!(info.version, "2.1.0 (Fake Code)");
    assert!(info.capabilities.structured_output);
    assert!(!info.capabilities.custom_commands);

    let again = bridge.refresh_binary().await.unwrap();
    assert_eq!(again, info);
}

#[tokio::test]
async fn test_headless_nonzero_exit_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, _launcher) = build(test_config(&cli));

    let result = bridge
        .execute(ExecutionRequest::new("status"), "ide")
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.mode, ExecutionMode::Headless);
    assert_eq!(result.session_id, None);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "exit_status");
    assert!(error.message.contains("permission denied"));
    assert!(bridge.recovery().history().is_empty());
}

#[tokio::test]
async fn test_headless_structured_output_with_progress() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, _launcher) = build(test_config(&cli));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = bridge
        .execute_with_progress(ExecutionRequest::new("hello"), "ide", tx)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.mode, ExecutionMode::Headless);
    match &result.result {
        OutputPayload::Structured(values) => {
            assert_eq!(values.len(), 1);
            assert_eq!(values[0]["result"], "ran hello");
        }
        other => panic!("expected structured output, got {other:?}"),
    }

    let chunk = rx.recv().await.unwrap();
    assert_eq!(chunk.stream, OutputStream::Stdout);
    assert!(chunk.data.contains("ran hello"));

    let text = bridge
        .execute(
            ExecutionRequest::new("hello").with_output_format("text"),
            "ide",
        )
        .await
        .unwrap();
    assert_eq!(text.mode, ExecutionMode::Simple);
    assert!(!text.result.is_structured());
}

#[tokio::test]
async fn test_interactive_request_completes_in_session() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, launcher) = build(test_config(&cli));
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.attach("s1", "ide", tx).unwrap();

    let request = ExecutionRequest::new("build feature X")
        .with_session("s1")
        .with_mode(RequestedMode::Interactive);
    let result = bridge.execute(request, "ide").await.unwrap();

    assert!(result.success);
    assert_eq!(result.mode, ExecutionMode::Complex);
    assert_eq!(result.session_id.as_deref(), Some("s1"));
    assert!(result.result.as_text().contains("...working..."));
    assert!(result.result.as_text().contains("</result>"));

    let specs = launcher.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].program, cli);
    assert!(specs[0].args.is_empty());

    // A live session pulls short follow-ups onto the interactive path
    let follow_up = bridge
        .execute(ExecutionRequest::new("next").with_session("s1"), "ide")
        .await
        .unwrap();
    assert_eq!(follow_up.mode, ExecutionMode::Complex);
    assert_eq!(launcher.launch_count(), 1);

    let events = drain(&mut rx).await;
    let data: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, BridgeEvent::Data { .. }))
        .collect();
    assert_eq!(data.len(), 3);
    assert_eq!(
        events[0],
        BridgeEvent::SessionCreated {
            session_id: "s1".to_string()
        }
    );
}

#[tokio::test]
async fn test_interactive_timeout_retries_then_fails() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let mut config = test_config(&cli);
    config.recovery.max_retries = 2;
    let (bridge, launcher) = build(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.attach("r1", "ide", tx).unwrap();

    let request = ExecutionRequest::new("hang")
        .with_session("r1")
        .with_mode(RequestedMode::Interactive)
        .with_timeout(Duration::from_millis(100));
    let result = bridge.execute(request, "ide").await.unwrap();

    assert!(!result.success);
    assert_eq!(result.session_id.as_deref(), Some("r1"));
    assert_eq!(result.error.unwrap().kind, "timeout");
    assert_eq!(launcher.launch_count(), 3);
    assert_eq!(launcher.terminations(), vec![true, true, true]);
    assert_eq!(bridge.recovery().state(ErrorKind::Timeout), RecoveryState::Fatal);

    let events = drain(&mut rx).await;
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::Retry { attempt, kind, .. } => {
                assert_eq!(*kind, ErrorKind::Timeout);
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    let timed_out = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                BridgeEvent::Closed {
                    reason: CloseReason::TimedOut,
                    ..
                }
            )
        })
        .count();
    assert_eq!(timed_out, 3);
}

#[tokio::test]
async fn test_eleventh_ai_request_is_throttled() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, _launcher) = build(test_config(&cli));

    for i in 0..10 {
        let result = bridge
            .execute(ExecutionRequest::new(format!("task{i}")), "ide")
            .await
            .unwrap();
        assert!(result.success);
    }

    let err = bridge
        .execute(ExecutionRequest::new("one more"), "ide")
        .await
        .unwrap_err();
    match err {
        BridgeError::Throttled {
            retry_after_secs,
            limit,
            window_ms,
        } => {
            assert!(retry_after_secs >= 1);
            assert_eq!(limit, 10);
            assert_eq!(window_ms, 60_000);
        }
        other => panic!("expected throttling, got {other:?}"),
    }

    // Other identities have their own window
    let other = bridge
        .execute(ExecutionRequest::new("hello"), "other-ide")
        .await
        .unwrap();
    assert!(other.success);
}

#[tokio::test]
async fn test_missing_binary_fails_request() {
    let dir = TempDir::new().unwrap();
    let (bridge, launcher) = build(test_config(&dir.path().join("absent")));

    let err = bridge.locate().await.unwrap_err();
    assert!(err.checked.is_empty());

    let result = bridge
        .execute(ExecutionRequest::new("hello"), "ide")
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "not_found");
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_session_control_is_throttled_and_stop_notifies() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let mut config = test_config(&cli);
    config.rate_limits.session = RateLimitPolicy::new(60_000, 2);
    let (bridge, _launcher) = build(config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.attach("s1", "ide", tx).unwrap();
    let request = ExecutionRequest::new("status")
        .with_session("s1")
        .with_mode(RequestedMode::Interactive);
    assert!(bridge.execute(request, "ide").await.unwrap().success);
    assert_eq!(bridge.stats().await.active_sessions, 1);

    bridge.stop("s1", "ide").await.unwrap();
    let closed = drain(&mut rx)
        .await
        .into_iter()
        .find(|e| matches!(e, BridgeEvent::Closed { .. }));
    assert_eq!(closed, Some(BridgeEvent::closed("s1", CloseReason::Stopped)));
    assert_eq!(bridge.stats().await.active_sessions, 0);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = bridge.attach("s1", "ide", tx).unwrap_err();
    assert!(matches!(err, BridgeError::Throttled { .. }));
}

#[tokio::test]
async fn test_shutdown_stops_every_session() {
    let dir = TempDir::new().unwrap();
    let cli = write_fake_cli(dir.path());
    let (bridge, launcher) = build(test_config(&cli));
    let _maintenance = bridge.spawn_maintenance();

    for id in ["a", "b"] {
        let request = ExecutionRequest::new("status")
            .with_session(id)
            .with_mode(RequestedMode::Interactive);
        assert!(bridge.execute(request, "ide").await.unwrap().success);
    }
    assert_eq!(bridge.stats().await.active_sessions, 2);

    bridge.shutdown().await;
    assert_eq!(bridge.stats().await.active_sessions, 0);
    assert_eq!(launcher.terminations(), vec![false, false]);
}
