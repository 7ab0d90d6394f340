//! Supervisor and coordinator tests against a scripted fake USI engine.
//!
//! The fake engine answers the handshake, emits one `info` line per `go`,
//! and answers `stop` with `bestmove`. A second variant dies on `go` to
//! exercise the exit path.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use kifu_studio::analysis::AnalysisCoordinator;
use kifu_studio::engine::{
    ConfigureOutcome, EngineSettings, EngineSupervisor, OutputKind, StatusCell, SupervisorState,
};
use kifu_studio::server::hub::{Hub, OutboundFrame};

const FAKE_ENGINE: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    usi)
      echo "id name FakeEngine 1.0"
      echo "option name USI_Hash type spin default 256 min 1 max 1024"
      echo "option name Threads type spin default 1 min 1 max 32"
      echo "option name MultiPV type spin default 1 min 1 max 10"
      echo "usiok"
      ;;
    isready)
      echo "readyok"
      ;;
    go*)
      echo "info depth 5 seldepth 7 multipv 1 score cp 42 nodes 1000 nps 5000 hashfull 10 pv 7g7f 3c3d"
      ;;
    stop)
      echo "bestmove 7g7f"
      ;;
    quit)
      exit 0
      ;;
  esac
done
"#;

const DYING_ENGINE: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    usi)
      echo "id name DyingEngine"
      echo "usiok"
      ;;
    isready)
      echo "readyok"
      ;;
    go*)
      exit 1
      ;;
  esac
done
"#;

fn write_engine(dir: &tempfile::TempDir, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join(name);
    std::fs::write(&path, script).expect("write fake engine");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake engine");
    path
}

async fn expect_frame(
    rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    kind: &str,
    within: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let frame = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for '{kind}'"))
            .expect("hub channel open");
        if frame.kind == kind {
            return frame.payload;
        }
    }
}

#[tokio::test]
async fn supervisor_handshakes_searches_and_stops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_path = write_engine(&dir, "fake-engine", FAKE_ENGINE);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut supervisor = EngineSupervisor::new(events_tx);

    let settings = EngineSettings {
        engine_id: "fake".to_string(),
        threads: 1,
        hash_mb: 16,
        multipv: 1,
    };
    let outcome = supervisor
        .configure(&engine_path, &settings)
        .await
        .expect("configure");
    assert_eq!(outcome, ConfigureOutcome::Cold);
    assert_eq!(supervisor.state(), SupervisorState::Configured);
    let status = supervisor.status();
    assert_eq!(status.name.as_deref(), Some("FakeEngine 1.0"));

    let generation = supervisor
        .analyze("position startpos")
        .await
        .expect("analyze");
    assert_eq!(supervisor.state(), SupervisorState::Searching);

    // The fake engine emits one info line per `go`.
    let info = loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("engine output")
            .expect("events channel open");
        assert_eq!(event.generation, generation);
        match event.kind {
            OutputKind::Info(info) => break info,
            other => panic!("unexpected event before info: {other:?}"),
        }
    };
    assert_eq!(info.depth, Some(5));
    assert_eq!(info.multipv, Some(1));
    assert_eq!(info.pv.as_ref().map(Vec::len), Some(2));

    supervisor.request_stop().await.expect("stop");
    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("bestmove")
        .expect("events channel open");
    match event.kind {
        OutputKind::BestMove(mv) => assert_eq!(mv, "7g7f"),
        other => panic!("expected bestmove, got {other:?}"),
    }
    supervisor.on_bestmove();
    assert_eq!(supervisor.state(), SupervisorState::Configured);

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

fn coordinator_with_engine(
    engine_path: PathBuf,
) -> (
    Hub,
    kifu_studio::analysis::AnalysisHandle,
    mpsc::UnboundedReceiver<kifu_studio::engine::AnalysisSnapshot>,
    StatusCell,
) {
    let hub = Hub::new();
    let status = StatusCell::new();
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
    let mut engines = HashMap::new();
    engines.insert("default".to_string(), engine_path);
    let (coordinator, handle) = AnalysisCoordinator::new(
        hub.clone(),
        snapshot_tx,
        status.clone(),
        engines,
        EngineSettings::default(),
    );
    tokio::spawn(coordinator.run());
    (hub, handle, snapshot_rx, status)
}

#[tokio::test]
async fn coordinator_streams_updates_and_cancels_on_node_change() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_path = write_engine(&dir, "fake-engine", FAKE_ENGINE);
    let (hub, handle, mut snapshots, _status) = coordinator_with_engine(engine_path);
    let (_conn, mut rx) = hub.register();

    handle
        .node_changed("node-root".to_string(), "position startpos".to_string())
        .await;
    handle.set_enabled(true).await;

    let update = expect_frame(&mut rx, "analysis:update", Duration::from_secs(5)).await;
    assert_eq!(update["nodeId"], "node-root");
    assert_eq!(update["lines"][0]["pvIndex"], 1);
    assert_eq!(update["lines"][0]["scoreType"], "cp");
    assert_eq!(update["lines"][0]["scoreValue"], 42);
    assert_eq!(update["best"]["pvUsi"][0], "7g7f");

    // The flush also queued a snapshot persist for the same node.
    let snapshot = tokio::time::timeout(Duration::from_secs(2), snapshots.recv())
        .await
        .expect("snapshot")
        .expect("snapshot channel open");
    assert_eq!(snapshot.node_id, "node-root");
    assert_eq!(snapshot.lines.len(), 1);

    // Position change: terminal stopped event, then updates for the new node.
    handle
        .node_changed(
            "node-child".to_string(),
            "position startpos moves 7g7f".to_string(),
        )
        .await;
    let stopped = expect_frame(&mut rx, "analysis:stopped", Duration::from_secs(5)).await;
    assert_eq!(stopped["reason"], "position_changed");
    assert_eq!(stopped["nodeId"], "node-root");

    let update = expect_frame(&mut rx, "analysis:update", Duration::from_secs(5)).await;
    assert_eq!(update["nodeId"], "node-child");

    // Disable: terminal stopped event, and no further updates arrive.
    handle.set_enabled(false).await;
    let stopped = expect_frame(&mut rx, "analysis:stopped", Duration::from_secs(5)).await;
    assert_eq!(stopped["reason"], "disabled");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let mut quiescent = true;
    while let Ok(frame) = rx.try_recv() {
        if frame.kind == "analysis:update" {
            quiescent = false;
        }
    }
    assert!(quiescent, "analysis:update after disable");

    handle.shutdown().await;
}

#[tokio::test]
async fn engine_death_disables_analysis_and_notifies_clients() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_path = write_engine(&dir, "dying-engine", DYING_ENGINE);
    let (hub, handle, _snapshots, status) = coordinator_with_engine(engine_path);
    let (_conn, mut rx) = hub.register();

    handle
        .node_changed("node-root".to_string(), "position startpos".to_string())
        .await;
    handle.set_enabled(true).await;

    let stopped = expect_frame(&mut rx, "analysis:stopped", Duration::from_secs(5)).await;
    assert_eq!(stopped["reason"], "exited");
    let toast = expect_frame(&mut rx, "toast", Duration::from_secs(5)).await;
    assert_eq!(toast["level"], "error");

    // Supervisor is failed until a fresh enable respawns it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status.snapshot().state, Some(SupervisorState::Failed));

    handle.shutdown().await;
}

#[tokio::test]
async fn missing_engine_binary_fails_cleanly() {
    let (hub, handle, _snapshots, _status) = coordinator_with_engine(PathBuf::from("/nonexistent"));
    let (_conn, mut rx) = hub.register();

    handle
        .node_changed("n".to_string(), "position startpos".to_string())
        .await;
    handle.set_enabled(true).await;

    let stopped = expect_frame(&mut rx, "analysis:stopped", Duration::from_secs(5)).await;
    assert_eq!(stopped["reason"], "spawn_failed");
    handle.shutdown().await;
}
