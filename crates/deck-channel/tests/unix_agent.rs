#![cfg(unix)]

use deck_channel::{
    ChannelConfig, ConnectionState, ControlChannel, LinkStatus, OverlaySink, SessionSnapshot,
};
use deck_core::protocol::{decode_frame, CommandName, CommandPayload, Envelope, DEFAULT_MAX_FRAME_BYTES};
use deck_core::TaskStatus;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::watch;

struct FakeAgent {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeAgent {
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("write");
    }

    async fn read_frame(&mut self) -> Envelope {
        let mut line = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), self.reader.read_until(b'\n', &mut line))
            .await
            .expect("read timeout")
            .expect("read error");
        assert!(read > 0, "unexpected EOF");
        let mut report = decode_frame(&line, DEFAULT_MAX_FRAME_BYTES);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        report.envelopes.remove(0)
    }

    async fn read_command(&mut self) -> CommandPayload {
        loop {
            let envelope = self.read_frame().await;
            if envelope.kind == "command" {
                return envelope.payload().expect("command payload");
            }
        }
    }

    async fn ack(&mut self, command: &CommandPayload, task_id: Option<&str>) {
        self.send(json!({
            "type": "command_result",
            "data": {
                "requestId": command.request_id,
                "command": command.command.as_str(),
                "status": "accepted",
                "taskId": task_id,
            }
        }))
        .await;
    }
}

struct RecordingOverlay(Mutex<Vec<Envelope>>);

impl OverlaySink for RecordingOverlay {
    fn render(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn socket_path(dir: &Path) -> PathBuf {
    dir.join("agent.sock")
}

fn config_for(path: &Path) -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.address = format!("unix://{}", path.display());
    config.reconnect.initial_backoff_ms = 250;
    config.reconnect.max_backoff_ms = 1_000;
    config
}

async fn wait_session<F: Fn(&SessionSnapshot) -> bool>(
    rx: &mut watch::Receiver<SessionSnapshot>,
    done: F,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if done(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("session alive");
        }
    })
    .await
    .expect("session wait timeout")
}

async fn wait_link<F: Fn(&LinkStatus) -> bool>(
    rx: &mut watch::Receiver<LinkStatus>,
    done: F,
) -> LinkStatus {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            {
                let status = rx.borrow_and_update();
                if done(&status) {
                    return status.clone();
                }
            }
            rx.changed().await.expect("pump alive");
        }
    })
    .await
    .expect("link wait timeout")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_lifecycle_over_unix_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(dir.path());
    let listener = UnixListener::bind(&path).expect("bind");

    let channel = ControlChannel::from_config(&config_for(&path)).expect("channel");
    let overlay = Arc::new(RecordingOverlay(Mutex::new(Vec::new())));
    channel.subscribe_overlay(overlay.clone());
    let mut agent = FakeAgent::accept(&listener).await;
    let mut link = channel.link();
    wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;

    let session = channel.session().clone();
    let start = tokio::spawn(async move { session.start("book a table for two", vec![3]).await });
    let command = agent.read_command().await;
    assert_eq!(command.command, CommandName::Start);
    assert_eq!(command.args["task"], "book a table for two");
    assert_eq!(command.args["targetWindows"], json!([3]));
    agent.ack(&command, Some("task-1")).await;
    assert_eq!(start.await.expect("join"), Ok("task-1".to_string()));

    let mut updates = channel.session().subscribe();
    agent
        .send(json!([
            {"type": "status", "data": {"status": "executing"}},
            {"type": "progress", "data": {"iteration": 3, "maxIterations": 10, "toolCalls": 4}},
            {"type": "cursor_move", "data": {"x": 120, "y": 48, "duration": 300}},
            {"type": "confirm", "data": {"actionId": "a-1", "description": "Submit reservation", "risk": "high"}},
        ]))
        .await;
    let snapshot = wait_session(&mut updates, |s| s.status == TaskStatus::Confirm).await;
    let pending = snapshot.pending.expect("pending action");
    assert_eq!(pending.action_id, "a-1");
    assert_eq!(pending.task_id.as_deref(), Some("task-1"));
    assert_eq!(snapshot.task.expect("task").progress.iteration, 3);

    let session = channel.session().clone();
    let confirm = tokio::spawn(async move { session.confirm("a-1", true).await });
    let command = agent.read_command().await;
    assert_eq!(command.command, CommandName::ConfirmAction);
    assert_eq!(command.task_id.as_deref(), Some("task-1"));
    assert_eq!(command.args, json!({"actionId": "a-1", "approved": true}));
    agent.ack(&command, Some("task-1")).await;
    assert_eq!(confirm.await.expect("join"), Ok(()));
    assert_eq!(channel.session().snapshot().status, TaskStatus::Executing);

    agent
        .send(json!({"type": "complete", "data": {"summary": "Table booked for 19:00"}}))
        .await;
    let snapshot = wait_session(&mut updates, |s| s.status == TaskStatus::Completed).await;
    assert_eq!(
        snapshot.task.and_then(|task| task.summary),
        Some("Table booked for 19:00".to_string())
    );

    let overlay = overlay.0.lock().unwrap();
    assert_eq!(overlay.len(), 1);
    assert_eq!(overlay[0].data["x"], 120);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_agent_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(dir.path());
    let listener = UnixListener::bind(&path).expect("bind");

    let channel = ControlChannel::from_config(&config_for(&path)).expect("channel");
    let mut link = channel.link();
    let agent = FakeAgent::accept(&listener).await;
    let first = wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;

    drop(agent);
    let retry = wait_link(&mut link, |status| status.next_retry_ms.is_some()).await;
    assert_eq!(retry.attempts, 1);
    assert_eq!(retry.next_retry_ms, Some(250));

    let mut agent = FakeAgent::accept(&listener).await;
    let second = wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
    assert!(second.generation > first.generation);
    assert_eq!(second.attempts, 0);

    let mut updates = channel.session().subscribe();
    agent
        .send(json!({"type": "toast", "data": {"message": "Agent restarted", "level": "warning"}}))
        .await;
    let snapshot = wait_session(&mut updates, |s| !s.notices.is_empty()).await;
    assert_eq!(snapshot.notices[0].message, "Agent restarted");
    assert_eq!(snapshot.status, TaskStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_fail_softly_without_an_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(dir.path());

    let channel = ControlChannel::from_config(&config_for(&path)).expect("channel");
    let err = channel
        .session()
        .start("goal", vec![])
        .await
        .expect_err("no agent listening");
    assert_eq!(err.kind, deck_core::AgentErrorKind::Transport);
    assert!(err.recoverable);
    assert_eq!(channel.session().snapshot().status, TaskStatus::Failed);
    channel.shutdown();
    assert_eq!(channel.transport().state(), ConnectionState::Disconnected);
}
