use crate::bridge::TransportBridge;
use crate::config::ChannelConfig;
use crate::connection::ConnectionState;
use crate::connector::{connector_for, ConnectError, Connector};
use crate::dispatch::{DispatchReport, Dispatcher, SubscriptionId, Topic};
use crate::session::SessionController;
use crate::transport::{Transport, TransportEvent, TransportOptions};
use deck_core::protocol::{Envelope, MessageKind};
use deck_core::AgentError;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Link health as shown next to the task status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub generation: u64,
    pub attempts: u32,
    pub gave_up: bool,
    pub next_retry_ms: Option<u64>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            gave_up: false,
            next_retry_ms: None,
        }
    }
}

/// Presentation layer for cursor, highlight and glow commands.
pub trait OverlaySink: Send + Sync {
    fn render(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Transport, dispatcher, command bridge and session wired together.
///
/// Must be created inside a tokio runtime.
pub struct ControlChannel {
    address: String,
    transport: Transport,
    dispatcher: Dispatcher,
    bridge: Arc<TransportBridge>,
    session: SessionController,
    link: watch::Receiver<LinkStatus>,
    pump: JoinHandle<()>,
}

impl ControlChannel {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ConnectError> {
        let connector = connector_for(&config.address, config.max_frame_bytes)?;
        Ok(Self::connect(config, connector))
    }

    pub fn connect(config: &ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(connector, TransportOptions::from(config), events_tx);
        let bridge = Arc::new(TransportBridge::new(
            transport.clone(),
            config.session.command_timeout(),
        ));
        let session = SessionController::new(bridge.clone(), config.session.toast_ttl());

        let dispatcher = Dispatcher::new();
        {
            let bridge = bridge.clone();
            dispatcher.subscribe(Topic::Kind(MessageKind::CommandResult), move |envelope| {
                bridge.handle_result(envelope)
            });
        }
        {
            let session = session.clone();
            dispatcher.subscribe(Topic::All, move |envelope| session.apply(envelope));
        }

        let (link_tx, link) = watch::channel(LinkStatus::default());
        let pump = tokio::spawn(pump_events(
            events_rx,
            dispatcher.clone(),
            bridge.clone(),
            session.clone(),
            link_tx,
        ));

        transport.open(&config.address);
        Self {
            address: config.address.clone(),
            transport,
            dispatcher,
            bridge,
            session,
            link,
            pump,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn link(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(topic, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    pub fn subscribe_overlay(&self, sink: Arc<dyn OverlaySink>) -> SubscriptionId {
        self.dispatcher
            .subscribe(Topic::Overlay, move |envelope| sink.render(envelope))
    }

    /// Manual retry; also revives the channel after the transport gave up.
    pub fn reconnect(&self) {
        self.transport.open(&self.address);
    }

    pub fn shutdown(&self) {
        self.transport.close();
        self.bridge.fail_pending("channel shut down");
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.transport.close();
        self.pump.abort();
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatcher: Dispatcher,
    bridge: Arc<TransportBridge>,
    session: SessionController,
    link: watch::Sender<LinkStatus>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::StateChanged { state, generation } => {
                link.send_modify(|status| {
                    status.state = state;
                    status.generation = generation;
                    if state == ConnectionState::Connected {
                        status.attempts = 0;
                        status.gave_up = false;
                        status.next_retry_ms = None;
                    }
                });
                if state == ConnectionState::Disconnected {
                    bridge.fail_pending("connection lost");
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                link.send_modify(|status| {
                    status.attempts = attempt;
                    status.gave_up = false;
                    status.next_retry_ms = Some(delay.as_millis() as u64);
                });
            }
            TransportEvent::Envelopes(batch) => {
                let report: DispatchReport = dispatcher.dispatch(&batch);
                if report.failures > 0 {
                    debug!(
                        event = "deck_dispatch_report",
                        envelopes = report.envelopes,
                        deliveries = report.deliveries,
                        failures = report.failures
                    );
                }
            }
            TransportEvent::GaveUp { attempts } => {
                link.send_modify(|status| {
                    status.attempts = attempts;
                    status.gave_up = true;
                    status.next_retry_ms = None;
                });
                warn!(event = "deck_link_lost", attempts);
                session.fail(AgentError::transport(format!(
                    "lost connection to agent after {attempts} reconnect attempts"
                )));
            }
        }
    }
    info!(event = "deck_pump_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;
    use deck_core::TaskStatus;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(max_attempts: u32) -> ChannelConfig {
        let mut config = ChannelConfig::default();
        config.reconnect.max_attempts = max_attempts;
        config
    }

    async fn wait_link<F: Fn(&LinkStatus) -> bool>(
        link: &mut watch::Receiver<LinkStatus>,
        done: F,
    ) -> LinkStatus {
        loop {
            {
                let status = link.borrow_and_update();
                if done(&status) {
                    return status.clone();
                }
            }
            link.changed().await.expect("pump alive");
        }
    }

    struct RecordingOverlay(Mutex<Vec<String>>);

    impl OverlaySink for RecordingOverlay {
        fn render(&self, envelope: &Envelope) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(envelope.kind.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_and_session_share_one_batch() {
        let connector = ScriptedConnector::new(vec![true]);
        let mut peers = connector.take_peers();
        let channel = ControlChannel::connect(&config(3), connector);
        let overlay = Arc::new(RecordingOverlay(Mutex::new(Vec::new())));
        channel.subscribe_overlay(overlay.clone());

        let mut link = channel.link();
        wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
        let peer = peers.recv().await.expect("peer");

        let mut session = channel.session().subscribe();
        peer.send_json(json!([
            {"type": "toast", "data": {"message": "Agent ready"}},
            {"type": "cursor_move", "data": {"x": 10, "y": 20, "duration": 200}},
            {"type": "highlight", "data": {"rect": [0, 0, 5, 5], "label": "Search"}},
        ]));
        session.changed().await.expect("session alive");
        tokio::task::yield_now().await;

        assert_eq!(*overlay.0.lock().unwrap(), vec!["cursor_move", "highlight"]);
        assert_eq!(channel.session().snapshot().notices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn give_up_fails_the_running_task() {
        let connector = ScriptedConnector::new(vec![true]);
        let mut peers = connector.take_peers();
        let channel = ControlChannel::connect(&config(2), connector.clone());
        let mut link = channel.link();
        wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
        let mut peer = peers.recv().await.expect("peer");

        let session = channel.session().clone();
        let start = tokio::spawn(async move { session.start("goal", vec![]).await });
        let command = loop {
            let envelope = peer.recv_envelope().await.expect("command");
            if envelope.is(MessageKind::Command) {
                break envelope
                    .payload::<deck_core::protocol::CommandPayload>()
                    .expect("payload");
            }
        };
        peer.send_json(json!({
            "type": "command_result",
            "data": {"requestId": command.request_id, "status": "accepted", "taskId": "task-7"}
        }));
        assert_eq!(start.await.expect("join"), Ok("task-7".to_string()));

        connector.drop_live_peers();
        let status = wait_link(&mut link, |status| status.gave_up).await;
        assert_eq!(status.attempts, 2);
        assert_eq!(status.state, ConnectionState::Disconnected);

        let snapshot = channel.session().snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        let err = snapshot.last_error.expect("transport error");
        assert!(err.recoverable);

        connector.push_outcome(true);
        channel.reconnect();
        let status = wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
        assert!(!status.gave_up);
        assert_eq!(status.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_ack_and_completion_in_one_batch() {
        let connector = ScriptedConnector::new(vec![true]);
        let mut peers = connector.take_peers();
        let channel = ControlChannel::connect(&config(3), connector);
        let mut link = channel.link();
        wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
        let mut peer = peers.recv().await.expect("peer");

        let session = channel.session().clone();
        let start = tokio::spawn(async move { session.start("quick lookup", vec![]).await });
        let command = loop {
            let envelope = peer.recv_envelope().await.expect("command");
            if envelope.is(MessageKind::Command) {
                break envelope
                    .payload::<deck_core::protocol::CommandPayload>()
                    .expect("payload");
            }
        };
        peer.send_json(json!([
            {"type": "command_result", "data": {"requestId": command.request_id, "status": "accepted", "taskId": "task-7"}},
            {"type": "complete", "data": {"summary": "done"}},
        ]));

        assert_eq!(start.await.expect("join"), Ok("task-7".to_string()));
        let snapshot = channel.session().snapshot();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.current_task_id, None);
        let extra = tokio::time::timeout(Duration::from_millis(500), peer.recv_envelope()).await;
        assert!(extra.is_err(), "unexpected command after completion: {extra:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_abandons_in_flight_commands() {
        let connector = ScriptedConnector::new(vec![true]);
        let mut peers = connector.take_peers();
        let channel = ControlChannel::connect(&config(0), connector.clone());
        let mut link = channel.link();
        wait_link(&mut link, |status| status.state == ConnectionState::Connected).await;
        let mut peer = peers.recv().await.expect("peer");

        let session = channel.session().clone();
        let start = tokio::spawn(async move { session.start("goal", vec![]).await });
        peer.recv_envelope().await.expect("command sent");
        connector.drop_live_peers();

        let err = start.await.expect("join").expect_err("dropped");
        assert_eq!(err.kind, deck_core::AgentErrorKind::Transport);
        assert_eq!(channel.session().snapshot().status, TaskStatus::Failed);

        let status = wait_link(&mut link, |status| status.next_retry_ms.is_some()).await;
        assert_eq!(status.next_retry_ms, Some(1_000));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
