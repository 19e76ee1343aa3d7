//! In-memory sockets for driving the transport under a paused clock.

use crate::connector::{ConnectError, Connector, Socket};
use async_trait::async_trait;
use deck_core::protocol::Envelope;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Agent side of one scripted connection.
pub struct TestPeer {
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl TestPeer {
    pub fn send_json(&self, value: Value) {
        self.send_raw(value.to_string().as_bytes());
    }

    pub fn send_raw(&self, frame: &[u8]) {
        let _ = self.to_client.send(frame.to_vec());
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }
}

/// Connector whose outcomes are scripted up front; once the script runs
/// out, every further attempt is refused.
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<bool>>,
    attempts: AtomicU32,
    peers_tx: mpsc::UnboundedSender<TestPeer>,
    peers_rx: Mutex<Option<mpsc::UnboundedReceiver<TestPeer>>>,
    live: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ScriptedConnector {
    pub fn new(outcomes: Vec<bool>) -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            attempts: AtomicU32::new(0),
            peers_tx,
            peers_rx: Mutex::new(Some(peers_rx)),
            live: Mutex::new(Vec::new()),
        })
    }

    /// Peers for successful connections, in connect order. Single use.
    pub fn take_peers(&self) -> mpsc::UnboundedReceiver<TestPeer> {
        self.peers_rx
            .lock()
            .expect("peers lock")
            .take()
            .expect("peers already taken")
    }

    pub fn push_outcome(&self, succeed: bool) {
        self.outcomes.lock().expect("outcomes lock").push_back(succeed);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ends the inbound stream of every open connection, as if the agent
    /// process went away.
    pub fn drop_live_peers(&self) {
        self.live.lock().expect("live lock").clear();
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _address: &str) -> Result<Socket, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let succeed = self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(false);
        if !succeed {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            )));
        }

        let (to_client, inbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let (outbound, from_client) = mpsc::unbounded_channel::<String>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.live.lock().expect("live lock").push(kill_tx);

        let stream = futures_util::stream::unfold(inbound, |mut inbound| async move {
            inbound.recv().await.map(|frame| (Ok(frame), inbound))
        })
        .take_until(kill_rx);
        let sink = futures_util::sink::unfold(outbound, |outbound, text: String| async move {
            outbound
                .send(text)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok::<_, io::Error>(outbound)
        });

        let _ = self.peers_tx.send(TestPeer {
            to_client,
            from_client,
        });
        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
