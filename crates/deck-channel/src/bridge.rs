use crate::transport::Transport;
use async_trait::async_trait;
use deck_core::protocol::{
    CommandName, CommandPayload, CommandResultPayload, CommandStatus, Envelope, FrameError,
    MessageKind,
};
use deck_core::AgentError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("agent is not connected")]
    Disconnected,
    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("{command} rejected ({code}): {message}")]
    Rejected {
        command: String,
        code: String,
        message: String,
    },
    #[error("agent accepted start without a task id")]
    MissingTaskId,
    #[error("command encode failed: {0}")]
    Encode(String),
    #[error("{command} abandoned: connection dropped")]
    Dropped { command: String },
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        BridgeError::Encode(err.to_string())
    }
}

impl From<BridgeError> for AgentError {
    fn from(err: BridgeError) -> Self {
        let message = err.to_string();
        match err {
            BridgeError::Disconnected | BridgeError::Dropped { .. } => AgentError::transport(message),
            BridgeError::Timeout { .. } => AgentError::timeout(message),
            BridgeError::Rejected { code, .. } => AgentError::rejected(Some(code), message),
            BridgeError::MissingTaskId | BridgeError::Encode(_) => AgentError::protocol(message),
        }
    }
}

/// Command surface of the agent process.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Returns the agent-assigned task id.
    async fn start(&self, task: &str, target_windows: &[i64]) -> Result<String, BridgeError>;
    async fn stop(&self, task_id: &str) -> Result<(), BridgeError>;
    async fn resume(&self, task_id: &str) -> Result<(), BridgeError>;
    async fn confirm_action(
        &self,
        task_id: &str,
        action_id: &str,
        approved: bool,
    ) -> Result<(), BridgeError>;
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CommandResultPayload>>>>;

/// Sends `command` envelopes over the transport and pairs them with the
/// agent's `command_result` replies by request id.
pub struct TransportBridge {
    transport: Transport,
    pending: PendingMap,
    timeout: Duration,
}

/// Removes the request's slot however the wait ends.
struct PendingSlot {
    pending: PendingMap,
    request_id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.request_id);
    }
}

fn lock(
    pending: &PendingMap,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<CommandResultPayload>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransportBridge {
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Dispatcher subscriber for `command_result` envelopes.
    pub fn handle_result(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if !envelope.is(MessageKind::CommandResult) {
            return Ok(());
        }
        let result: CommandResultPayload = envelope.payload()?;
        match lock(&self.pending).remove(&result.request_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => {
                debug!(event = "deck_command_result_unmatched", request_id = %result.request_id);
            }
        }
        Ok(())
    }

    /// Abandons every outstanding request; their callers see `Dropped`.
    pub fn fail_pending(&self, reason: &str) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            warn!(event = "deck_commands_abandoned", count = drained.len(), reason);
        }
        drained.len()
    }

    async fn request(
        &self,
        command: CommandName,
        task_id: Option<&str>,
        args: Value,
    ) -> Result<CommandResultPayload, BridgeError> {
        if !self.transport.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope::with_payload(
            MessageKind::Command,
            &CommandPayload {
                request_id: request_id.clone(),
                command,
                task_id: task_id.map(str::to_string),
                args,
            },
        )?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);
        let _slot = PendingSlot {
            pending: self.pending.clone(),
            request_id: request_id.clone(),
        };

        if !self.transport.send(&envelope) {
            return Err(BridgeError::Disconnected);
        }
        debug!(event = "deck_command_sent", command = %command, request_id = %request_id);

        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                return Err(BridgeError::Dropped {
                    command: command.to_string(),
                })
            }
            Err(_) => {
                warn!(event = "deck_command_timeout", command = %command, request_id = %request_id);
                return Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        match result.status {
            CommandStatus::Accepted => Ok(result),
            CommandStatus::Rejected | CommandStatus::Error => {
                let (code, message) = match result.error {
                    Some(err) => (err.code, err.message),
                    None => (
                        "rejected".to_string(),
                        result.message.unwrap_or_else(|| "no reason given".to_string()),
                    ),
                };
                Err(BridgeError::Rejected {
                    command: command.to_string(),
                    code,
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl AgentBridge for TransportBridge {
    async fn start(&self, task: &str, target_windows: &[i64]) -> Result<String, BridgeError> {
        let result = self
            .request(
                CommandName::Start,
                None,
                json!({ "task": task, "targetWindows": target_windows }),
            )
            .await?;
        result.task_id.ok_or(BridgeError::MissingTaskId)
    }

    async fn stop(&self, task_id: &str) -> Result<(), BridgeError> {
        self.request(CommandName::Stop, Some(task_id), json!({}))
            .await
            .map(|_| ())
    }

    async fn resume(&self, task_id: &str) -> Result<(), BridgeError> {
        self.request(CommandName::Resume, Some(task_id), json!({}))
            .await
            .map(|_| ())
    }

    async fn confirm_action(
        &self,
        task_id: &str,
        action_id: &str,
        approved: bool,
    ) -> Result<(), BridgeError> {
        self.request(
            CommandName::ConfirmAction,
            Some(task_id),
            json!({ "actionId": action_id, "approved": approved }),
        )
        .await
        .map(|_| ())
    }
}
