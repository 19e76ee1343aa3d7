//! Task lifecycle driven by agent envelopes and operator commands.
//!
//! [`SessionState`] is the synchronous machine: every transition is a plain
//! method returning what changed. [`SessionController`] wraps it with the
//! command bridge, publishes snapshots over a `watch` channel and runs the
//! notice expiry timers.

use crate::bridge::AgentBridge;
use chrono::{DateTime, Utc};
use deck_core::protocol::{
    CompletePayload, ConfirmPayload, Envelope, ErrorPayload, MessageKind, ProgressPayload,
    StatusPayload, ToastPayload, ToolPayload,
};
use deck_core::{
    AgentError, AgentTask, NoticeLevel, PendingAction, TaskStatus, TransientNotice,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Read-only view handed to UI code.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: TaskStatus,
    pub task: Option<AgentTask>,
    pub pending: Option<PendingAction>,
    pub notices: Vec<TransientNotice>,
    pub last_error: Option<AgentError>,
    /// Set only while the agent is working on the task; cleared once it ends.
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Ignored,
    /// A notice was added; the controller schedules its expiry.
    Notice {
        id: String,
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyIdle,
    /// `task_id` is set when a running agent task must be told to stop.
    Stopped { task_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    task: Option<AgentTask>,
    pending: Option<PendingAction>,
    notices: Vec<TransientNotice>,
    last_error: Option<AgentError>,
    notice_ttl: chrono::Duration,
    start_seq: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Duration::from_millis(4_000))
    }
}

impl SessionState {
    pub fn new(notice_ttl: Duration) -> Self {
        Self {
            task: None,
            pending: None,
            notices: Vec::new(),
            last_error: None,
            notice_ttl: chrono::Duration::from_std(notice_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(4)),
            start_seq: 0,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.task
            .as_ref()
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Idle)
    }

    pub fn task(&self) -> Option<&AgentTask> {
        self.task.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        self.pending.as_ref()
    }

    pub fn notices(&self) -> &[TransientNotice] {
        &self.notices
    }

    pub fn last_error(&self) -> Option<&AgentError> {
        self.last_error.as_ref()
    }

    /// Id of the task the agent is working on, if any.
    pub fn current_task_id(&self) -> Option<&str> {
        self.task
            .as_ref()
            .filter(|task| task.status.is_active())
            .and_then(|task| task.id.as_deref())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            task: self.task.clone(),
            pending: self.pending.clone(),
            notices: self.notices.clone(),
            last_error: self.last_error.clone(),
            current_task_id: self.current_task_id().map(str::to_string),
        }
    }

    /// Queues a new task. The returned token ties the agent's acknowledgment
    /// to this start and no later one.
    pub fn begin_start(
        &mut self,
        goal: &str,
        target_windows: Vec<i64>,
        now: DateTime<Utc>,
    ) -> Result<u64, AgentError> {
        let status = self.status();
        if status.is_active() {
            return Err(AgentError::invalid_state(format!(
                "cannot start a task while {status}"
            )));
        }
        if goal.trim().is_empty() {
            return Err(AgentError::invalid_state("task goal must not be empty"));
        }
        self.task = Some(AgentTask::queued(goal.trim(), target_windows, now));
        self.pending = None;
        self.last_error = None;
        self.start_seq += 1;
        Ok(self.start_seq)
    }

    /// Records the agent-assigned id. `false` when the task that asked for it
    /// was stopped or replaced, meaning the agent now runs an orphan that must
    /// be stopped. A task that already finished in the same batch as the
    /// acknowledgment still gets its id.
    pub fn start_accepted(&mut self, token: u64, task_id: &str, now: DateTime<Utc>) -> bool {
        if token != self.start_seq {
            return false;
        }
        match self.task.as_mut() {
            Some(task) if task.id.is_none() => {
                task.id = Some(task_id.to_string());
                if task.status == TaskStatus::Queued {
                    task.touch(TaskStatus::Thinking, now);
                } else {
                    task.updated_at = now;
                }
                if let Some(pending) = self.pending.as_mut() {
                    pending.task_id.get_or_insert_with(|| task_id.to_string());
                }
                true
            }
            _ => false,
        }
    }

    pub fn apply(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> Result<Applied, AgentError> {
        let Some(kind) = envelope.message_kind() else {
            return Ok(Applied::Ignored);
        };
        if kind == MessageKind::Toast {
            let payload: ToastPayload = parse(envelope)?;
            let id = payload
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            return Ok(self.push_notice(id, payload.message, payload.level, now));
        }
        if !kind.is_lifecycle() {
            return Ok(Applied::Ignored);
        }
        if !self.status().is_active() {
            debug!(event = "deck_lifecycle_ignored", kind = %kind, status = %self.status());
            return Ok(Applied::Ignored);
        }

        match kind {
            MessageKind::Status => {
                let payload: StatusPayload = parse(envelope)?;
                Ok(self.apply_status(payload, now))
            }
            MessageKind::Progress => {
                let payload: ProgressPayload = parse(envelope)?;
                if let Some(task) = self.task.as_mut() {
                    let progress = &mut task.progress;
                    if let Some(iteration) = payload.iteration {
                        progress.iteration = iteration;
                    }
                    if payload.max_iterations.is_some() {
                        progress.max_iterations = payload.max_iterations;
                    }
                    if let Some(tool_calls) = payload.tool_calls {
                        progress.tool_calls = tool_calls;
                    }
                    if payload.current_window.is_some() {
                        progress.current_window = payload.current_window;
                    }
                    task.updated_at = now;
                }
                Ok(Applied::Changed)
            }
            MessageKind::Confirm => {
                let payload: ConfirmPayload = parse(envelope)?;
                Ok(self.request_confirmation(payload, now))
            }
            MessageKind::Error => {
                let payload: ErrorPayload = parse(envelope)?;
                self.fail(
                    AgentError::from_agent(payload.message, payload.code, payload.recoverable),
                    now,
                );
                Ok(Applied::Changed)
            }
            MessageKind::Complete => {
                let payload: CompletePayload = parse(envelope)?;
                self.complete(payload.summary, now);
                Ok(Applied::Changed)
            }
            MessageKind::Tool => {
                let payload: ToolPayload = parse(envelope)?;
                let pinned = self.pending.is_some();
                if let Some(task) = self.task.as_mut() {
                    task.last_tool = Some(payload.name);
                    let status = if pinned {
                        TaskStatus::Confirm
                    } else {
                        TaskStatus::Executing
                    };
                    task.touch(status, now);
                }
                Ok(Applied::Changed)
            }
            _ => Ok(Applied::Ignored),
        }
    }

    fn apply_status(&mut self, payload: StatusPayload, now: DateTime<Utc>) -> Applied {
        match payload.status {
            TaskStatus::Completed => {
                self.complete(payload.message, now);
                Applied::Changed
            }
            TaskStatus::Failed => {
                let message = payload
                    .message
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.fail(AgentError::from_agent(message, None, true), now);
                Applied::Changed
            }
            TaskStatus::Idle => {
                self.stop();
                Applied::Changed
            }
            // Confirm is only entered through a confirm envelope.
            TaskStatus::Confirm => Applied::Ignored,
            status => {
                if self.pending.is_some() {
                    debug!(event = "deck_status_pinned", requested = %status);
                    return Applied::Ignored;
                }
                match self.task.as_mut() {
                    Some(task) if task.status != status => {
                        task.touch(status, now);
                        Applied::Changed
                    }
                    _ => Applied::Ignored,
                }
            }
        }
    }

    fn request_confirmation(&mut self, payload: ConfirmPayload, now: DateTime<Utc>) -> Applied {
        if let Some(existing) = self.pending.as_ref() {
            if existing.action_id != payload.action_id {
                warn!(
                    event = "deck_confirm_overlap",
                    pending = %existing.action_id,
                    ignored = %payload.action_id
                );
            }
            return Applied::Ignored;
        }
        let Some(task) = self.task.as_mut() else {
            return Applied::Ignored;
        };
        self.pending = Some(PendingAction {
            action_id: payload.action_id,
            description: payload.description,
            risk: payload.risk,
            task_id: task.id.clone(),
            requested_at: now,
        });
        task.touch(TaskStatus::Confirm, now);
        Applied::Changed
    }

    /// Resolves the outstanding confirmation. Approval moves to executing,
    /// rejection pauses.
    pub fn resolve_pending(
        &mut self,
        action_id: &str,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, AgentError> {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.action_id == action_id);
        if !matches {
            return Err(AgentError::invalid_state(format!(
                "no pending action '{action_id}'"
            )));
        }
        if self.pending.as_ref().and_then(|p| p.task_id.as_ref()).is_none() {
            return Err(AgentError::invalid_state(
                "pending action has no task id yet",
            ));
        }
        let Some(pending) = self.pending.take() else {
            return Err(AgentError::invalid_state("no pending action"));
        };
        if let Some(task) = self.task.as_mut() {
            let status = if approved {
                TaskStatus::Executing
            } else {
                TaskStatus::Paused
            };
            task.touch(status, now);
        }
        Ok(pending)
    }

    pub fn stop(&mut self) -> StopOutcome {
        let Some(task) = self.task.take() else {
            self.pending = None;
            return StopOutcome::AlreadyIdle;
        };
        self.pending = None;
        let task_id = if task.status.is_active() { task.id } else { None };
        StopOutcome::Stopped { task_id }
    }

    /// Moves a failed or paused task back to recovering and returns its id.
    pub fn begin_resume(&mut self, now: DateTime<Utc>) -> Result<String, AgentError> {
        let status = self.status();
        if !matches!(status, TaskStatus::Failed | TaskStatus::Paused) {
            return Err(AgentError::invalid_state(format!(
                "cannot resume while {status}"
            )));
        }
        if status == TaskStatus::Failed
            && self.last_error.as_ref().is_some_and(|err| !err.recoverable)
        {
            return Err(AgentError::invalid_state(
                "last failure is not recoverable",
            ));
        }
        let Some(task) = self.task.as_mut() else {
            return Err(AgentError::invalid_state("no task to resume"));
        };
        let Some(task_id) = task.id.clone() else {
            return Err(AgentError::invalid_state("task was never accepted by the agent"));
        };
        task.touch(TaskStatus::Recovering, now);
        self.last_error = None;
        Ok(task_id)
    }

    /// Marks the current task failed. With no task only the error is kept.
    pub fn fail(&mut self, error: AgentError, now: DateTime<Utc>) {
        self.pending = None;
        if let Some(task) = self.task.as_mut() {
            task.touch(TaskStatus::Failed, now);
        }
        self.last_error = Some(error);
    }

    fn complete(&mut self, summary: Option<String>, now: DateTime<Utc>) {
        self.pending = None;
        if let Some(task) = self.task.as_mut() {
            if summary.is_some() {
                task.summary = summary;
            }
            task.touch(TaskStatus::Completed, now);
        }
    }

    pub fn push_notice(
        &mut self,
        id: String,
        message: String,
        level: NoticeLevel,
        now: DateTime<Utc>,
    ) -> Applied {
        self.prune_notices(now);
        // A replacement must be told apart from the notice it replaces.
        let created_at = match self.notices.iter().find(|notice| notice.id == id) {
            Some(previous) if previous.created_at >= now => {
                previous.created_at + chrono::Duration::nanoseconds(1)
            }
            _ => now,
        };
        self.notices.retain(|notice| notice.id != id);
        self.notices.push(TransientNotice {
            id: id.clone(),
            message,
            level,
            created_at,
        });
        Applied::Notice { id, created_at }
    }

    /// Drops notices older than the TTL. Returns how many were removed.
    pub fn prune_notices(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.notices.len();
        let ttl = self.notice_ttl;
        self.notices.retain(|notice| !notice.is_expired(now, ttl));
        before - self.notices.len()
    }

    pub fn dismiss_notice(&mut self, id: &str) -> bool {
        let before = self.notices.len();
        self.notices.retain(|notice| notice.id != id);
        self.notices.len() != before
    }

    /// Expiry path: removes the notice only if it is still the one created at
    /// `created_at`, not a later notice that reused the id.
    pub fn expire_notice(&mut self, id: &str, created_at: DateTime<Utc>) -> bool {
        let before = self.notices.len();
        self.notices
            .retain(|notice| notice.id != id || notice.created_at != created_at);
        self.notices.len() != before
    }
}

fn parse<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, AgentError> {
    envelope
        .payload()
        .map_err(|err| AgentError::protocol(err.to_string()))
}

/// Async front for the session: validates commands against [`SessionState`],
/// forwards them through the bridge and publishes every change.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    state: Mutex<SessionState>,
    bridge: Arc<dyn AgentBridge>,
    snapshots: watch::Sender<SessionSnapshot>,
    notice_ttl: Duration,
}

impl SessionController {
    pub fn new(bridge: Arc<dyn AgentBridge>, notice_ttl: Duration) -> Self {
        let state = SessionState::new(notice_ttl);
        let (snapshots, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(state),
                bridge,
                snapshots,
                notice_ttl,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub async fn start(&self, goal: &str, target_windows: Vec<i64>) -> Result<String, AgentError> {
        let windows = target_windows.clone();
        let token = self.update(|state| state.begin_start(goal, target_windows, Utc::now()))?;
        info!(event = "deck_task_start", goal, windows = ?windows);

        match self.inner.bridge.start(goal, &windows).await {
            Ok(task_id) => {
                if self.update(|state| state.start_accepted(token, &task_id, Utc::now())) {
                    info!(event = "deck_task_accepted", task_id = %task_id);
                    return Ok(task_id);
                }
                warn!(event = "deck_task_orphaned", task_id = %task_id);
                if let Err(err) = self.inner.bridge.stop(&task_id).await {
                    warn!(event = "deck_orphan_stop_failed", task_id = %task_id, error = %err);
                }
                Err(AgentError::invalid_state(
                    "task was stopped before the agent accepted it",
                ))
            }
            Err(err) => {
                let err = AgentError::from(err);
                warn!(event = "deck_task_start_failed", error = %err);
                self.update(|state| {
                    let awaiting_ack = state.start_seq == token
                        && state
                            .task()
                            .is_some_and(|task| task.id.is_none() && task.status.is_active());
                    if awaiting_ack {
                        state.fail(err.clone(), Utc::now());
                    }
                });
                Err(err)
            }
        }
    }

    /// Always lands in idle. A failed agent-side stop only leaves a warning.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let outcome = self.update(|state| state.stop());
        let StopOutcome::Stopped {
            task_id: Some(task_id),
        } = outcome
        else {
            return Ok(());
        };
        info!(event = "deck_task_stop", task_id = %task_id);
        if let Err(err) = self.inner.bridge.stop(&task_id).await {
            warn!(event = "deck_task_stop_failed", task_id = %task_id, error = %err);
            self.notify(
                format!("Agent did not confirm stop: {err}"),
                NoticeLevel::Warning,
            );
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AgentError> {
        let task_id = self.update(|state| state.begin_resume(Utc::now()))?;
        info!(event = "deck_task_resume", task_id = %task_id);
        if let Err(err) = self.inner.bridge.resume(&task_id).await {
            return Err(self.command_failed(err.into()));
        }
        Ok(())
    }

    pub async fn confirm(&self, action_id: &str, approved: bool) -> Result<(), AgentError> {
        let pending = self.update(|state| state.resolve_pending(action_id, approved, Utc::now()))?;
        let task_id = pending.task_id.unwrap_or_default();
        info!(event = "deck_action_resolved", task_id = %task_id, action_id, approved);
        if let Err(err) = self
            .inner
            .bridge
            .confirm_action(&task_id, action_id, approved)
            .await
        {
            return Err(self.command_failed(err.into()));
        }
        Ok(())
    }

    /// Session subscriber for the dispatcher.
    pub fn apply(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let applied = {
            let mut state = self.lock();
            let applied = state.apply(envelope, Utc::now())?;
            if applied != Applied::Ignored {
                self.inner.snapshots.send_replace(state.snapshot());
            }
            applied
        };
        if let Applied::Notice { id, created_at } = applied {
            self.schedule_expiry(id, created_at);
        }
        Ok(())
    }

    /// Fails the active task, e.g. when the link to the agent is lost for good.
    pub fn fail(&self, error: AgentError) {
        self.update(|state| {
            if state.status().is_active() {
                state.fail(error, Utc::now());
            }
        });
    }

    pub fn notify(&self, message: String, level: NoticeLevel) {
        let id = uuid::Uuid::new_v4().to_string();
        let applied = self.update(|state| state.push_notice(id, message, level, Utc::now()));
        if let Applied::Notice { id, created_at } = applied {
            self.schedule_expiry(id, created_at);
        }
    }

    pub fn dismiss_notice(&self, id: &str) -> bool {
        self.update(|state| state.dismiss_notice(id))
    }

    fn command_failed(&self, error: AgentError) -> AgentError {
        warn!(event = "deck_command_failed", kind = %error.kind, error = %error);
        self.update(|state| state.fail(error.clone(), Utc::now()));
        error
    }

    fn schedule_expiry(&self, id: String, created_at: DateTime<Utc>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(event = "deck_notice_expiry_skipped", notice = %id);
            return;
        };
        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let ttl = self.inner.notice_ttl;
        handle.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                SessionController { inner }.update(|state| state.expire_notice(&id, created_at));
            }
        });
    }

    /// Runs `f` under the lock and publishes the resulting snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.inner.snapshots.send_if_modified(|current| {
            let next = state.snapshot();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        result
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
