use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod protocol;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Queued,
    Thinking,
    Executing,
    Confirm,
    Paused,
    Recovering,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Queued => "queued",
            TaskStatus::Thinking => "thinking",
            TaskStatus::Executing => "executing",
            TaskStatus::Confirm => "confirm",
            TaskStatus::Paused => "paused",
            TaskStatus::Recovering => "recovering",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// A task is active while the agent may still emit lifecycle events for it.
    pub fn is_active(&self) -> bool {
        !matches!(self, TaskStatus::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(TaskStatus::Idle),
            "queued" => Ok(TaskStatus::Queued),
            "thinking" => Ok(TaskStatus::Thinking),
            "executing" => Ok(TaskStatus::Executing),
            "confirm" => Ok(TaskStatus::Confirm),
            "paused" => Ok(TaskStatus::Paused),
            "recovering" => Ok(TaskStatus::Recovering),
            "completed" | "complete" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl Default for NoticeLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl NoticeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "success",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    pub tool_calls: u32,
    #[serde(default)]
    pub current_window: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    /// Assigned by the agent once it accepts the start command.
    pub id: Option<String>,
    pub goal: String,
    pub target_windows: Vec<i64>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: ProgressSnapshot,
    #[serde(default)]
    pub last_tool: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn queued(goal: impl Into<String>, target_windows: Vec<i64>, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            goal: goal.into(),
            target_windows,
            status: TaskStatus::Queued,
            progress: ProgressSnapshot::default(),
            last_tool: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAction {
    pub action_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub task_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransientNotice {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub level: NoticeLevel,
    pub created_at: DateTime<Utc>,
}

impl TransientNotice {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.created_at) >= ttl
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    Transport,
    Timeout,
    Rejected,
    Agent,
    InvalidState,
    Protocol,
}

impl AgentErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentErrorKind::Transport => "transport",
            AgentErrorKind::Timeout => "timeout",
            AgentErrorKind::Rejected => "rejected",
            AgentErrorKind::Agent => "agent",
            AgentErrorKind::InvalidState => "invalid_state",
            AgentErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Command,
    Agent,
}

/// Failure surfaced to the UI as status text plus an optional retry affordance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub origin: ErrorOrigin,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    pub recoverable: bool,
}

impl AgentError {
    fn command(kind: AgentErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            origin: ErrorOrigin::Command,
            message: message.into(),
            code: None,
            recoverable,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::command(AgentErrorKind::Transport, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::command(AgentErrorKind::Timeout, message, true)
    }

    pub fn rejected(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            ..Self::command(AgentErrorKind::Rejected, message, false)
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::command(AgentErrorKind::InvalidState, message, true)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::command(AgentErrorKind::Protocol, message, false)
    }

    pub fn from_agent(message: impl Into<String>, code: Option<String>, recoverable: bool) -> Self {
        Self {
            kind: AgentErrorKind::Agent,
            origin: ErrorOrigin::Agent,
            message: message.into(),
            code,
            recoverable,
        }
    }
}
