use crate::{NoticeLevel, RiskLevel, TaskStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Closed vocabulary of envelope types understood by both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ping,
    Pong,
    Status,
    Progress,
    Confirm,
    Error,
    Complete,
    Tool,
    Toast,
    CursorMove,
    CursorClick,
    CursorType,
    CursorStopType,
    Highlight,
    HighlightHide,
    ScreenGlow,
    ScreenGlowStop,
    ScreenPulse,
    Command,
    CommandResult,
}

impl MessageKind {
    pub const ALL: [MessageKind; 20] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Status,
        MessageKind::Progress,
        MessageKind::Confirm,
        MessageKind::Error,
        MessageKind::Complete,
        MessageKind::Tool,
        MessageKind::Toast,
        MessageKind::CursorMove,
        MessageKind::CursorClick,
        MessageKind::CursorType,
        MessageKind::CursorStopType,
        MessageKind::Highlight,
        MessageKind::HighlightHide,
        MessageKind::ScreenGlow,
        MessageKind::ScreenGlowStop,
        MessageKind::ScreenPulse,
        MessageKind::Command,
        MessageKind::CommandResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Status => "status",
            MessageKind::Progress => "progress",
            MessageKind::Confirm => "confirm",
            MessageKind::Error => "error",
            MessageKind::Complete => "complete",
            MessageKind::Tool => "tool",
            MessageKind::Toast => "toast",
            MessageKind::CursorMove => "cursor_move",
            MessageKind::CursorClick => "cursor_click",
            MessageKind::CursorType => "cursor_type",
            MessageKind::CursorStopType => "cursor_stop_type",
            MessageKind::Highlight => "highlight",
            MessageKind::HighlightHide => "highlight_hide",
            MessageKind::ScreenGlow => "screen_glow",
            MessageKind::ScreenGlowStop => "screen_glow_stop",
            MessageKind::ScreenPulse => "screen_pulse",
            MessageKind::Command => "command",
            MessageKind::CommandResult => "command_result",
        }
    }

    /// Heartbeat traffic never leaves the transport.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong)
    }

    pub fn is_overlay(&self) -> bool {
        matches!(
            self,
            MessageKind::CursorMove
                | MessageKind::CursorClick
                | MessageKind::CursorType
                | MessageKind::CursorStopType
                | MessageKind::Highlight
                | MessageKind::HighlightHide
                | MessageKind::ScreenGlow
                | MessageKind::ScreenGlowStop
                | MessageKind::ScreenPulse
        )
    }

    /// Kinds that drive the task lifecycle and are ignored once a task is no longer active.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            MessageKind::Status
                | MessageKind::Progress
                | MessageKind::Confirm
                | MessageKind::Error
                | MessageKind::Complete
                | MessageKind::Tool
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim();
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown message type: {normalized}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
        }
    }

    pub fn with_payload<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, FrameError> {
        let data =
            serde_json::to_value(payload).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(Self::new(kind, data))
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Null)
    }

    /// `None` for types outside the vocabulary.
    pub fn message_kind(&self) -> Option<MessageKind> {
        self.kind.parse().ok()
    }

    pub fn is(&self, kind: MessageKind) -> bool {
        self.kind == kind.as_str()
    }

    /// Absent `data` reads as an empty object so all-default payloads still parse.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        let data = if self.data.is_null() {
            Value::Object(Default::default())
        } else {
            self.data.clone()
        };
        serde_json::from_value(data).map_err(|err| FrameError::Payload {
            kind: self.kind.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Partial progress update; absent fields keep their previous value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    #[serde(default)]
    pub iteration: Option<u32>,
    #[serde(default, alias = "max_iterations")]
    pub max_iterations: Option<u32>,
    #[serde(default, alias = "tool_calls")]
    pub tool_calls: Option<u32>,
    #[serde(default, alias = "current_window")]
    pub current_window: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPayload {
    #[serde(alias = "action_id", alias = "id")]
    pub action_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk: RiskLevel,
}

fn default_recoverable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletePayload {
    #[serde(default, alias = "result", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolPayload {
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub level: NoticeLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Start,
    Stop,
    Resume,
    ConfirmAction,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Start => "start",
            CommandName::Stop => "stop",
            CommandName::Resume => "resume",
            CommandName::ConfirmAction => "confirm_action",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    #[serde(alias = "request_id")]
    pub request_id: String,
    pub command: CommandName,
    #[serde(default, alias = "task_id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Accepted,
    Rejected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    #[serde(alias = "request_id")]
    pub request_id: String,
    #[serde(default)]
    pub command: Option<String>,
    pub status: CommandStatus,
    #[serde(default, alias = "task_id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("no newline within {max} bytes ({size} buffered); line dropped")]
    Unterminated { size: usize, max: usize },
    #[error("cannot encode envelope: {0}")]
    Encode(String),
    #[error("invalid JSON frame: {0}")]
    Json(String),
    #[error("batch element {index} invalid: {reason}")]
    BatchElement { index: usize, reason: String },
    #[error("payload for '{kind}' invalid: {reason}")]
    Payload { kind: String, reason: String },
}

/// Envelopes decoded from one frame plus whatever was rejected on the way.
#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub envelopes: Vec<Envelope>,
    pub errors: Vec<FrameError>,
}

pub fn encode_envelope(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    encode_value(envelope, max_frame_bytes)
}

/// Encodes several envelopes as one array frame.
pub fn encode_batch(envelopes: &[Envelope], max_frame_bytes: usize) -> Result<String, FrameError> {
    encode_value(&envelopes, max_frame_bytes)
}

fn encode_value<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes one frame into envelopes.
///
/// An object frame yields one envelope; an array frame is a batch whose
/// elements decode independently, so a malformed element is reported while
/// its siblings still come through in order.
pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> DecodeReport {
    let mut report = DecodeReport::default();
    let raw = trim_frame(bytes);
    if raw.is_empty() {
        return report;
    }
    if raw.len() > max_frame_bytes {
        report.errors.push(FrameError::TooLarge {
            size: raw.len(),
            max: max_frame_bytes,
        });
        return report;
    }

    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            report.errors.push(FrameError::Json(err.to_string()));
            return report;
        }
    };

    match value {
        Value::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                match serde_json::from_value::<Envelope>(item) {
                    Ok(envelope) => report.envelopes.push(envelope),
                    Err(err) => report.errors.push(FrameError::BatchElement {
                        index,
                        reason: err.to_string(),
                    }),
                }
            }
        }
        other => match serde_json::from_value::<Envelope>(other) {
            Ok(envelope) => report.envelopes.push(envelope),
            Err(err) => report.errors.push(FrameError::Json(err.to_string())),
        },
    }
    report
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    bytes.trim_ascii()
}

/// Cuts a byte stream into newline-terminated lines for [`decode_frame`].
///
/// Blank lines are skipped. A line that grows past the limit without a
/// newline is reported once and discarded up to its terminating newline.
#[derive(Debug)]
pub struct LineFramer {
    max_line_bytes: usize,
    buf: Vec<u8>,
    scanned: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            buf: Vec::new(),
            scanned: 0,
            discarding: false,
        }
    }

    /// Appends `chunk` and returns every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|byte| *byte == b'\n') {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else if let Some(line) = self.line(&self.buf[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if !self.discarding && self.buf.len() > self.max_line_bytes {
            lines.push(Err(FrameError::Unterminated {
                size: self.buf.len(),
                max: self.max_line_bytes,
            }));
            self.discarding = true;
        }
        if self.discarding {
            self.buf.clear();
            self.scanned = 0;
        }
        lines
    }

    /// Hands out the unterminated tail once the stream has ended.
    pub fn flush(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        let tail = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if std::mem::replace(&mut self.discarding, false) {
            return None;
        }
        self.line(&tail)
    }

    fn line(&self, raw: &[u8]) -> Option<Result<Vec<u8>, FrameError>> {
        let line = trim_frame(raw);
        if line.is_empty() {
            return None;
        }
        if line.len() > self.max_line_bytes {
            return Some(Err(FrameError::TooLarge {
                size: line.len(),
                max: self.max_line_bytes,
            }));
        }
        Some(Ok(line.to_vec()))
    }
}
