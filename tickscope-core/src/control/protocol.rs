//! Control protocol messages.
//!
//! Every message is a JSON object with a `type` and an optional
//! `request_id`; all other fields ride alongside at the top level.

use crate::error::{Error, Result};
use crate::types::{CaptureRecord, CaptureSource, ComponentNode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Close code for protocol violations.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4000;
/// Close code for a second display without takeover.
pub const CLOSE_DISPLAY_BUSY: u16 = 4001;
/// Close code sent to a display displaced by a takeover.
pub const CLOSE_DISPLAY_REPLACED: u16 = 4002;

/// Largest accepted inbound message.
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Commands that query the display and need an immediate answer.
pub const RESPONSE_REQUIRED: &[&str] = &[
    "get_state",
    "get_display_snapshot",
    "get_series_window",
    "get_metric_coverage",
    "get_selection",
    "get_window",
];

/// Commands buffered while no display is connected.
pub const QUEUEABLE: &[&str] = &[
    "set_playback",
    "play",
    "pause",
    "seek",
    "set_speed",
    "select_capture",
    "select_metrics",
    "clear_selection",
    "set_window",
    "clear_window",
    "add_annotation",
    "remove_annotation",
    "clear_annotations",
    "set_view",
    "focus_entity",
];

/// Capture lifecycle messages.
pub const CAPTURE_STREAM: &[&str] = &[
    "capture_init",
    "capture_components",
    "capture_append",
    "capture_tick",
    "capture_end",
];

/// Commands answered by the server itself.
pub const SERVER_COMMANDS: &[&str] = &[
    "live_start",
    "live_stop",
    "live_list",
    "list_captures",
    "remove_capture",
    "clear_state",
    "define_group",
    "derive_start",
    "derive_stop",
    "derive_list",
    "list_plugins",
    "get_series",
];

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Display,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Display => "display",
            Role::Agent => "agent",
        }
    }
}

/// How the channel treats a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    ResponseRequired,
    Queueable,
    CaptureStream,
    Server,
    Unknown,
}

pub fn classify(kind: &str) -> CommandClass {
    if RESPONSE_REQUIRED.contains(&kind) {
        CommandClass::ResponseRequired
    } else if QUEUEABLE.contains(&kind) {
        CommandClass::Queueable
    } else if CAPTURE_STREAM.contains(&kind) {
        CommandClass::CaptureStream
    } else if SERVER_COMMANDS.contains(&kind) {
        CommandClass::Server
    } else {
        CommandClass::Unknown
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            request_id: None,
            body: Map::new(),
        }
    }

    /// Parse inbound text. The message must be an object with a non-empty `type`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("message is not valid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(Error::Protocol("message must be a JSON object".to_string()));
        }
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
        if envelope.kind.trim().is_empty() {
            return Err(Error::Protocol("message type is empty".to_string()));
        }
        Ok(envelope)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.to_string(), value);
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("{} requires '{}'", self.kind, key)))
    }

    /// Deserialize the body (without `type`/`request_id`) into a typed request.
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| Error::InvalidRequest(format!("{}: {}", self.kind, e)))
    }

    pub fn capture_id(&self) -> Option<&str> {
        self.get_str("capture_id")
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error":"failed to encode message"}"#.to_string()
        })
    }

    /// `{type:"error", error, request_id?}`
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        Envelope::new("error")
            .with("error", message.into())
            .with_request_id(request_id)
    }

    /// `{type:"ack", command, queued, request_id?}`
    pub fn ack(command: &Envelope, queued: bool) -> Self {
        Envelope::new("ack")
            .with("command", &command.kind)
            .with("queued", queued)
            .with_request_id(command.request_id.clone())
    }

    /// `{type:"<kind>_result", ...result, request_id?}`
    pub fn result(command: &Envelope, result: Value) -> Self {
        let mut envelope =
            Envelope::new(&format!("{}_result", command.kind)).with_request_id(command.request_id.clone());
        match result {
            Value::Object(map) => envelope.body.extend(map),
            other => envelope.set("result", other),
        }
        envelope
    }
}

/// Registration payload, the first message of every session.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub role: Role,
    #[serde(default)]
    pub takeover: bool,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl RegisterRequest {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        if envelope.kind != "register" {
            return Err(Error::Protocol(format!(
                "expected register, got {}",
                envelope.kind
            )));
        }
        envelope
            .body_as()
            .map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// What a session's writer should send next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

// ============================================
// Capture lifecycle builders
// ============================================

pub fn capture_init(source: &CaptureSource, reset: bool) -> Envelope {
    Envelope::new("capture_init")
        .with("capture_id", &source.capture_id)
        .with("name", &source.display_name)
        .with("locator", &source.locator)
        .with("mode", source.stream_mode)
        .with("origin", source.origin)
        .with("reset", reset)
}

pub fn capture_components(capture_id: &str, nodes: &[ComponentNode]) -> Envelope {
    Envelope::new("capture_components")
        .with("capture_id", capture_id)
        .with("components", nodes)
}

pub fn capture_append(capture_id: &str, frames: &[CaptureRecord]) -> Envelope {
    Envelope::new("capture_append")
        .with("capture_id", capture_id)
        .with("frames", frames)
}

pub fn capture_tick(capture_id: &str, tick: u64) -> Envelope {
    Envelope::new("capture_tick")
        .with("capture_id", capture_id)
        .with("tick", tick)
}

pub fn capture_end(capture_id: &str, reason: &str, last_tick: Option<u64>) -> Envelope {
    Envelope::new("capture_end")
        .with("capture_id", capture_id)
        .with("reason", reason)
        .with("last_tick", last_tick)
}

pub fn capture_removed(capture_id: &str) -> Envelope {
    Envelope::new("capture_removed").with("capture_id", capture_id)
}
