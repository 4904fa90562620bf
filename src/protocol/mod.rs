//! Hub wire format: JSON records terminated by the ASCII record separator.
//!
//! The server speaks the SignalR JSON hub protocol. Only the message types the
//! monitoring service actually sends are modelled; anything else decodes to
//! [`Frame::Other`] and is ignored by the dispatcher.

use crate::model::{Device, DeviceCommand, DeviceId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const TYPE_INVOCATION: u64 = 1;
pub const TYPE_COMPLETION: u64 = 3;
pub const TYPE_PING: u64 = 6;

pub const TARGET_EVENT_OBJECT: &str = "EventObject";
pub const TARGET_GET_DEVICES: &str = "GetDevices";
pub const TARGET_WATCH_DEVICE: &str = "WatchDevice";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame type is not numeric")]
    InvalidType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to the handshake record; carries no `type`.
    HandshakeAck { error: Option<String> },
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Other(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl Invocation {
    pub fn new(invocation_id: impl Into<String>, target: impl Into<String>, argument: Value) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments: vec![argument],
        }
    }

    pub fn get_devices(invocation_id: impl Into<String>) -> Self {
        Self::new(
            invocation_id,
            TARGET_GET_DEVICES,
            json!({ "registrations": true, "custom_fields": true, "possible_commands": true }),
        )
    }

    pub fn watch_devices(invocation_id: impl Into<String>, device_ids: &[DeviceId]) -> Self {
        Self::new(
            invocation_id,
            TARGET_WATCH_DEVICE,
            json!({ "device_ids": device_ids }),
        )
    }

    pub fn device_command(
        invocation_id: impl Into<String>,
        device_id: DeviceId,
        command: DeviceCommand,
    ) -> Self {
        Self::new(invocation_id, command.as_str(), json!({ "device_id": device_id }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Completion {
    /// Server-reported error text, if the completion carries a non-empty error.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct Typed<'a, T> {
    #[serde(rename = "type")]
    message_type: u64,
    #[serde(flatten)]
    body: &'a T,
}

pub fn handshake() -> String {
    terminate(json!({ "protocol": "json", "version": 1 }).to_string())
}

pub fn ping() -> String {
    terminate(json!({ "type": TYPE_PING }).to_string())
}

pub fn encode_invocation(invocation: &Invocation) -> Result<String, FrameError> {
    let body = serde_json::to_string(&Typed {
        message_type: TYPE_INVOCATION,
        body: invocation,
    })?;
    Ok(terminate(body))
}

fn terminate(mut body: String) -> String {
    body.push(RECORD_SEPARATOR);
    body
}

/// Splits a socket message into its records, dropping empty ones.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

pub fn decode_frame(record: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(record)?;
    let object = value.as_object().ok_or(FrameError::NotAnObject)?;

    let message_type = match object.get("type") {
        None => {
            let error = object
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Frame::HandshakeAck { error });
        }
        Some(raw) => raw.as_u64().ok_or(FrameError::InvalidType)?,
    };

    match message_type {
        TYPE_PING => Ok(Frame::Ping),
        TYPE_INVOCATION => Ok(Frame::Invocation(serde_json::from_value(value)?)),
        TYPE_COMPLETION => Ok(Frame::Completion(serde_json::from_value(value)?)),
        other => Ok(Frame::Other(other)),
    }
}

/// Extracts `(device_id, device_state)` from an `EventObject` argument list.
pub fn parse_device_event(arguments: &[Value]) -> Option<(DeviceId, Map<String, Value>)> {
    let event = arguments.first()?.as_object()?;
    let device_id = event.get("device_id")?.as_i64()?;
    let partial = event
        .get("device_state")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some((device_id, partial))
}

/// Reads the device directory out of a completion result (`data.devices`).
/// Returns `None` when the result carries no directory or an empty one.
pub fn parse_directory(result: &Value) -> Option<Vec<Device>> {
    let entries = result.get("data")?.get("devices")?.as_array()?;
    let devices: Vec<Device> = entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<Device>(entry.clone()) {
            Ok(device) => Some(device),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed directory entry");
                None
            }
        })
        .collect();
    (!devices.is_empty()).then_some(devices)
}
