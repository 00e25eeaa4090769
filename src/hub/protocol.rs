// JSON hub protocol
// A handshake record followed by 0x1E-terminated JSON records, each tagged with an integer `type`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ClientError, Result};

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

/// Most unterminated text a [`RecordBuffer`] holds before giving up on the peer.
pub const MAX_PENDING_RECORD: usize = 1024 * 1024;

// Record type tags
const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

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
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Argument at `index`, with a missing trailing argument read as `null`.
    pub fn argument(&self, index: usize) -> &Value {
        self.arguments.get(index).unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Close(CloseInfo),
    /// Streaming and cancellation records; this client never asks for them.
    Unsupported(u64),
}

impl HubMessage {
    /// Serialize into a single record, separator included.
    pub fn encode(&self) -> Result<String> {
        let mut value = match self {
            HubMessage::Invocation(invocation) => serde_json::to_value(invocation)?,
            HubMessage::Completion(completion) => serde_json::to_value(completion)?,
            HubMessage::Ping => json!({}),
            HubMessage::Close(info) => serde_json::to_value(info)?,
            HubMessage::Unsupported(kind) => {
                return Err(ClientError::Protocol(format!("cannot encode record type {}", kind)))
            }
        };
        let kind = match self {
            HubMessage::Invocation(_) => TYPE_INVOCATION,
            HubMessage::Completion(_) => TYPE_COMPLETION,
            HubMessage::Ping => TYPE_PING,
            HubMessage::Close(_) => TYPE_CLOSE,
            HubMessage::Unsupported(kind) => *kind,
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), json!(kind));
        }
        let mut record = serde_json::to_string(&value)?;
        record.push(RECORD_SEPARATOR);
        Ok(record)
    }

    /// Parse one record (without its separator).
    pub fn decode(record: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(record)
            .map_err(|e| ClientError::Protocol(format!("malformed record: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Protocol("record without a numeric type".to_string()))?;

        let message = match kind {
            TYPE_INVOCATION => HubMessage::Invocation(from_record(value)?),
            TYPE_COMPLETION => HubMessage::Completion(from_record(value)?),
            TYPE_PING => HubMessage::Ping,
            TYPE_CLOSE => HubMessage::Close(from_record(value)?),
            other => HubMessage::Unsupported(other),
        };
        Ok(message)
    }
}

fn from_record<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ClientError::Protocol(format!("invalid record: {}", e)))
}

pub fn handshake_request() -> String {
    let mut record = json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION }).to_string();
    record.push(RECORD_SEPARATOR);
    record
}

/// An empty object accepts the handshake; `{"error": ...}` rejects it.
pub fn parse_handshake_response(record: &str) -> Result<()> {
    let value: Value = serde_json::from_str(record)
        .map_err(|e| ClientError::Handshake(format!("malformed handshake response: {}", e)))?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(ClientError::Handshake(error.to_string())),
        None => Ok(()),
    }
}

/// Accumulates text frames and yields complete records. A record may span
/// frames and a frame may carry several records.
#[derive(Debug)]
pub struct RecordBuffer {
    pending: String,
    limit: usize,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_RECORD)
    }
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: String::new(),
            limit,
        }
    }

    /// Fails once more than `limit` bytes are waiting for a separator; the
    /// buffered text is discarded.
    pub fn push(&mut self, frame: &str) -> Result<Vec<String>> {
        self.pending.push_str(frame);
        let mut records = Vec::new();
        while let Some(end) = self.pending.find(RECORD_SEPARATOR) {
            let record: String = self.pending.drain(..end + RECORD_SEPARATOR.len_utf8()).collect();
            let record = record.trim_end_matches(RECORD_SEPARATOR);
            if !record.trim().is_empty() {
                records.push(record.to_string());
            }
        }
        if self.pending.len() > self.limit {
            let buffered = self.pending.len();
            self.pending.clear();
            return Err(ClientError::Protocol(format!(
                "{} bytes without a record separator",
                buffered
            )));
        }
        Ok(records)
    }
}
