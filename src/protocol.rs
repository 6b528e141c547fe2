//! Client-facing channel protocol.
//!
//! Inbound frames are JSON objects tagged by `action`:
//!
//! ```json
//! {"action": "subscribe", "channel": "42"}
//! {"action": "unsubscribe", "channel": "42"}
//! {"action": "message", "body": "hello"}
//! ```
//!
//! Outbound frames are untagged JSON objects; clients tell them apart by
//! their fields (`type` is `"log"` or `"message"` where present).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::executor::CommandKind;

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Join a channel.
    Subscribe {
        #[serde(deserialize_with = "channel_name")]
        channel: String,
    },
    /// Leave a channel.
    Unsubscribe {
        #[serde(deserialize_with = "channel_name")]
        channel: String,
    },
    /// Free-form message relayed to the other members of the sender's channels.
    Message { body: Value },
}

impl InboundFrame {
    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Channels are project ids; accept them as JSON strings or integers.
fn channel_name<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => Ok(s),
        Raw::Number(n) => Ok(n.to_string()),
    }
}

/// One flushed line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFrame {
    pub message_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: CommandKind,
}

impl LogFrame {
    /// Creates a frame with a fresh message id.
    pub fn new(message: impl Into<String>, command: CommandKind) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message: message.into(),
            kind: "log",
            command,
        }
    }
}

/// Subscribe acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckFrame {
    pub message: String,
}

impl AckFrame {
    pub fn subscribed(channel: &str) -> Self {
        Self {
            message: format!("Subscribed to {channel}"),
        }
    }

    pub fn unsubscribed(channel: &str) -> Self {
        Self {
            message: format!("Unsubscribed from {channel}"),
        }
    }
}

/// A client message relayed to other connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayFrame {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl RelayFrame {
    /// Wraps an inbound body. String bodies are relayed verbatim, anything
    /// else as its JSON text.
    pub fn from_body(body: &Value) -> Self {
        let message = match body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            message,
            kind: "message",
        }
    }
}

/// Sent back when an inbound frame cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    pub error: String,
}

/// Any frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Log(LogFrame),
    Ack(AckFrame),
    Relay(RelayFrame),
    Error(ErrorFrame),
}

impl OutboundFrame {
    /// Serializes the frame as a JSON text message.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<LogFrame> for OutboundFrame {
    fn from(frame: LogFrame) -> Self {
        Self::Log(frame)
    }
}
