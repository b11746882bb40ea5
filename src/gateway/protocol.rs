//! Wire protocol for the single `/ws` endpoint: a thin envelope around
//! dispatcher events, plus an ack-id convention for request/response pairs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound frame from the client. `ack_id`, when present, is echoed back
/// on the matching [`ServerFrame::Ack`] so the client can correlate its
/// promise/callback to the response.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "ackId", default)]
    pub ack_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "ackId")]
        ack_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "event")]
    Event { event: String, data: Value },
    #[serde(rename = "error")]
    Error { error: String },
}

impl ServerFrame {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        ServerFrame::Event {
            event: event.into(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({"type": "error", "error": "Failed to serialize frame"}).to_string()
        })
    }
}
