//! Wire format of the duplex stream connection.
//!
//! Every frame is one JSON text message. The client sends `call` and
//! `cancel`; the runtime answers with `methodStarted`, `methodOutput`,
//! `error` and `methodDone`, all tagged with the call's correlation id.
//!
//! ```text
//! -> {"kind":"call","method":"SubscribeTopic","id":"SubscribeTopic-1f..","data":{..}}
//! <- {"kind":"methodStarted","id":"SubscribeTopic-1f..","method":"SubscribeTopic"}
//! <- {"kind":"methodOutput","id":"SubscribeTopic-1f..","data":{"messageId":1,"data":{..}}}
//! -> {"kind":"cancel","method":"SubscribeTopic","id":"SubscribeTopic-1f.."}
//! ```

use crate::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent from a client to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientFrame {
    Call {
        method: String,
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },
    Cancel {
        method: String,
        id: CorrelationId,
    },
}

impl ClientFrame {
    pub fn id(&self) -> &CorrelationId {
        match self {
            ClientFrame::Call { id, .. } | ClientFrame::Cancel { id, .. } => id,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, ClientFrame::Call { .. })
    }
}

/// Frame sent from the runtime to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerFrame {
    MethodStarted {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    MethodOutput {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        data: Value,
    },
    Error {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        data: Value,
    },
    MethodDone {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
}

impl ServerFrame {
    pub fn output(id: CorrelationId, method: &str, data: Value) -> Self {
        ServerFrame::MethodOutput {
            id,
            method: Some(method.to_string()),
            data,
        }
    }

    /// An `error` frame whose payload is a plain message string.
    pub fn error(id: CorrelationId, method: Option<&str>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            method: method.map(str::to_string),
            data: Value::String(message.into()),
        }
    }
}

/// Classification of an inbound frame as seen by the client.
///
/// Unknown kinds are kept rather than rejected; the connection manager treats
/// them as regular messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameKind {
    MethodStarted,
    MethodOutput,
    Error,
    MethodDone,
    #[serde(other)]
    Unknown,
}

/// Loosely parsed inbound frame used for demultiplexing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    pub id: CorrelationId,
    pub kind: FrameKind,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Parse a text frame from the socket.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// One message on a topic stream, carried in `methodOutput.data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    pub message_id: u64,
    #[serde(default)]
    pub data: Value,
}
