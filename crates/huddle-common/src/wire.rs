//! Relay wire protocol. Every frame is one JSON text message over the
//! WebSocket. Requests carry a `ref` that the relay echoes in its `ack` or
//! `error`; subscription events carry the client-chosen subscription id.

use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::store::DisconnectWrite;

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Put {
        #[serde(rename = "ref")]
        msg_ref: u64,
        key: Key,
        value: serde_json::Value,
    },
    Delete {
        #[serde(rename = "ref")]
        msg_ref: u64,
        key: Key,
    },
    Append {
        #[serde(rename = "ref")]
        msg_ref: u64,
        key: Key,
        value: serde_json::Value,
    },
    Subscribe {
        #[serde(rename = "ref")]
        msg_ref: u64,
        sub: u64,
        prefix: Key,
    },
    Unsubscribe {
        sub: u64,
    },
    OnDisconnect {
        #[serde(rename = "ref")]
        msg_ref: u64,
        key: Key,
        write: DisconnectWrite,
    },
    CancelOnDisconnect {
        #[serde(rename = "ref")]
        msg_ref: u64,
        key: Key,
    },
    Ping,
}

impl ClientFrame {
    /// The request ref, for frames that expect an acknowledgement.
    pub fn msg_ref(&self) -> Option<u64> {
        match self {
            Self::Put { msg_ref, .. }
            | Self::Delete { msg_ref, .. }
            | Self::Append { msg_ref, .. }
            | Self::Subscribe { msg_ref, .. }
            | Self::OnDisconnect { msg_ref, .. }
            | Self::CancelOnDisconnect { msg_ref, .. } => Some(*msg_ref),
            Self::Unsubscribe { .. } | Self::Ping => None,
        }
    }
}

/// Messages the relay sends back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Request succeeded. `key` is set for appends (the generated entry).
    Ack {
        #[serde(rename = "ref")]
        msg_ref: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Key>,
    },
    Error {
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        msg_ref: Option<u64>,
        message: String,
    },
    Added {
        sub: u64,
        key: Key,
        value: serde_json::Value,
    },
    Removed {
        sub: u64,
        key: Key,
    },
    Pong,
}
