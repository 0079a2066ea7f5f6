//! Wire frames for the real-time sync channel.
//!
//! Every frame is a [`WsEnvelope`] whose payload is flattened next to the
//! envelope metadata:
//!
//! ```json
//! {"id":"…","event":"subscribe","data":{"channel":"kpis","tenantId":"t1"},"ts":"…"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AckStatus, SessionIdentity, SyncResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    /// Wrap a payload with a fresh id and the current time.
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    Authenticate {
        user_id: String,
        tenant_id: String,
        email: String,
    },
    Subscribe {
        channel: String,
        tenant_id: String,
    },
    Unsubscribe {
        channel: String,
        tenant_id: String,
    },
    Update {
        #[serde(rename = "type")]
        message_type: String,
        payload: Value,
    },
}

impl ClientCommand {
    pub fn authenticate(identity: &SessionIdentity) -> Self {
        ClientCommand::Authenticate {
            user_id: identity.user_id.clone(),
            tenant_id: identity.tenant_id.clone(),
            email: identity.email.clone(),
        }
    }

    /// Channel named by a subscribe/unsubscribe command.
    pub fn channel(&self) -> Option<&str> {
        match self {
            ClientCommand::Subscribe { channel, .. } | ClientCommand::Unsubscribe { channel, .. } => {
                Some(channel)
            }
            _ => None,
        }
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Authenticated {
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Subscribed {
        channel: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unsubscribed {
        channel: String,
    },
    Update(UpdateEnvelope),
    Error {
        code: String,
        message: String,
    },
}

/// One inbound data push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub message_type: String,
    pub tenant_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Explicit target channel. Servers that set it bypass `message_type`
    /// derived routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

pub fn encode_frame<T: Serialize>(frame: &WsEnvelope<T>) -> SyncResult<String> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_frame<T: for<'de> Deserialize<'de>>(text: &str) -> SyncResult<WsEnvelope<T>> {
    Ok(serde_json::from_str(text)?)
}
