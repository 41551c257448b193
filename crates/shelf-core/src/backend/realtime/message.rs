//! Realtime protocol message types
//!
//! Phoenix channel frames exchanged with the hosted realtime service, JSON
//! encoded (`vsn=1.0.0`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::feed::{ChangeEvent, DeletedRecord};
use crate::error::{StoreError, StoreResult};
use crate::models::{Bookmark, BookmarkId, UserId};

/// Topic used for protocol-level heartbeats
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Channel topic for bookmark changes
pub const BOOKMARKS_TOPIC: &str = "realtime:bookmarks-changes";

/// Reference of the join frame; its reply confirms the subscription
pub const JOIN_REF: &str = "1";

/// One Phoenix frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    /// Join the bookmarks channel with postgres change bindings for one owner
    ///
    /// Inserts and updates are filtered server-side by `user_id`. Deletes
    /// cannot be: the old row of a delete only carries the primary key.
    pub fn join(owner: &UserId, access_token: Option<&str>) -> Self {
        let owner_filter = format!("user_id=eq.{}", owner);
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": "bookmarks", "filter": owner_filter },
                    { "event": "UPDATE", "schema": "public", "table": "bookmarks", "filter": owner_filter },
                    { "event": "DELETE", "schema": "public", "table": "bookmarks" }
                ]
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }

        Self {
            topic: BOOKMARKS_TOPIC.to_string(),
            event: "phx_join".to_string(),
            payload,
            reference: Some(JOIN_REF.to_string()),
            join_ref: Some(JOIN_REF.to_string()),
        }
    }

    /// Leave the bookmarks channel
    pub fn leave(reference: u64) -> Self {
        Self {
            topic: BOOKMARKS_TOPIC.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(JOIN_REF.to_string()),
        }
    }

    /// Keep-alive frame
    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn encode(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Classify an incoming frame
    pub fn into_server_message(self) -> StoreResult<ServerMessage> {
        match self.event.as_str() {
            "phx_reply" => {
                let status = self
                    .payload
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string();
                Ok(ServerMessage::Reply {
                    reference: self.reference,
                    ok: status == "ok",
                    response: self.payload.get("response").cloned().unwrap_or(Value::Null),
                })
            }
            "postgres_changes" => decode_change(self.payload).map(ServerMessage::Change),
            "phx_error" | "phx_close" => Ok(ServerMessage::ChannelClosed(self.event)),
            "system" => {
                let failed = self.payload.get("status").and_then(Value::as_str) == Some("error");
                let message = self
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ServerMessage::System { failed, message })
            }
            _ => Ok(ServerMessage::Other),
        }
    }
}

/// Frames the feed reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Reply to a frame we sent
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    /// Row change on the bookmarks table
    Change(ChangeEvent),
    /// Server closed or crashed the channel
    ChannelClosed(String),
    /// Realtime system notice (subscription status)
    System { failed: bool, message: String },
    /// Presence, broadcast and other frames we do not use
    Other,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// Old row of a delete: primary key, owner only with full replica identity
#[derive(Debug, Deserialize)]
struct DeletedRow {
    id: BookmarkId,
    #[serde(default)]
    user_id: Option<UserId>,
}

fn decode_change(payload: Value) -> StoreResult<ChangeEvent> {
    let payload: ChangePayload = serde_json::from_value(payload)?;
    let data = payload.data;

    let row = |value: Option<Value>| -> StoreResult<Bookmark> {
        let value = value.ok_or_else(|| StoreError::Decode("change without record".to_string()))?;
        Ok(serde_json::from_value(value)?)
    };

    match data.kind.as_str() {
        "INSERT" => Ok(ChangeEvent::Insert(row(data.record)?)),
        "UPDATE" => Ok(ChangeEvent::Update(row(data.record)?)),
        "DELETE" => {
            let old = data
                .old_record
                .ok_or_else(|| StoreError::Decode("delete without old_record".to_string()))?;
            let deleted: DeletedRow = serde_json::from_value(old)?;
            Ok(ChangeEvent::Delete(DeletedRecord {
                id: deleted.id,
                owner_id: deleted.user_id,
            }))
        }
        other => Err(StoreError::Decode(format!("unknown change type '{}'", other))),
    }
}
