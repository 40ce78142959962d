//! Frame types for the Parley relay protocol.
//!
//! Frames are the fundamental unit of communication between clients and
//! the relay. Each frame is a JSON object tagged by its `type` field,
//! with camelCase field names on the wire.

use serde::{Deserialize, Serialize};

/// All frame type tags the relay understands, client-bound and server-bound.
pub const FRAME_TYPES: &[&str] = &[
    "AUTH",
    "AUTH_SUCCESS",
    "JOIN",
    "JOIN_SUCCESS",
    "LEAVE",
    "LEAVE_SUCCESS",
    "MESSAGE",
    "NEW_MESSAGE",
    "MESSAGE_HISTORY",
    "ERROR",
];

/// A chat message as it appears on the wire.
///
/// `id` is assigned by the durable store when the message is persisted;
/// clients deduplicate on it because the same message may arrive both in
/// a `MESSAGE_HISTORY` backfill and as a live `NEW_MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Store-assigned message identifier.
    pub id: String,
    /// Room the message belongs to.
    pub room_id: String,
    /// Username of the sender.
    pub sender: String,
    /// Message body.
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A protocol frame.
///
/// Client-bound and server-bound frames share one enum; the gateway
/// rejects frames arriving in the wrong direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Authenticate the connection with a bearer token.
    #[serde(rename = "AUTH")]
    Auth {
        /// Opaque bearer token.
        token: String,
    },

    /// Authentication succeeded.
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess {
        /// Identity the token resolved to.
        username: String,
    },

    /// Join a room.
    #[serde(rename = "JOIN", rename_all = "camelCase")]
    Join {
        /// Room to join.
        room_id: String,
    },

    /// Room joined; a `MESSAGE_HISTORY` frame follows.
    #[serde(rename = "JOIN_SUCCESS", rename_all = "camelCase")]
    JoinSuccess {
        room_id: String,
        room_name: String,
    },

    /// Leave a room. Idempotent.
    #[serde(rename = "LEAVE", rename_all = "camelCase")]
    Leave {
        room_id: String,
    },

    /// Room left (or was never joined).
    #[serde(rename = "LEAVE_SUCCESS", rename_all = "camelCase")]
    LeaveSuccess {
        room_id: String,
    },

    /// Send a message to a room. Delivery back to the sender happens
    /// only through the fan-out path, never as a direct echo.
    #[serde(rename = "MESSAGE", rename_all = "camelCase")]
    Message {
        room_id: String,
        content: String,
    },

    /// A message fanned out to every subscriber of its room.
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage(MessageRecord),

    /// Bounded window of historical messages, oldest first.
    #[serde(rename = "MESSAGE_HISTORY", rename_all = "camelCase")]
    MessageHistory {
        room_id: String,
        messages: Vec<MessageRecord>,
    },

    /// Error response. The connection stays open unless the error was
    /// an authentication failure or a transport-level fault.
    #[serde(rename = "ERROR")]
    Error {
        message: String,
    },
}

impl Frame {
    /// Get the frame's wire tag.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "AUTH",
            Frame::AuthSuccess { .. } => "AUTH_SUCCESS",
            Frame::Join { .. } => "JOIN",
            Frame::JoinSuccess { .. } => "JOIN_SUCCESS",
            Frame::Leave { .. } => "LEAVE",
            Frame::LeaveSuccess { .. } => "LEAVE_SUCCESS",
            Frame::Message { .. } => "MESSAGE",
            Frame::NewMessage(_) => "NEW_MESSAGE",
            Frame::MessageHistory { .. } => "MESSAGE_HISTORY",
            Frame::Error { .. } => "ERROR",
        }
    }

    /// Create a new Auth frame.
    #[must_use]
    pub fn auth(token: impl Into<String>) -> Self {
        Frame::Auth {
            token: token.into(),
        }
    }

    /// Create a new AuthSuccess frame.
    #[must_use]
    pub fn auth_success(username: impl Into<String>) -> Self {
        Frame::AuthSuccess {
            username: username.into(),
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(room_id: impl Into<String>) -> Self {
        Frame::Join {
            room_id: room_id.into(),
        }
    }

    /// Create a new JoinSuccess frame.
    #[must_use]
    pub fn join_success(room_id: impl Into<String>, room_name: impl Into<String>) -> Self {
        Frame::JoinSuccess {
            room_id: room_id.into(),
            room_name: room_name.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(room_id: impl Into<String>) -> Self {
        Frame::Leave {
            room_id: room_id.into(),
        }
    }

    /// Create a new LeaveSuccess frame.
    #[must_use]
    pub fn leave_success(room_id: impl Into<String>) -> Self {
        Frame::LeaveSuccess {
            room_id: room_id.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Message {
            room_id: room_id.into(),
            content: content.into(),
        }
    }

    /// Create a new MessageHistory frame.
    #[must_use]
    pub fn message_history(room_id: impl Into<String>, messages: Vec<MessageRecord>) -> Self {
        Frame::MessageHistory {
            room_id: room_id.into(),
            messages,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::auth("t").frame_type(), "AUTH");
        assert_eq!(Frame::join("r1").frame_type(), "JOIN");
        assert_eq!(Frame::error("boom").frame_type(), "ERROR");
    }

    #[test]
    fn test_wire_field_names() {
        let frame = Frame::join_success("room-1", "general");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "JOIN_SUCCESS",
                "roomId": "room-1",
                "roomName": "general",
            })
        );
    }

    #[test]
    fn test_new_message_is_flat() {
        let frame = Frame::NewMessage(MessageRecord {
            id: "abc123".into(),
            room_id: "room-1".into(),
            sender: "alice".into(),
            content: "hi".into(),
            timestamp: 1_700_000_000_000,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "NEW_MESSAGE",
                "id": "abc123",
                "roomId": "room-1",
                "sender": "alice",
                "content": "hi",
                "timestamp": 1_700_000_000_000_i64,
            })
        );
    }

    #[test]
    fn test_parse_client_auth() {
        let frame: Frame = serde_json::from_str(r#"{"type":"AUTH","token":"t1"}"#).unwrap();
        assert_eq!(frame, Frame::auth("t1"));
    }

    #[test]
    fn test_every_tag_is_listed() {
        let frames = [
            Frame::auth("t"),
            Frame::auth_success("alice"),
            Frame::join("r"),
            Frame::join_success("r", "n"),
            Frame::leave("r"),
            Frame::leave_success("r"),
            Frame::message("r", "c"),
            Frame::NewMessage(MessageRecord {
                id: "i".into(),
                room_id: "r".into(),
                sender: "s".into(),
                content: "c".into(),
                timestamp: 0,
            }),
            Frame::message_history("r", vec![]),
            Frame::error("e"),
        ];
        for frame in frames {
            assert!(FRAME_TYPES.contains(&frame.frame_type()));
        }
    }
}
