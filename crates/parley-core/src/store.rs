//! Durable room and message store access.
//!
//! Rooms are created and listed by collaborators outside the relay; the
//! relay only checks existence, appends messages, and reads bounded
//! history windows.

use async_trait::async_trait;
use parley_protocol::MessageRecord;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// A durable chat room. Read-only from the relay's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Globally unique identifier, assigned at creation, never reused.
    pub room_id: String,
    /// Display name.
    pub name: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Store-assigned identifier, unique across all rooms.
    pub id: String,
    pub room_id: String,
    pub sender: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl From<ChatMessage> for MessageRecord {
    fn from(message: ChatMessage) -> Self {
        MessageRecord {
            id: message.id,
            room_id: message.room_id,
            sender: message.sender,
            content: message.content,
            timestamp: message.timestamp,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Access to the durable room/message store.
///
/// The message log is append-only: nothing in this interface mutates or
/// deletes a persisted message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Look up a room by id.
    async fn find_room(&self, room_id: &str) -> Result<Option<Room>>;

    /// Persist a message and return it with its store-assigned id.
    async fn append_message(
        &self,
        room_id: &str,
        sender: &str,
        content: &str,
        timestamp: i64,
    ) -> Result<ChatMessage>;

    /// The most recent messages for a room, newest first, at most
    /// `limit`. Callers reverse the window for client-facing backfill.
    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}
