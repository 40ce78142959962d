//! MongoDB implementation of the message store.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, DateTime};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RelayError, Result};
use crate::store::{ChatMessage, MessageStore, Room};

const ROOMS_COLLECTION: &str = "rooms";
const MESSAGES_COLLECTION: &str = "messages";

#[derive(Debug, Serialize, Deserialize)]
struct RoomDoc {
    room_id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    created_at: DateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    room_id: String,
    sender: String,
    content: String,
    timestamp: DateTime,
}

impl From<RoomDoc> for Room {
    fn from(doc: RoomDoc) -> Self {
        Room {
            room_id: doc.room_id,
            name: doc.name,
            description: doc.description,
            created_by: doc.created_by,
            created_at: doc.created_at.timestamp_millis(),
        }
    }
}

impl From<MessageDoc> for ChatMessage {
    fn from(doc: MessageDoc) -> Self {
        ChatMessage {
            id: doc.id.map(|id| id.to_hex()).unwrap_or_default(),
            room_id: doc.room_id,
            sender: doc.sender,
            content: doc.content,
            timestamp: doc.timestamp.timestamp_millis(),
        }
    }
}

fn store_error(err: mongodb::error::Error) -> RelayError {
    RelayError::StoreUnavailable(err.to_string())
}

/// MongoDB-backed store with a room collection and an append-only,
/// room-indexed message log.
pub struct MongoStore {
    rooms: Collection<RoomDoc>,
    messages: Collection<MessageDoc>,
}

impl MongoStore {
    /// Connect to MongoDB and prepare collections and indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or index creation
    /// fails.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await.map_err(store_error)?;
        let store = Self::new(&client, database);
        store.init().await?;

        info!(database = %database, "Connected to MongoDB");
        Ok(store)
    }

    /// Build a store over an existing client.
    #[must_use]
    pub fn new(client: &Client, database: &str) -> Self {
        let db = client.database(database);
        Self {
            rooms: db.collection(ROOMS_COLLECTION),
            messages: db.collection(MESSAGES_COLLECTION),
        }
    }

    /// Initialize indexes for the history and existence-check queries.
    async fn init(&self) -> Result<()> {
        let unique_room = IndexModel::builder()
            .keys(doc! { "room_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.rooms.create_index(unique_room).await.map_err(store_error)?;

        // History reads filter on room_id and sort on timestamp.
        let history_index = IndexModel::builder()
            .keys(doc! { "room_id": 1, "timestamp": -1 })
            .build();
        self.messages
            .create_index(history_index)
            .await
            .map_err(store_error)?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for MongoStore {
    async fn find_room(&self, room_id: &str) -> Result<Option<Room>> {
        let doc = self
            .rooms
            .find_one(doc! { "room_id": room_id })
            .await
            .map_err(store_error)?;

        Ok(doc.map(Room::from))
    }

    async fn append_message(
        &self,
        room_id: &str,
        sender: &str,
        content: &str,
        timestamp: i64,
    ) -> Result<ChatMessage> {
        let doc = MessageDoc {
            id: None,
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: DateTime::from_millis(timestamp),
        };

        let inserted = self.messages.insert_one(&doc).await.map_err(store_error)?;
        let id = inserted
            .inserted_id
            .as_object_id()
            .map(|id| id.to_hex())
            .ok_or_else(|| {
                RelayError::StoreUnavailable("store returned a non-ObjectId message id".into())
            })?;

        Ok(ChatMessage {
            id,
            room_id: doc.room_id,
            sender: doc.sender,
            content: doc.content,
            timestamp,
        })
    }

    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let options = FindOptions::builder()
            .sort(doc! { "timestamp": -1 })
            .limit(limit as i64)
            .build();

        let cursor = self
            .messages
            .find(doc! { "room_id": room_id })
            .with_options(options)
            .await
            .map_err(store_error)?;

        let docs: Vec<MessageDoc> = cursor.try_collect().await.map_err(store_error)?;
        Ok(docs.into_iter().map(ChatMessage::from).collect())
    }
}
