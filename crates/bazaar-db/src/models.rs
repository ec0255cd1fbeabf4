//! Database row types — these map directly to SQLite rows.
//! Distinct from the bazaar-types API models to keep the DB layer independent;
//! ids and timestamps stay TEXT until the conversion to a response DTO.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use bazaar_types::api::{ChatResponse, MessageResponse};
use bazaar_types::models::ListingRef;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    pub banned: bool,
    pub created_at: String,
}

#[derive(Debug)]
pub struct ChatRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub product_id: Option<String>,
    pub accommodation_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: String,
}

/// A chat annotated for the thread list: the counterpart's identity and the
/// most recent message, if any.
pub struct ThreadRow {
    pub chat: ChatRow,
    pub counterpart_id: String,
    pub counterpart_name: String,
    pub last_message: Option<MessageRow>,
}

impl ChatRow {
    pub fn listing(&self) -> ListingRef {
        ListingRef::from_columns(
            self.product_id
                .as_deref()
                .map(|id| parse_uuid(id, "product id")),
            self.accommodation_id
                .as_deref()
                .map(|id| parse_uuid(id, "accommodation id")),
        )
    }
}

impl MessageRow {
    pub fn into_response(self) -> MessageResponse {
        MessageResponse {
            id: parse_uuid(&self.id, "message id"),
            chat_id: parse_uuid(&self.chat_id, "chat id"),
            sender_id: parse_uuid(&self.sender_id, "sender id"),
            sender_name: self.sender_name,
            body: self.body,
            is_read: self.is_read,
            created_at: parse_timestamp(&self.created_at, "message created_at"),
        }
    }
}

impl ThreadRow {
    pub fn into_response(self) -> ChatResponse {
        let listing = self.chat.listing();
        ChatResponse {
            id: parse_uuid(&self.chat.id, "chat id"),
            counterpart_id: parse_uuid(&self.counterpart_id, "counterpart id"),
            counterpart_name: self.counterpart_name,
            listing,
            created_at: parse_timestamp(&self.chat.created_at, "chat created_at"),
            updated_at: parse_timestamp(&self.chat.updated_at, "chat updated_at"),
            last_message: self.last_message.map(MessageRow::into_response),
        }
    }
}

pub(crate) fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {what} '{raw}': {e}");
        Uuid::default()
    })
}

pub(crate) fn parse_timestamp(raw: &str, what: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt {what} '{raw}': {e}");
        DateTime::default()
    })
}
