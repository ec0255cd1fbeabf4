use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;

/// Events sent over the WebSocket gateway, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, display_name: String },

    /// The connection was added to a chat's room
    ChatJoined { chat_id: Uuid },

    /// A new message was persisted; fanned out to every room member,
    /// the sender's own connection included
    ReceiveMessage { message: MessageResponse },

    /// The sender's message was persisted and broadcast
    MessageAck { chat_id: Uuid, message_id: Uuid },

    /// A join or send attempt was refused; targeted at the offending
    /// connection only, nothing was persisted or broadcast
    SendRejected { chat_id: Uuid, reason: RejectReason },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection; must be the first frame
    Identify { token: String },

    /// Join the room for a chat the user participates in
    JoinChat { chat_id: Uuid },

    /// Persist a message and fan it out to the chat's room
    SendMessage { chat_id: Uuid, body: String },
}

/// Why a gateway join or send was refused. Mirrors the REST error taxonomy so
/// a client can tell a dropped message from a rejected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Forbidden,
    NotFound,
    InvalidRequest,
    Internal,
}
