//! Wire protocol shared by the courier server, its tests, and any client:
//! the JSON shapes returned by the HTTP API and pushed over the per-workspace
//! WebSocket stream. Entity structs serialize with snake_case field names
//! (they mirror the relational rows); request bodies use camelCase.

use serde::{Deserialize, Serialize};

pub mod phone;

/// Display names and contact names are rejected above this length.
pub const MAX_NAME_LENGTH: usize = 80;
/// Message bodies are rejected above this length.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub workspace_id: String,
    pub display_name: String,
    pub created_at: i64,
}

/// The identity carried by a session token; `/api/me` returns this rather
/// than a full `User` row (the token does not carry `created_at`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub workspace_id: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub phone: String,
    pub created_at: i64,
}

/// Denormalized conversation row as clients consume it: the raw conversation
/// columns plus the linked contact's name and the latest message preview.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: String,
    pub workspace_id: String,
    pub contact_id: Option<String>,
    pub phone: String,
    pub last_message_at: Option<i64>,
    pub unread_count: i64,
    pub created_at: i64,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub last_message_body: Option<String>,
    #[serde(default)]
    pub last_message_direction: Option<Direction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub from_phone: String,
    pub to_phone: String,
    pub body: String,
    pub created_at: i64,
    pub provider_message_id: Option<String>,
    pub status: String,
}

/// Events fanned out to every live connection of a workspace. Clients merge
/// them idempotently; a reconnecting client re-fetches instead of replaying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "message:new")]
    MessageNew {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        conversation: ConversationView,
        message: Message,
    },
    #[serde(rename = "conversation:update")]
    ConversationUpdate { conversation: ConversationView },
    #[serde(rename = "contact:update")]
    ContactUpdate {
        contact: Contact,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted: Option<bool>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub workspace_code: String,
    #[serde(default)]
    pub pin: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub to_phone: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevInboundRequest {
    #[serde(default)]
    pub from_phone: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: User,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: SessionUser,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationView>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub conversation: ConversationView,
    pub message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactsResponse {
    pub contacts: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactResponse {
    pub contact: Contact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
