use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Channel, ChannelId, ChannelPatch, Message, MessageId, User, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoLoginRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupChannelRequest {
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameChannelRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastReadResponse {
    #[serde(default)]
    pub last_read_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub channel_id: ChannelId,
    pub text: String,
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub last_message_id: MessageId,
}

/// `GET /messages/unread-counts` keys channels by their id rendered as a
/// JSON object key.
pub type UnreadCountsResponse = HashMap<String, u32>;

/// Frames pushed by the server over the event socket, discriminated by
/// `type`. Payloads travel in `data` except for deletions, which carry a
/// bare `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        data: Message,
    },
    MessageDeleted {
        id: MessageId,
    },
    UserListUpdate {
        data: Vec<User>,
    },
    ChannelCreated {
        data: Channel,
    },
    ChannelDeleted {
        id: ChannelId,
    },
    ChannelUpdated {
        data: ChannelPatch,
    },
    MembersUpdated {
        data: MembersUpdatedPayload,
    },
    RefetchChannels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersUpdatedPayload {
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::UserListUpdate { .. } => "user_list_update",
            Self::ChannelCreated { .. } => "channel_created",
            Self::ChannelDeleted { .. } => "channel_deleted",
            Self::ChannelUpdated { .. } => "channel_updated",
            Self::MembersUpdated { .. } => "members_updated",
            Self::RefetchChannels { .. } => "refetch_channels",
            Self::Unknown => "unknown",
        }
    }
}
