use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::{ChannelId, Message, MessageId, UserId};
use tokio::sync::broadcast;

pub mod api;
pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod notify;
pub mod presence;
pub mod realtime;
pub mod session;
pub mod state;
pub mod store;
pub mod unread;

pub use client::ChatClient;
pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, ClientResult};
pub use notify::{LogNotifier, NotificationRequest, Notifier};
pub use realtime::ConnectionState;
pub use session::Credentials;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

/// Shown when a rejected login carries no usable error text.
pub const LOGIN_FAILED: &str = "Login failed.";
/// Shown when a rejected registration carries no usable error text.
pub const REGISTRATION_FAILED: &str = "Registration failed.";

/// State change notifications for the presentation layer. They carry ids
/// only; the current values are read back through the getters.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SessionChanged { authenticated: bool },
    ChannelsUpdated,
    SelectionChanged(Option<ChannelId>),
    MessagesUpdated { channel_id: ChannelId },
    UnreadUpdated,
    PresenceUpdated,
    MembersUpdated { channel_id: ChannelId },
    DirectoryUpdated,
    ReplyContextChanged,
    ConnectionStateChanged(ConnectionState),
    /// Informational text the UI should show without blocking.
    Notice(String),
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, credentials: Credentials) -> ClientResult<()>;
    async fn auto_login(&self, id: &str) -> bool;
    async fn register(&self, credentials: Credentials) -> ClientResult<()>;
    async fn resume(&self) -> bool;
    async fn logout(&self);
    async fn select_channel(&self, channel_id: ChannelId) -> ClientResult<()>;
    async fn create_channel(&self, name: &str) -> ClientResult<()>;
    async fn create_group_channel(&self, name: &str, member_ids: &[UserId]) -> ClientResult<()>;
    async fn delete_channel(&self, channel_id: ChannelId) -> ClientResult<()>;
    async fn rename_channel(&self, channel_id: ChannelId, name: &str) -> ClientResult<()>;
    async fn add_members(&self, channel_id: ChannelId, user_ids: &[UserId]) -> ClientResult<()>;
    async fn remove_members(&self, channel_id: ChannelId, user_ids: &[UserId])
        -> ClientResult<()>;
    async fn send_message(&self, text: &str) -> ClientResult<()>;
    async fn delete_message(&self, message_id: MessageId) -> ClientResult<()>;
    async fn start_reply(&self, message: Message);
    async fn cancel_reply(&self);
    async fn mark_channel_as_read(&self, channel_id: ChannelId) -> ClientResult<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn login(&self, credentials: Credentials) -> ClientResult<()> {
        ChatClient::login(self, credentials).await
    }

    async fn auto_login(&self, id: &str) -> bool {
        ChatClient::auto_login(self, id).await
    }

    async fn register(&self, credentials: Credentials) -> ClientResult<()> {
        ChatClient::register(self, credentials).await
    }

    async fn resume(&self) -> bool {
        ChatClient::resume(self).await
    }

    async fn logout(&self) {
        ChatClient::logout(self).await
    }

    async fn select_channel(&self, channel_id: ChannelId) -> ClientResult<()> {
        ChatClient::select_channel(self, channel_id).await
    }

    async fn create_channel(&self, name: &str) -> ClientResult<()> {
        ChatClient::create_channel(self, name).await
    }

    async fn create_group_channel(&self, name: &str, member_ids: &[UserId]) -> ClientResult<()> {
        ChatClient::create_group_channel(self, name, member_ids).await
    }

    async fn delete_channel(&self, channel_id: ChannelId) -> ClientResult<()> {
        ChatClient::delete_channel(self, channel_id).await
    }

    async fn rename_channel(&self, channel_id: ChannelId, name: &str) -> ClientResult<()> {
        ChatClient::rename_channel(self, channel_id, name).await
    }

    async fn add_members(&self, channel_id: ChannelId, user_ids: &[UserId]) -> ClientResult<()> {
        ChatClient::add_members(self, channel_id, user_ids).await
    }

    async fn remove_members(
        &self,
        channel_id: ChannelId,
        user_ids: &[UserId],
    ) -> ClientResult<()> {
        ChatClient::remove_members(self, channel_id, user_ids).await
    }

    async fn send_message(&self, text: &str) -> ClientResult<()> {
        ChatClient::send_message(self, text).await
    }

    async fn delete_message(&self, message_id: MessageId) -> ClientResult<()> {
        ChatClient::delete_message(self, message_id).await
    }

    async fn start_reply(&self, message: Message) {
        ChatClient::start_reply(self, message).await
    }

    async fn cancel_reply(&self) {
        ChatClient::cancel_reply(self).await
    }

    async fn mark_channel_as_read(&self, channel_id: ChannelId) -> ClientResult<()> {
        ChatClient::mark_channel_as_read(self, channel_id).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        ChatClient::subscribe_events(self)
    }
}
