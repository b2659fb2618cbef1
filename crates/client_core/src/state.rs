//! The explicit state container shared by every component, and the pure
//! part of event dispatch: applying a pushed event to local state and
//! reporting which follow-up work the async side has to run.

use shared::{
    domain::{ChannelId, Message, User},
    protocol::ServerEvent,
};
use tracing::debug;

use crate::{
    channels::{ChannelRegistry, SelectionChange},
    messages::MessageStore,
    notify::NotificationRequest,
    presence::PresenceTracker,
    session::SessionState,
    unread::UnreadTracker,
    ClientEvent,
};

const REFETCH_NOTICE: &str = "Channel list changed on the server; refreshing.";

#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub session: SessionState,
    pub channels: ChannelRegistry,
    pub messages: MessageStore,
    pub unread: UnreadTracker,
    pub presence: PresenceTracker,
    /// Every user known to the server, preloaded after login.
    pub directory: Vec<User>,
}

/// Work produced by applying an event. `Emit` and `Notify` are delivered
/// as is; the rest need a REST round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(ClientEvent),
    Notify(NotificationRequest),
    /// Load a channel that became selected without user action.
    Activate(ChannelId),
    RefetchMembers(ChannelId),
    RefetchChannels,
}

impl ClientState {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            session: SessionState::new(api_base_url),
            ..Self::default()
        }
    }

    /// Back to the initial state, keeping only the base URL.
    pub fn reset(&mut self) {
        let mut session = std::mem::take(&mut self.session);
        session.clear();
        *self = Self {
            session,
            ..Self::default()
        };
    }

    pub fn selected(&self) -> Option<ChannelId> {
        self.channels.selected()
    }

    /// Whether a completion issued for `channel_id` under `epoch` still
    /// applies.
    pub fn is_current_for(&self, epoch: u64, channel_id: ChannelId) -> bool {
        self.session.is_current(epoch) && self.channels.is_selected(channel_id)
    }

    pub fn messages_for_selected(&self) -> &[Message] {
        match self.selected() {
            Some(id) => self.messages.messages(id),
            None => &[],
        }
    }

    pub fn apply_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::NewMessage { data } => self.apply_new_message(data),
            ServerEvent::MessageDeleted { id } => self
                .messages
                .remove(id)
                .into_iter()
                .map(|channel_id| Effect::Emit(ClientEvent::MessagesUpdated { channel_id }))
                .collect(),
            ServerEvent::UserListUpdate { data } => {
                self.presence.replace(data);
                vec![Effect::Emit(ClientEvent::PresenceUpdated)]
            }
            ServerEvent::ChannelCreated { data } => {
                if self.channels.insert_if_absent(data) {
                    vec![Effect::Emit(ClientEvent::ChannelsUpdated)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::ChannelDeleted { id } => self.apply_channel_deleted(id),
            ServerEvent::ChannelUpdated { data } => {
                if self.channels.merge(data) {
                    vec![Effect::Emit(ClientEvent::ChannelsUpdated)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::MembersUpdated { data } => {
                if self.channels.is_selected(data.channel_id) {
                    vec![Effect::RefetchMembers(data.channel_id)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::RefetchChannels { message } => vec![
                Effect::Emit(ClientEvent::Notice(
                    message.unwrap_or_else(|| REFETCH_NOTICE.to_string()),
                )),
                Effect::RefetchChannels,
            ],
            ServerEvent::Unknown => {
                debug!("realtime: ignoring event of unrecognized type");
                Vec::new()
            }
        }
    }

    fn apply_new_message(&mut self, message: Message) -> Vec<Effect> {
        let channel_id = message.channel_id;
        let from_self = self
            .session
            .user()
            .is_some_and(|user| user.username == message.user);
        let request = NotificationRequest {
            channel_id,
            title: match self.channels.get(channel_id) {
                Some(channel) => format!("{} #{}", message.user, channel.name),
                None => message.user.clone(),
            },
            body: message.text.clone(),
        };

        if !self.messages.receive(message) {
            debug!(channel_id = channel_id.0, "realtime: dropping duplicate message");
            return Vec::new();
        }

        let mut effects = vec![Effect::Emit(ClientEvent::MessagesUpdated { channel_id })];
        if !from_self {
            effects.push(Effect::Notify(request));
        }
        if self.unread.increment(channel_id, self.selected()) {
            effects.push(Effect::Emit(ClientEvent::UnreadUpdated));
        }
        effects
    }

    fn apply_channel_deleted(&mut self, id: ChannelId) -> Vec<Effect> {
        let existed = self.channels.contains(id);
        let change = self.channels.remove(id);
        self.messages.drop_channel(id);
        self.unread.drop_channel(id);
        if !existed {
            return Vec::new();
        }

        let mut effects = vec![Effect::Emit(ClientEvent::ChannelsUpdated)];
        match change {
            Some(SelectionChange::Select(next)) => {
                effects.push(Effect::Emit(ClientEvent::SelectionChanged(Some(next))));
                effects.push(Effect::Activate(next));
            }
            Some(SelectionChange::Cleared) => {
                effects.push(Effect::Emit(ClientEvent::SelectionChanged(None)));
            }
            None => {}
        }
        effects
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
