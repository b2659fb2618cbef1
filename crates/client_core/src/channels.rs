use std::collections::HashMap;

use shared::domain::{Channel, ChannelId, ChannelPatch, User};

/// Channel list, current selection and the rosters of group channels.
///
/// Entries only appear or disappear through server snapshots and
/// server-pushed events, never ahead of the server.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
    selected: Option<ChannelId>,
    members: HashMap<ChannelId, Vec<User>>,
}

impl ChannelRegistry {
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.get(id).is_some()
    }

    pub fn selected(&self) -> Option<ChannelId> {
        self.selected
    }

    pub fn selected_channel(&self) -> Option<&Channel> {
        self.selected.and_then(|id| self.get(id))
    }

    pub fn is_selected(&self, id: ChannelId) -> bool {
        self.selected == Some(id)
    }

    /// Sets the selection and returns the previous one.
    pub fn select(&mut self, id: ChannelId) -> Option<ChannelId> {
        self.selected.replace(id)
    }

    pub fn first_id(&self) -> Option<ChannelId> {
        self.channels.first().map(|channel| channel.id)
    }

    /// Wholesale replacement from `GET /channels`. The first channel becomes
    /// selected when nothing was, and a selected channel missing from the
    /// snapshot gets the same fallback as a deletion. Returns the change so
    /// the caller can load the newly selected channel.
    pub fn replace(&mut self, channels: Vec<Channel>) -> Option<SelectionChange> {
        self.channels = channels;
        self.members.retain(|id, _| self.channels.iter().any(|c| c.id == *id));

        match self.selected {
            None => {
                let first = self.first_id()?;
                self.selected = Some(first);
                Some(SelectionChange::Select(first))
            }
            Some(id) if !self.contains(id) => Some(self.fallback_selection()),
            Some(_) => None,
        }
    }

    /// `channel_created`. Returns whether the channel was new.
    pub fn insert_if_absent(&mut self, channel: Channel) -> bool {
        if self.contains(channel.id) {
            return false;
        }
        self.channels.push(channel);
        true
    }

    /// `channel_deleted`. Returns the selection change when the removed
    /// channel was the selected one.
    pub fn remove(&mut self, id: ChannelId) -> Option<SelectionChange> {
        let before = self.channels.len();
        self.channels.retain(|channel| channel.id != id);
        self.members.remove(&id);
        if self.channels.len() == before || self.selected != Some(id) {
            return None;
        }
        Some(self.fallback_selection())
    }

    fn fallback_selection(&mut self) -> SelectionChange {
        self.selected = self.first_id();
        match self.selected {
            Some(first) => SelectionChange::Select(first),
            None => SelectionChange::Cleared,
        }
    }

    /// `channel_updated`. Returns whether a channel matched.
    pub fn merge(&mut self, patch: ChannelPatch) -> bool {
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == patch.id) else {
            return false;
        };
        if let Some(name) = patch.name {
            channel.name = name;
        }
        if let Some(is_group) = patch.is_group {
            channel.is_group = is_group;
        }
        true
    }

    pub fn members(&self, id: ChannelId) -> Option<&[User]> {
        self.members.get(&id).map(Vec::as_slice)
    }

    pub fn set_members(&mut self, id: ChannelId, roster: Vec<User>) {
        self.members.insert(id, roster);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    Select(ChannelId),
    Cleared,
}

#[cfg(test)]
#[path = "tests/channels_tests.rs"]
mod tests;
