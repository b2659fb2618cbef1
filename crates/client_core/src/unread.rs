use std::collections::HashMap;

use shared::domain::{ChannelId, MessageId};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct UnreadTracker {
    counts: HashMap<ChannelId, u32>,
    last_read: HashMap<ChannelId, MessageId>,
}

impl UnreadTracker {
    pub fn count(&self, channel_id: ChannelId) -> u32 {
        self.counts.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &HashMap<ChannelId, u32> {
        &self.counts
    }

    pub fn last_read(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.last_read.get(&channel_id).copied()
    }

    /// Counts an arrival. The selected channel is being read as messages
    /// land, so it never accumulates.
    pub fn increment(&mut self, channel_id: ChannelId, selected: Option<ChannelId>) -> bool {
        if selected == Some(channel_id) {
            return false;
        }
        let count = self.counts.entry(channel_id).or_insert(0);
        *count = count.saturating_add(1);
        true
    }

    pub fn clear(&mut self, channel_id: ChannelId) {
        self.counts.insert(channel_id, 0);
    }

    /// Records a confirmed read mark. The cursor never moves backwards.
    pub fn mark_read(&mut self, channel_id: ChannelId, last_message_id: MessageId) {
        self.clear(channel_id);
        let cursor = self.last_read.entry(channel_id).or_insert(last_message_id);
        if last_message_id > *cursor {
            *cursor = last_message_id;
        } else if last_message_id < *cursor {
            debug!(
                channel_id = channel_id.0,
                cursor = cursor.0,
                requested = last_message_id.0,
                "unread: keeping newer read cursor"
            );
        }
    }

    /// Whether the channel holds messages past its read cursor.
    pub fn has_unacknowledged(
        &self,
        channel_id: ChannelId,
        last_message_id: Option<MessageId>,
    ) -> bool {
        match (last_message_id, self.last_read(channel_id)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(last), Some(cursor)) => last > cursor,
        }
    }

    /// Wholesale replacement from `GET /messages/unread-counts`.
    pub fn replace_counts(
        &mut self,
        counts: HashMap<ChannelId, u32>,
        selected: Option<ChannelId>,
    ) {
        self.counts = counts;
        if let Some(selected) = selected {
            self.counts.insert(selected, 0);
        }
    }

    /// Server value from `GET /channels/:id/last-read`, taken as is.
    pub fn set_last_read(&mut self, channel_id: ChannelId, last_read: Option<MessageId>) {
        match last_read {
            Some(id) => {
                self.last_read.insert(channel_id, id);
            }
            None => {
                self.last_read.remove(&channel_id);
            }
        }
    }

    pub fn drop_channel(&mut self, channel_id: ChannelId) {
        self.counts.remove(&channel_id);
        self.last_read.remove(&channel_id);
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
