use std::collections::HashMap;

use shared::domain::{ChannelId, Message, MessageId};

/// Per-channel message buckets in arrival order, plus the pending reply.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    buckets: HashMap<ChannelId, Vec<Message>>,
    reply_to: Option<Message>,
}

impl MessageStore {
    pub fn messages(&self, channel_id: ChannelId) -> &[Message] {
        self.buckets
            .get(&channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn last_message_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.buckets
            .get(&channel_id)
            .and_then(|bucket| bucket.last())
            .map(|message| message.id)
    }

    /// Wholesale replacement from `GET /messages/:channelId`. Duplicate ids
    /// inside the snapshot collapse to their first occurrence.
    pub fn replace(&mut self, channel_id: ChannelId, messages: Vec<Message>) {
        let mut bucket: Vec<Message> = Vec::with_capacity(messages.len());
        for message in messages {
            if !bucket.iter().any(|existing| existing.id == message.id) {
                bucket.push(message);
            }
        }
        self.buckets.insert(channel_id, bucket);
    }

    /// Appends unless the bucket already holds the id. Returns whether the
    /// message was new; this is the only guard against echo and replay.
    pub fn receive(&mut self, message: Message) -> bool {
        let bucket = self.buckets.entry(message.channel_id).or_default();
        if bucket.iter().any(|existing| existing.id == message.id) {
            return false;
        }
        bucket.push(message);
        true
    }

    /// Removes the id from every bucket, since deletion events do not name
    /// a channel. Returns the channels that changed.
    pub fn remove(&mut self, id: MessageId) -> Vec<ChannelId> {
        let mut touched = Vec::new();
        for (channel_id, bucket) in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|message| message.id != id);
            if bucket.len() != before {
                touched.push(*channel_id);
            }
        }
        if self.reply_to.as_ref().is_some_and(|m| m.id == id) {
            self.reply_to = None;
        }
        touched.sort();
        touched
    }

    pub fn drop_channel(&mut self, channel_id: ChannelId) {
        self.buckets.remove(&channel_id);
        if self
            .reply_to
            .as_ref()
            .is_some_and(|m| m.channel_id == channel_id)
        {
            self.reply_to = None;
        }
    }

    pub fn reply_to(&self) -> Option<&Message> {
        self.reply_to.as_ref()
    }

    pub fn start_reply(&mut self, message: Message) {
        self.reply_to = Some(message);
    }

    pub fn cancel_reply(&mut self) -> bool {
        self.reply_to.take().is_some()
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
