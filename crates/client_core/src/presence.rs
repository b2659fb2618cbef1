use std::collections::HashSet;

use shared::domain::{User, UserId};

/// Users currently connected to the event stream. Replaced wholesale on
/// every push, so entries may be stale between pushes.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    users: Vec<User>,
    ids: HashSet<UserId>,
}

impl PresenceTracker {
    pub fn replace(&mut self, users: Vec<User>) {
        self.ids = users.iter().map(|user| user.id.clone()).collect();
        self.users = users;
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.ids.clear();
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
