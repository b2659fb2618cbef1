use anyhow::{anyhow, Context, Result};
use shared::domain::User;
use tracing::warn;

use crate::store::{KeyValueStore, TOKEN_KEY, USER_KEY};

/// What the user typed into the login or registration form. `id` is the
/// optional device-bound identity the server may link the account to.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub id: Option<String>,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Authentication state plus the host configuration it is bound to.
///
/// `epoch` increases on every login and logout. Async completions capture
/// it when issued and drop their result if it moved in the meantime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    user: Option<User>,
    token: Option<String>,
    api_base_url: String,
    epoch: u64,
}

impl SessionState {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.is_authenticated()
    }

    pub fn set_api_base_url(&mut self, api_base_url: impl Into<String>) {
        self.api_base_url = api_base_url.into();
    }

    pub fn authenticate(&mut self, user: User, token: String) -> u64 {
        self.user = Some(user);
        self.token = Some(token);
        self.epoch += 1;
        self.epoch
    }

    /// Drops credentials. The base URL is host configuration and stays.
    pub fn clear(&mut self) {
        self.user = None;
        self.token = None;
        self.epoch += 1;
    }

    /// Event stream URL: the base URL moved onto the websocket scheme with
    /// the token as a connection-time credential. `None` until both a token
    /// and a base URL are present.
    pub fn connection_url(&self) -> Option<String> {
        let token = self.token.as_deref()?;
        if self.api_base_url.is_empty() {
            return None;
        }
        let ws_base = if let Some(rest) = self.api_base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return None;
        };
        let mut url = url::Url::parse(&ws_base).ok()?;
        url.query_pairs_mut().clear().append_pair("token", token);
        Some(url.to_string())
    }

    pub fn persist(&self, store: &dyn KeyValueStore) -> Result<()> {
        match (&self.user, &self.token) {
            (Some(user), Some(token)) => {
                store.set(USER_KEY, &serde_json::to_string(user)?)?;
                store.set(TOKEN_KEY, token)?;
            }
            _ => forget(store)?,
        }
        Ok(())
    }

    /// Restores user and token written by a previous process. A half
    /// written or unreadable entry is discarded rather than trusted.
    pub fn restore(&mut self, store: &dyn KeyValueStore) -> Result<bool> {
        let token = store.get(TOKEN_KEY)?;
        let user = store.get(USER_KEY)?;
        let (Some(token), Some(user)) = (token, user) else {
            return Ok(false);
        };
        let user: User = match serde_json::from_str(&user).context("stored user is not valid") {
            Ok(user) => user,
            Err(err) => {
                warn!("session: discarding persisted session: {err:#}");
                forget(store)?;
                return Ok(false);
            }
        };
        if token.is_empty() {
            forget(store)?;
            return Err(anyhow!("persisted token is empty"));
        }
        self.authenticate(user, token);
        Ok(true)
    }
}

pub fn forget(store: &dyn KeyValueStore) -> Result<()> {
    store.remove(USER_KEY)?;
    store.remove(TOKEN_KEY)?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
