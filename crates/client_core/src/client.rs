use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Channel, ChannelId, Message, MessageId, User, UserId},
    protocol::{LoginRequest, LoginResponse, RegisterRequest, SendMessageRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, AuthContext},
    channels::SelectionChange,
    config::{api_base_url_from_parts, ClientSettings},
    error::{ClientError, ClientResult},
    notify::Notifier,
    realtime::RealtimeConnection,
    session::{self, Credentials},
    state::{ClientState, Effect},
    store::KeyValueStore,
    ClientEvent,
};

/// The synchronization engine. All local state sits behind one mutex that
/// is never held across an await, so each mutation applies atomically and
/// every async completion re-checks that its context is still current
/// before touching state.
pub struct ChatClient {
    api: ApiClient,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    pub(crate) inner: Mutex<ClientState>,
    pub(crate) connection: Mutex<RealtimeConnection>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    /// Builds the engine and restores a session persisted by a previous run.
    /// Call [`ChatClient::resume`] to bring a restored session online.
    pub fn new(
        settings: &ClientSettings,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> ClientResult<Arc<Self>> {
        let api_base_url = settings
            .resolved_api_base_url()
            .map_err(|err| ClientError::Validation(format!("{err:#}")))?;
        let mut state = ClientState::new(api_base_url);
        match state.session.restore(store.as_ref()) {
            Ok(true) => info!("session: restored persisted session"),
            Ok(false) => {}
            Err(err) => warn!("session: could not restore persisted session: {err:#}"),
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Arc::new(Self {
            api: ApiClient::new(settings.request_timeout())?,
            store,
            notifier,
            inner: Mutex::new(state),
            connection: Mutex::new(RealtimeConnection::default()),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn auth_context(&self) -> ClientResult<AuthContext> {
        let guard = self.inner.lock().await;
        let token = guard
            .session
            .token()
            .ok_or(ClientError::NotAuthenticated)?
            .to_string();
        Ok(AuthContext {
            base_url: guard.session.api_base_url().to_string(),
            token,
            epoch: guard.session.epoch(),
        })
    }

    pub(crate) fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::Notify(request) => self.notifier.notify(request),
                Effect::Activate(channel_id) => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.activate_channel(channel_id, None).await {
                            client.report(err);
                        }
                    });
                }
                Effect::RefetchMembers(channel_id) => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.fetch_members(channel_id).await {
                            client.report(err);
                        }
                    });
                }
                Effect::RefetchChannels => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.fetch_channels().await {
                            client.report(err);
                        }
                    });
                }
            }
        }
    }

    /// Background failures: logged, and passed on as a non-blocking notice
    /// unless they are expected.
    fn report(&self, err: ClientError) {
        if err.is_silent() {
            debug!("sync: suppressed: {err}");
            return;
        }
        warn!("sync: {err}");
        self.emit(ClientEvent::Error(err.to_string()));
    }

    // Session

    pub async fn login(self: &Arc<Self>, credentials: Credentials) -> ClientResult<()> {
        let base_url = self.api_base_url().await;
        let response = self
            .api
            .login(
                &base_url,
                &LoginRequest {
                    id: credentials.id,
                    username: credentials.username,
                    password: credentials.password,
                },
            )
            .await?;
        self.establish_session(response).await;
        Ok(())
    }

    /// Login with an identity handed over by the host (device or launch
    /// argument). Never reports failure beyond the return value, so the
    /// caller can fall back to the login form.
    pub async fn auto_login(self: &Arc<Self>, id: &str) -> bool {
        let base_url = self.api_base_url().await;
        match self.api.auto_login(&base_url, id).await {
            Ok(response) => {
                self.establish_session(response).await;
                true
            }
            Err(err) => {
                debug!("session: auto login declined: {err}");
                false
            }
        }
    }

    pub async fn register(&self, credentials: Credentials) -> ClientResult<()> {
        let base_url = self.api_base_url().await;
        self.api
            .register(
                &base_url,
                &RegisterRequest {
                    id: credentials.id,
                    username: credentials.username,
                    password: credentials.password,
                },
            )
            .await
    }

    /// Brings a session restored from the store online. Returns false when
    /// there was nothing to resume.
    pub async fn resume(self: &Arc<Self>) -> bool {
        if !self.is_authenticated().await {
            return false;
        }
        self.emit(ClientEvent::SessionChanged {
            authenticated: true,
        });
        self.initialize().await;
        true
    }

    pub async fn logout(&self) {
        self.disconnect().await;
        self.inner.lock().await.reset();
        if let Err(err) = session::forget(self.store.as_ref()) {
            warn!("session: failed to clear persisted session: {err:#}");
        }
        info!("session: logged out");
        self.emit(ClientEvent::SessionChanged {
            authenticated: false,
        });
        self.emit(ClientEvent::ChannelsUpdated);
        self.emit(ClientEvent::SelectionChanged(None));
    }

    pub async fn update_api_base_url(&self, host: &str, port: u16) -> ClientResult<String> {
        let api_base_url = api_base_url_from_parts(host, port)
            .map_err(|err| ClientError::Validation(format!("{err:#}")))?;
        self.inner
            .lock()
            .await
            .session
            .set_api_base_url(api_base_url.clone());
        Ok(api_base_url)
    }

    async fn establish_session(self: &Arc<Self>, response: LoginResponse) {
        // A new session replaces whatever the previous one left behind,
        // including its connection.
        self.disconnect().await;
        {
            let mut guard = self.inner.lock().await;
            guard.reset();
            guard.session.authenticate(response.user, response.token);
            if let Err(err) = guard.session.persist(self.store.as_ref()) {
                warn!("session: failed to persist session: {err:#}");
            }
            info!(
                username = %guard.session.user().map(|u| u.username.as_str()).unwrap_or_default(),
                "session: logged in"
            );
        }
        self.emit(ClientEvent::SessionChanged {
            authenticated: true,
        });
        self.initialize().await;
    }

    /// Post-login sync: channel list, event stream, user directory, unread
    /// counts. Each step is best effort.
    async fn initialize(self: &Arc<Self>) {
        if let Err(err) = self.fetch_channels().await {
            self.report(err);
        }
        if let Err(err) = self.connect().await {
            self.report(err);
        }
        if let Err(err) = self.fetch_users().await {
            self.report(err);
        }
        if let Err(err) = self.fetch_unread_counts().await {
            self.report(err);
        }
    }

    // Channels

    pub async fn fetch_channels(self: &Arc<Self>) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let channels = self.api.channels(&ctx).await?;
        let change = {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_current(ctx.epoch) {
                debug!("channels: discarding snapshot from a previous session");
                return Ok(());
            }
            let change = guard.channels.replace(channels);
            if let Some(SelectionChange::Cleared) = change {
                guard.messages.cancel_reply();
            }
            change
        };
        self.emit(ClientEvent::ChannelsUpdated);
        match change {
            Some(SelectionChange::Select(channel_id)) => {
                self.emit(ClientEvent::SelectionChanged(Some(channel_id)));
                self.activate_channel(channel_id, None).await?;
            }
            Some(SelectionChange::Cleared) => self.emit(ClientEvent::SelectionChanged(None)),
            None => {}
        }
        Ok(())
    }

    pub async fn create_channel(&self, name: &str) -> ClientResult<()> {
        let name = non_blank(name, "channel name")?;
        let ctx = self.auth_context().await?;
        self.api.create_channel(&ctx, name).await
    }

    pub async fn create_group_channel(&self, name: &str, member_ids: &[UserId]) -> ClientResult<()> {
        let name = non_blank(name, "channel name")?;
        let ctx = self.auth_context().await?;
        self.api.create_group_channel(&ctx, name, member_ids).await
    }

    pub async fn delete_channel(&self, id: ChannelId) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        self.api.delete_channel(&ctx, id).await
    }

    pub async fn rename_channel(&self, id: ChannelId, name: &str) -> ClientResult<()> {
        let name = non_blank(name, "channel name")?;
        let ctx = self.auth_context().await?;
        self.api.rename_channel(&ctx, id, name).await
    }

    pub async fn add_members(&self, id: ChannelId, user_ids: &[UserId]) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        self.api.add_members(&ctx, id, user_ids).await
    }

    pub async fn remove_members(&self, id: ChannelId, user_ids: &[UserId]) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        self.api.remove_members(&ctx, id, user_ids).await
    }

    pub async fn select_channel(&self, id: ChannelId) -> ClientResult<()> {
        let previous = {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_authenticated() {
                return Err(ClientError::NotAuthenticated);
            }
            if !guard.channels.contains(id) {
                return Err(ClientError::Validation(format!("unknown channel {id}")));
            }
            guard.channels.select(id)
        };
        if previous != Some(id) {
            self.emit(ClientEvent::SelectionChanged(Some(id)));
        }
        self.activate_channel(id, previous.filter(|prev| *prev != id))
            .await
    }

    /// Everything that follows a selection change: flush the read mark of
    /// the channel being left, then load messages, read cursor and roster
    /// of the new one and acknowledge what was loaded.
    async fn activate_channel(&self, id: ChannelId, previous: Option<ChannelId>) -> ClientResult<()> {
        if let Some(previous) = previous {
            let needs_flush = {
                let guard = self.inner.lock().await;
                guard.unread.count(previous) > 0
                    || guard
                        .unread
                        .has_unacknowledged(previous, guard.messages.last_message_id(previous))
            };
            if needs_flush {
                if let Err(err) = self.mark_channel_as_read(previous).await {
                    warn!(channel_id = previous.0, "unread: read mark flush failed: {err}");
                }
            }
        }

        self.load_messages(id).await?;

        if let Err(err) = self.fetch_last_read_message_id(id).await {
            self.report(err);
        }

        let is_group = {
            let guard = self.inner.lock().await;
            guard.channels.get(id).is_some_and(|channel| channel.is_group)
        };
        if is_group {
            if let Err(err) = self.fetch_members(id).await {
                self.report(err);
            }
        }

        let has_messages = {
            let guard = self.inner.lock().await;
            guard.messages.last_message_id(id).is_some()
        };
        if has_messages {
            if let Err(err) = self.mark_channel_as_read(id).await {
                warn!(channel_id = id.0, "unread: read mark failed: {err}");
            }
        } else {
            let cleared = {
                let mut guard = self.inner.lock().await;
                let selected = guard.channels.is_selected(id);
                if selected {
                    guard.unread.clear(id);
                }
                selected
            };
            if cleared {
                self.emit(ClientEvent::UnreadUpdated);
            }
        }
        Ok(())
    }

    /// Roster of a channel; applied only while that channel is selected.
    pub async fn fetch_members(&self, id: ChannelId) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let roster = self.api.channel_members(&ctx, id).await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.is_current_for(ctx.epoch, id) {
                debug!(channel_id = id.0, "channels: discarding stale roster");
                return Ok(());
            }
            guard.channels.set_members(id, roster);
        }
        self.emit(ClientEvent::MembersUpdated { channel_id: id });
        Ok(())
    }

    // Messages

    /// Replaces the bucket of the selected channel. Losing access to the
    /// channel is an expected state and not reported.
    pub async fn load_messages(&self, channel_id: ChannelId) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let messages = match self.api.messages(&ctx, channel_id).await {
            Ok(messages) => messages,
            Err(ClientError::AccessDenied) => {
                debug!(channel_id = channel_id.0, "messages: access denied, skipping load");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        {
            let mut guard = self.inner.lock().await;
            if !guard.is_current_for(ctx.epoch, channel_id) {
                debug!(channel_id = channel_id.0, "messages: discarding stale load");
                return Ok(());
            }
            guard.messages.replace(channel_id, messages);
        }
        self.emit(ClientEvent::MessagesUpdated { channel_id });
        Ok(())
    }

    /// Posts to the selected channel. The message itself shows up through
    /// the event stream like anyone else's.
    pub async fn send_message(&self, text: &str) -> ClientResult<()> {
        let text = non_blank(text, "message")?;
        let ctx = self.auth_context().await?;
        let (channel_id, reply_to_id) = {
            let guard = self.inner.lock().await;
            let channel_id = guard.selected().ok_or(ClientError::NoChannelSelected)?;
            (channel_id, guard.messages.reply_to().map(|m| m.id))
        };
        self.api
            .send_message(
                &ctx,
                &SendMessageRequest {
                    channel_id,
                    text: text.to_string(),
                    reply_to_id,
                },
            )
            .await?;

        let cleared = {
            let mut guard = self.inner.lock().await;
            guard.session.is_current(ctx.epoch)
                && guard.messages.reply_to().map(|m| m.id) == reply_to_id
                && guard.messages.cancel_reply()
        };
        if cleared {
            self.emit(ClientEvent::ReplyContextChanged);
        }
        Ok(())
    }

    pub async fn delete_message(&self, id: MessageId) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        self.api.delete_message(&ctx, id).await
    }

    pub async fn start_reply(&self, message: Message) {
        self.inner.lock().await.messages.start_reply(message);
        self.emit(ClientEvent::ReplyContextChanged);
    }

    pub async fn cancel_reply(&self) {
        if self.inner.lock().await.messages.cancel_reply() {
            self.emit(ClientEvent::ReplyContextChanged);
        }
    }

    // Unread state

    /// Acknowledges the newest loaded message of a channel. Local state
    /// changes only once the server accepted the cursor.
    pub async fn mark_channel_as_read(&self, channel_id: ChannelId) -> ClientResult<()> {
        let Some(last_message_id) = self
            .inner
            .lock()
            .await
            .messages
            .last_message_id(channel_id)
        else {
            return Ok(());
        };
        let ctx = self.auth_context().await?;
        self.api.mark_read(&ctx, channel_id, last_message_id).await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_current(ctx.epoch) {
                return Ok(());
            }
            guard.unread.mark_read(channel_id, last_message_id);
        }
        self.emit(ClientEvent::UnreadUpdated);
        Ok(())
    }

    pub async fn fetch_unread_counts(&self) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let counts = self.api.unread_counts(&ctx).await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_current(ctx.epoch) {
                return Ok(());
            }
            let selected = guard.selected();
            guard.unread.replace_counts(counts, selected);
        }
        self.emit(ClientEvent::UnreadUpdated);
        Ok(())
    }

    pub async fn fetch_last_read_message_id(&self, channel_id: ChannelId) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let last_read = self.api.last_read(&ctx, channel_id).await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_current(ctx.epoch) {
                return Ok(());
            }
            guard.unread.set_last_read(channel_id, last_read);
        }
        self.emit(ClientEvent::UnreadUpdated);
        Ok(())
    }

    pub async fn fetch_users(&self) -> ClientResult<()> {
        let ctx = self.auth_context().await?;
        let users = self.api.users(&ctx).await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.session.is_current(ctx.epoch) {
                return Ok(());
            }
            guard.directory = users;
        }
        self.emit(ClientEvent::DirectoryUpdated);
        Ok(())
    }

    // Getters

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.session.is_authenticated()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.inner.lock().await.session.user().cloned()
    }

    pub async fn api_base_url(&self) -> String {
        self.inner.lock().await.session.api_base_url().to_string()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.inner.lock().await.channels.channels().to_vec()
    }

    pub async fn selected_channel_id(&self) -> Option<ChannelId> {
        self.inner.lock().await.selected()
    }

    pub async fn selected_channel(&self) -> Option<Channel> {
        self.inner.lock().await.channels.selected_channel().cloned()
    }

    pub async fn messages(&self, channel_id: ChannelId) -> Vec<Message> {
        self.inner.lock().await.messages.messages(channel_id).to_vec()
    }

    pub async fn messages_for_selected_channel(&self) -> Vec<Message> {
        self.inner.lock().await.messages_for_selected().to_vec()
    }

    pub async fn reply_context(&self) -> Option<Message> {
        self.inner.lock().await.messages.reply_to().cloned()
    }

    pub async fn unread_counts(&self) -> HashMap<ChannelId, u32> {
        self.inner.lock().await.unread.counts().clone()
    }

    pub async fn unread_count(&self, channel_id: ChannelId) -> u32 {
        self.inner.lock().await.unread.count(channel_id)
    }

    pub async fn last_read_message_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        self.inner.lock().await.unread.last_read(channel_id)
    }

    pub async fn online_users(&self) -> Vec<User> {
        self.inner.lock().await.presence.users().to_vec()
    }

    pub async fn members_for_selected_channel(&self) -> Vec<User> {
        let guard = self.inner.lock().await;
        guard
            .selected()
            .and_then(|id| guard.channels.members(id))
            .map(<[User]>::to_vec)
            .unwrap_or_default()
    }

    pub async fn users(&self) -> Vec<User> {
        self.inner.lock().await.directory.clone()
    }
}

fn non_blank<'a>(value: &'a str, what: &str) -> ClientResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Validation(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
