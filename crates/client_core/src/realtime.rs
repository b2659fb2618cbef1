//! Lifecycle of the event-stream socket: `Closed -> Connecting -> Open ->
//! Closed`. There is no automatic reconnect; a closed stream stays closed
//! until the next login or an explicit `connect`.

use std::sync::Arc;

use futures::StreamExt;
use shared::protocol::ServerEvent;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    client::ChatClient,
    error::{ClientError, ClientResult},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// Connection bookkeeping. Each attempt gets an id so that a close reported
/// by an old reader cannot tear down a newer connection.
#[derive(Debug, Default)]
pub struct RealtimeConnection {
    state: ConnectionState,
    current: Option<u64>,
    next_id: u64,
    reader: Option<JoinHandle<()>>,
}

impl RealtimeConnection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Closed -> Connecting`. `None` when a connection is already being
    /// set up or open.
    pub fn begin_connect(&mut self) -> Option<u64> {
        if self.state != ConnectionState::Closed {
            return None;
        }
        self.next_id += 1;
        self.current = Some(self.next_id);
        self.state = ConnectionState::Connecting;
        Some(self.next_id)
    }

    /// `Connecting -> Open`. Returns the reader back when the attempt was
    /// superseded in the meantime, so the caller can stop it.
    pub fn opened(&mut self, id: u64, reader: JoinHandle<()>) -> Result<(), JoinHandle<()>> {
        if self.current != Some(id) || self.state != ConnectionState::Connecting {
            return Err(reader);
        }
        self.state = ConnectionState::Open;
        self.reader = Some(reader);
        Ok(())
    }

    /// `* -> Closed` for attempt `id`. Returns false for stale ids.
    pub fn closed(&mut self, id: u64) -> bool {
        if self.current != Some(id) {
            return false;
        }
        self.current = None;
        self.state = ConnectionState::Closed;
        self.reader = None;
        true
    }

    /// Closes whatever is current. Returns whether anything was.
    pub fn shutdown(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Closed;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.current = None;
        self.state = ConnectionState::Closed;
        was_active
    }
}

pub fn parse_frame(text: &str) -> ClientResult<ServerEvent> {
    Ok(serde_json::from_str(text)?)
}

impl ChatClient {
    /// Opens the event stream if the session allows it and nothing is open
    /// yet. Returns whether a new connection was established.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<bool> {
        let (url, base_url, epoch) = {
            let guard = self.inner.lock().await;
            (
                guard.session.connection_url(),
                guard.session.api_base_url().to_string(),
                guard.session.epoch(),
            )
        };
        let Some(url) = url else {
            debug!("realtime: not connecting without token and base url");
            return Ok(false);
        };
        let Some(id) = self.connection.lock().await.begin_connect() else {
            debug!("realtime: connection already open or in progress");
            return Ok(false);
        };
        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(connection_id = id, "realtime: handshake with {base_url} failed: {err}");
                self.connection_closed(id).await;
                return Err(ClientError::Connection(err.to_string()));
            }
        };

        if !self.inner.lock().await.session.is_current(epoch) {
            debug!(connection_id = id, "realtime: session changed during handshake");
            self.connection_closed(id).await;
            return Ok(false);
        }

        let (_, mut reader) = stream.split();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => client.handle_frame(&text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(connection_id = id, "realtime: receive failed: {err}");
                        break;
                    }
                }
            }
            client.connection_closed(id).await;
        });

        if let Err(task) = self.connection.lock().await.opened(id, task) {
            task.abort();
            return Ok(false);
        }
        info!(connection_id = id, "realtime: connected to {base_url}");
        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Open));
        Ok(true)
    }

    /// Closes the event stream without touching the session.
    pub async fn disconnect(&self) {
        if self.connection.lock().await.shutdown() {
            info!("realtime: disconnected");
            self.inner.lock().await.presence.clear();
            self.emit(ClientEvent::PresenceUpdated);
            self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.lock().await.state()
    }

    /// Malformed frames are dropped here so one bad message never takes the
    /// connection down.
    pub(crate) async fn handle_frame(self: &Arc<Self>, text: &str) {
        let event = match parse_frame(text) {
            Ok(event) => event,
            Err(err) => {
                warn!("realtime: dropping malformed frame: {err}");
                return;
            }
        };
        debug!(kind = event.kind(), "realtime: event received");
        let effects = self.inner.lock().await.apply_event(event);
        self.run_effects(effects);
    }

    async fn connection_closed(&self, id: u64) {
        if !self.connection.lock().await.closed(id) {
            return;
        }
        info!(connection_id = id, "realtime: connection closed");
        self.inner.lock().await.presence.clear();
        self.emit(ClientEvent::PresenceUpdated);
        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Closed));
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
