use super::*;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Notify};

use crate::{
    notify::NotificationRequest,
    realtime::ConnectionState,
    store::{MemoryStore, TOKEN_KEY, USER_KEY},
};

#[derive(Clone)]
struct TestServer {
    channels: Arc<Mutex<Vec<Channel>>>,
    messages: Arc<Mutex<HashMap<i64, Vec<Message>>>>,
    unread: Arc<Mutex<HashMap<String, u32>>>,
    last_read: Arc<Mutex<HashMap<i64, i64>>>,
    sent: Arc<Mutex<Vec<Value>>>,
    read_marks: Arc<Mutex<Vec<(i64, Value)>>>,
    roster: Arc<Mutex<Vec<User>>>,
    /// Requests keyed `"messages/<id>"` or `"members/<id>"` wait here until
    /// the test releases them. Each gate holds back one request.
    gates: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    frames: broadcast::Sender<String>,
}

impl TestServer {
    async fn hold(&self, key: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().await.insert(key.to_string(), gate.clone());
        gate
    }

    async fn pass_gate(&self, key: &str) {
        let gate = self.gates.lock().await.remove(key);
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    requests: std::sync::Mutex<Vec<NotificationRequest>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, request: NotificationRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
    }
}

fn user(id: &str, username: &str) -> User {
    User {
        id: UserId::new(id),
        username: username.to_string(),
    }
}

fn channel(id: i64, name: &str, is_group: bool) -> Channel {
    Channel {
        id: ChannelId(id),
        name: name.to_string(),
        is_group,
    }
}

fn message(id: i64, channel: i64, from: &str) -> Message {
    Message {
        id: MessageId(id),
        channel_id: ChannelId(channel),
        user: from.to_string(),
        text: format!("text {id}"),
        timestamp: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        reply_to_id: None,
    }
}

async fn handle_login(Json(body): Json<LoginRequest>) -> Response {
    match body.password.as_str() {
        "secret" => Json(LoginResponse {
            user: user("1", &body.username),
            token: "tok".into(),
        })
        .into_response(),
        "silent" => (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid credentials" })),
        )
            .into_response(),
    }
}

async fn handle_register(Json(body): Json<RegisterRequest>) -> Response {
    if body.username == "taken" {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Username already exists" })),
        )
            .into_response();
    }
    StatusCode::CREATED.into_response()
}

async fn handle_channels(State(server): State<TestServer>, headers: HeaderMap) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer tok");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(server.channels.lock().await.clone()).into_response()
}

async fn handle_messages(State(server): State<TestServer>, Path(id): Path<i64>) -> Response {
    server.pass_gate(&format!("messages/{id}")).await;
    if id == 3 {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "Forbidden" }))).into_response();
    }
    let messages = server
        .messages
        .lock()
        .await
        .get(&id)
        .cloned()
        .unwrap_or_default();
    Json(messages).into_response()
}

async fn handle_send(State(server): State<TestServer>, Json(body): Json<Value>) -> Json<Value> {
    server.sent.lock().await.push(body);
    Json(json!({ "ok": true }))
}

async fn handle_mark_read(
    State(server): State<TestServer>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(last) = body.get("lastMessageId").and_then(Value::as_i64) {
        server.last_read.lock().await.insert(id, last);
    }
    server.read_marks.lock().await.push((id, body));
    StatusCode::OK
}

async fn handle_unread(State(server): State<TestServer>) -> Json<HashMap<String, u32>> {
    Json(server.unread.lock().await.clone())
}

async fn handle_last_read(State(server): State<TestServer>, Path(id): Path<i64>) -> Json<Value> {
    let last = server.last_read.lock().await.get(&id).copied();
    Json(json!({ "last_read_message_id": last }))
}

async fn handle_members(State(server): State<TestServer>, Path(id): Path<i64>) -> Json<Vec<User>> {
    server.pass_gate(&format!("members/{id}")).await;
    Json(server.roster.lock().await.clone())
}

async fn handle_users() -> Json<Vec<User>> {
    Json(vec![user("1", "me"), user("2", "bob"), user("3", "carol")])
}

async fn handle_events(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(server): State<TestServer>,
) -> Response {
    if query.get("token").map(String::as_str) != Some("tok") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut frames = server.frames.subscribe();
    ws.on_upgrade(move |mut socket| async move {
        while let Ok(frame) = frames.recv().await {
            if socket.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    })
}

/// Channel 2 is a group listed first, so it is selected after login.
/// Channel 3 answers message loads with 403.
async fn spawn_chat_server() -> (String, TestServer) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (frames, _) = broadcast::channel(64);
    let server = TestServer {
        channels: Arc::new(Mutex::new(vec![
            channel(2, "team", true),
            channel(1, "general", false),
            channel(3, "secret", false),
        ])),
        messages: Arc::new(Mutex::new(HashMap::from([
            (1, vec![message(1, 1, "bob"), message(2, 1, "bob")]),
            (2, vec![message(5, 2, "me")]),
        ]))),
        unread: Arc::new(Mutex::new(HashMap::from([
            ("1".to_string(), 3),
            ("2".to_string(), 1),
            ("3".to_string(), 0),
        ]))),
        last_read: Arc::new(Mutex::new(HashMap::new())),
        sent: Arc::new(Mutex::new(Vec::new())),
        read_marks: Arc::new(Mutex::new(Vec::new())),
        roster: Arc::new(Mutex::new(vec![user("1", "me"), user("2", "bob")])),
        gates: Arc::new(Mutex::new(HashMap::new())),
        frames,
    };
    let app = Router::new()
        .route("/", get(handle_events))
        .route("/login", post(handle_login))
        .route("/register", post(handle_register))
        .route("/channels", get(handle_channels))
        .route("/channels/:id/members", get(handle_members))
        .route("/channels/:id/last-read", get(handle_last_read))
        .route("/messages", post(handle_send))
        .route("/messages/unread-counts", get(handle_unread))
        .route("/messages/:id", get(handle_messages))
        .route("/messages/:id/read", post(handle_mark_read))
        .route("/users", get(handle_users))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server)
}

fn client_for(
    url: &str,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
) -> Arc<ChatClient> {
    let settings = ClientSettings {
        api_base_url: Some(url.to_string()),
        ..ClientSettings::default()
    };
    ChatClient::new(&settings, store, notifier).expect("client")
}

async fn logged_in_client(url: &str) -> (Arc<ChatClient>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let client = client_for(url, Arc::new(MemoryStore::new()), notifier.clone());
    client
        .login(Credentials::new("me", "secret"))
        .await
        .expect("login");
    (client, notifier)
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    want: impl Fn(&ClientEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
}

fn push(server: &TestServer, frame: Value) {
    server
        .frames
        .send(frame.to_string())
        .expect("event socket subscribed");
}

#[tokio::test]
async fn login_syncs_channels_selection_counts_and_stream() {
    let (url, server) = spawn_chat_server().await;
    let store = Arc::new(MemoryStore::new());
    let client = client_for(&url, store.clone(), Arc::new(RecordingNotifier::default()));

    client
        .login(Credentials::new("me", "secret"))
        .await
        .expect("login");

    assert!(client.is_authenticated().await);
    assert_eq!(store.get(TOKEN_KEY).expect("store"), Some("tok".to_string()));
    assert_eq!(client.channels().await.len(), 3);
    assert_eq!(client.selected_channel_id().await, Some(ChannelId(2)));
    let loaded: Vec<_> = client
        .messages_for_selected_channel()
        .await
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(loaded, vec![MessageId(5)]);
    assert_eq!(client.members_for_selected_channel().await.len(), 2);
    assert_eq!(client.users().await.len(), 3);
    assert_eq!(client.connection_state().await, ConnectionState::Open);

    // The server still counts one unread for the selected channel; the
    // local view never does.
    assert_eq!(client.unread_count(ChannelId(2)).await, 0);
    assert_eq!(client.unread_count(ChannelId(1)).await, 3);
    assert_eq!(client.last_read_message_id(ChannelId(2)).await, Some(MessageId(5)));
    assert_eq!(
        server.read_marks.lock().await.clone(),
        vec![(2, json!({ "lastMessageId": 5 }))]
    );
}

#[tokio::test]
async fn selecting_channel_acknowledges_its_newest_message() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    assert_eq!(client.unread_count(ChannelId(1)).await, 3);

    client.select_channel(ChannelId(1)).await.expect("select");

    assert_eq!(client.selected_channel_id().await, Some(ChannelId(1)));
    assert_eq!(client.messages_for_selected_channel().await.len(), 2);
    assert_eq!(client.last_read_message_id(ChannelId(1)).await, Some(MessageId(2)));
    assert_eq!(client.unread_count(ChannelId(1)).await, 0);
    // Channel 2 was fully read already, so leaving it posts nothing.
    let marks = server.read_marks.lock().await.clone();
    assert_eq!(
        marks,
        vec![
            (2, json!({ "lastMessageId": 5 })),
            (1, json!({ "lastMessageId": 2 })),
        ]
    );
}

#[tokio::test]
async fn selecting_forbidden_channel_is_quiet() {
    let (url, _server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    client.select_channel(ChannelId(3)).await.expect("select");

    assert!(client.messages_for_selected_channel().await.is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::Error(_)), "unexpected {event:?}");
    }
}

#[tokio::test]
async fn select_rejects_unknown_channel_and_missing_session() {
    let (url, _server) = spawn_chat_server().await;
    let idle = client_for(
        &url,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
    );
    assert!(matches!(
        idle.select_channel(ChannelId(1)).await,
        Err(ClientError::NotAuthenticated)
    ));

    let (client, _) = logged_in_client(&url).await;
    assert!(matches!(
        client.select_channel(ChannelId(42)).await,
        Err(ClientError::Validation(_))
    ));
    assert_eq!(client.selected_channel_id().await, Some(ChannelId(2)));
}

#[tokio::test]
async fn send_message_carries_reply_and_clears_it() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;

    let parent = client.messages(ChannelId(2)).await[0].clone();
    client.start_reply(parent).await;
    client.send_message("  hi  ").await.expect("send");

    assert_eq!(
        server.sent.lock().await.clone(),
        vec![json!({ "channelId": 2, "text": "hi", "replyToId": 5 })]
    );
    assert!(client.reply_context().await.is_none());

    assert!(matches!(
        client.send_message("   ").await,
        Err(ClientError::Validation(_))
    ));
    assert_eq!(server.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn pushed_message_counts_unread_and_notifies() {
    let (url, server) = spawn_chat_server().await;
    let (client, notifier) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    push(
        &server,
        json!({ "type": "new_message", "data": message(7, 1, "bob") }),
    );
    wait_for(&mut events, |e| *e == ClientEvent::UnreadUpdated).await;

    assert_eq!(client.unread_count(ChannelId(1)).await, 4);
    assert_eq!(client.messages(ChannelId(1)).await.len(), 1);
    let requests = notifier.requests.lock().expect("requests").clone();
    assert_eq!(
        requests,
        vec![NotificationRequest {
            channel_id: ChannelId(1),
            title: "bob #general".into(),
            body: "text 7".into(),
        }]
    );
}

#[tokio::test]
async fn presence_snapshot_replaces_online_users() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    push(
        &server,
        json!({ "type": "user_list_update", "data": [{ "id": 2, "username": "bob" }] }),
    );
    wait_for(&mut events, |e| *e == ClientEvent::PresenceUpdated).await;

    let online = client.online_users().await;
    assert_eq!(online, vec![user("2", "bob")]);
}

#[tokio::test]
async fn malformed_frame_does_not_break_the_stream() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    server
        .frames
        .send("{oops".to_string())
        .expect("event socket subscribed");
    push(
        &server,
        json!({ "type": "channel_created", "data": { "id": 4, "name": "new", "isGroup": false } }),
    );
    wait_for(&mut events, |e| *e == ClientEvent::ChannelsUpdated).await;

    assert_eq!(client.channels().await.len(), 4);
    assert_eq!(client.connection_state().await, ConnectionState::Open);
}

#[tokio::test]
async fn deleting_selected_channel_loads_the_fallback() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    push(&server, json!({ "type": "channel_deleted", "id": 2 }));
    wait_for(&mut events, |e| {
        *e == ClientEvent::MessagesUpdated {
            channel_id: ChannelId(1),
        }
    })
    .await;

    assert_eq!(client.selected_channel_id().await, Some(ChannelId(1)));
    assert!(client.messages(ChannelId(2)).await.is_empty());
    assert_eq!(client.messages_for_selected_channel().await.len(), 2);
}

#[tokio::test]
async fn logout_returns_to_initial_state() {
    let (url, _server) = spawn_chat_server().await;
    let store = Arc::new(MemoryStore::new());
    let client = client_for(&url, store.clone(), Arc::new(RecordingNotifier::default()));
    client
        .login(Credentials::new("me", "secret"))
        .await
        .expect("login");

    client.logout().await;

    assert!(!client.is_authenticated().await);
    assert!(client.current_user().await.is_none());
    assert!(client.channels().await.is_empty());
    assert_eq!(client.selected_channel_id().await, None);
    assert!(client.unread_counts().await.is_empty());
    assert!(client.online_users().await.is_empty());
    assert!(client.users().await.is_empty());
    assert_eq!(client.connection_state().await, ConnectionState::Closed);
    assert_eq!(client.api_base_url().await, url);
    assert_eq!(store.get(TOKEN_KEY).expect("store"), None);
    assert_eq!(store.get(USER_KEY).expect("store"), None);
}

#[tokio::test]
async fn login_failure_surfaces_server_text_or_fallback() {
    let (url, _server) = spawn_chat_server().await;
    let client = client_for(
        &url,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
    );

    match client.login(Credentials::new("me", "wrong")).await {
        Err(ClientError::Auth(text)) => assert_eq!(text, "Invalid credentials"),
        other => panic!("unexpected {other:?}"),
    }
    match client.login(Credentials::new("me", "silent")).await {
        Err(ClientError::Auth(text)) => assert_eq!(text, crate::LOGIN_FAILED),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!client.is_authenticated().await);
}

#[tokio::test]
async fn register_conflict_is_a_validation_error() {
    let (url, _server) = spawn_chat_server().await;
    let client = client_for(
        &url,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
    );

    client
        .register(Credentials::new("fresh", "pw"))
        .await
        .expect("register");
    match client.register(Credentials::new("taken", "pw")).await {
        Err(ClientError::Validation(text)) => assert_eq!(text, "Username already exists"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn persisted_session_resumes_without_login() {
    let (url, _server) = spawn_chat_server().await;
    let store = Arc::new(MemoryStore::new());
    store
        .set(USER_KEY, &serde_json::to_string(&user("1", "me")).expect("user"))
        .expect("store");
    store.set(TOKEN_KEY, "tok").expect("store");

    let client = client_for(&url, store, Arc::new(RecordingNotifier::default()));
    assert!(client.is_authenticated().await);
    assert!(client.resume().await);

    assert_eq!(client.channels().await.len(), 3);
    assert_eq!(client.connection_state().await, ConnectionState::Open);
}

#[tokio::test]
async fn base_url_update_keeps_session() {
    let (url, _server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;

    let updated = client
        .update_api_base_url("10.0.0.2", 4000)
        .await
        .expect("update");

    assert_eq!(updated, "http://10.0.0.2:4000");
    assert_eq!(client.api_base_url().await, "http://10.0.0.2:4000");
    assert!(client.is_authenticated().await);
}

#[tokio::test]
async fn late_message_load_for_abandoned_channel_is_discarded() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let gate = server.hold("messages/1").await;
    let mut events = client.subscribe_events();

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.select_channel(ChannelId(1)).await })
    };
    wait_for(&mut events, |e| {
        *e == ClientEvent::SelectionChanged(Some(ChannelId(1)))
    })
    .await;

    client.select_channel(ChannelId(2)).await.expect("select 2");
    gate.notify_one();
    pending.await.expect("join").expect("select 1");

    assert_eq!(client.selected_channel_id().await, Some(ChannelId(2)));
    assert!(client.messages(ChannelId(1)).await.is_empty());
    let loaded: Vec<_> = client
        .messages_for_selected_channel()
        .await
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(loaded, vec![MessageId(5)]);
    while let Ok(event) = events.try_recv() {
        assert_ne!(
            event,
            ClientEvent::MessagesUpdated {
                channel_id: ChannelId(1)
            }
        );
    }
}

#[tokio::test]
async fn late_roster_for_abandoned_channel_is_discarded() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    assert_eq!(client.members_for_selected_channel().await.len(), 2);

    server.roster.lock().await.push(user("3", "carol"));
    let gate = server.hold("members/2").await;
    let mut events = client.subscribe_events();

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.fetch_members(ChannelId(2)).await })
    };
    // Let the roster request reach the server before moving away.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.select_channel(ChannelId(1)).await.expect("select 1");
    gate.notify_one();
    pending.await.expect("join").expect("fetch members");

    let roster_len = client
        .inner
        .lock()
        .await
        .channels
        .members(ChannelId(2))
        .map(<[User]>::len);
    assert_eq!(roster_len, Some(2));
    while let Ok(event) = events.try_recv() {
        assert_ne!(
            event,
            ClientEvent::MembersUpdated {
                channel_id: ChannelId(2)
            }
        );
    }
}

#[tokio::test]
async fn leaving_channel_with_new_messages_flushes_its_read_mark() {
    let (url, server) = spawn_chat_server().await;
    let (client, _) = logged_in_client(&url).await;
    let mut events = client.subscribe_events();

    // Arrives in the selected channel with the server's stored timestamp
    // format, so it is neither counted nor acknowledged yet.
    push(
        &server,
        json!({
            "type": "new_message",
            "data": {
                "id": 8,
                "channelId": 2,
                "user": "bob",
                "text": "late news",
                "timestamp": "2024-05-01 12:34:56"
            }
        }),
    );
    wait_for(&mut events, |e| {
        *e == ClientEvent::MessagesUpdated {
            channel_id: ChannelId(2),
        }
    })
    .await;
    assert_eq!(client.unread_count(ChannelId(2)).await, 0);
    let newest = client
        .messages(ChannelId(2))
        .await
        .last()
        .cloned()
        .expect("message");
    assert_eq!(newest.id, MessageId(8));
    assert_eq!(newest.timestamp.to_rfc3339(), "2024-05-01T12:34:56+00:00");

    client.select_channel(ChannelId(1)).await.expect("select");

    assert_eq!(
        server.read_marks.lock().await.clone(),
        vec![
            (2, json!({ "lastMessageId": 5 })),
            (2, json!({ "lastMessageId": 8 })),
            (1, json!({ "lastMessageId": 2 })),
        ]
    );
    assert_eq!(
        client.last_read_message_id(ChannelId(2)).await,
        Some(MessageId(8))
    );
}
