//! REST surface of the chat server.

use std::{collections::HashMap, time::Duration};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Channel, ChannelId, Message, MessageId, User, UserId},
    error::ApiErrorBody,
    protocol::{
        AutoLoginRequest, CreateChannelRequest, CreateGroupChannelRequest, LastReadResponse,
        LoginRequest, LoginResponse, MarkReadRequest, MembersRequest, RegisterRequest,
        RenameChannelRequest, SendMessageRequest, UnreadCountsResponse,
    },
};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// What an authenticated request needs, captured from the session when the
/// request is issued. `epoch` lets the caller check the session is still
/// the same one when the response lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub base_url: String,
    pub token: String,
    pub epoch: u64,
}

/// A non-success response.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub text: Option<String>,
}

impl Rejection {
    pub fn into_error(self) -> ClientError {
        let message = self.text.unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        ClientError::Server {
            status: self.status.as_u16(),
            message,
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
}

impl ApiClient {
    pub fn new(request_timeout: Duration) -> ClientResult<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }

    async fn send_mapped(
        &self,
        request: RequestBuilder,
        map: impl FnOnce(Rejection) -> ClientError,
    ) -> ClientResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.text().map(str::to_string),
            Err(err) => {
                debug!(status = status.as_u16(), "api: error body unreadable: {err}");
                None
            }
        };
        Err(map(Rejection { status, text }))
    }

    async fn send(&self, request: RequestBuilder) -> ClientResult<Response> {
        self.send_mapped(request, Rejection::into_error).await
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        Ok(self.send(request).await?.json().await?)
    }

    fn get(&self, ctx: &AuthContext, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", ctx.base_url))
            .bearer_auth(&ctx.token)
    }

    fn post(&self, ctx: &AuthContext, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", ctx.base_url))
            .bearer_auth(&ctx.token)
    }

    fn put(&self, ctx: &AuthContext, path: &str) -> RequestBuilder {
        self.http
            .put(format!("{}{path}", ctx.base_url))
            .bearer_auth(&ctx.token)
    }

    fn delete(&self, ctx: &AuthContext, path: &str) -> RequestBuilder {
        self.http
            .delete(format!("{}{path}", ctx.base_url))
            .bearer_auth(&ctx.token)
    }

    pub async fn register(&self, base_url: &str, body: &RegisterRequest) -> ClientResult<()> {
        self.send_mapped(
            self.http.post(format!("{base_url}/register")).json(body),
            |rejection| {
                ClientError::Validation(
                    rejection
                        .text
                        .unwrap_or_else(|| crate::REGISTRATION_FAILED.to_string()),
                )
            },
        )
        .await?;
        Ok(())
    }

    pub async fn login(&self, base_url: &str, body: &LoginRequest) -> ClientResult<LoginResponse> {
        let response = self
            .send_mapped(
                self.http.post(format!("{base_url}/login")).json(body),
                |rejection| {
                    ClientError::Auth(
                        rejection
                            .text
                            .unwrap_or_else(|| crate::LOGIN_FAILED.to_string()),
                    )
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn auto_login(&self, base_url: &str, id: &str) -> ClientResult<LoginResponse> {
        self.fetch(
            self.http
                .post(format!("{base_url}/login/auto"))
                .json(&AutoLoginRequest { id: id.to_string() }),
        )
        .await
    }

    pub async fn channels(&self, ctx: &AuthContext) -> ClientResult<Vec<Channel>> {
        self.fetch(self.get(ctx, "/channels")).await
    }

    pub async fn create_channel(&self, ctx: &AuthContext, name: &str) -> ClientResult<()> {
        self.send(self.post(ctx, "/channels").json(&CreateChannelRequest {
            name: name.to_string(),
        }))
        .await?;
        Ok(())
    }

    pub async fn create_group_channel(
        &self,
        ctx: &AuthContext,
        name: &str,
        member_ids: &[UserId],
    ) -> ClientResult<()> {
        self.send(
            self.post(ctx, "/channels/group")
                .json(&CreateGroupChannelRequest {
                    name: name.to_string(),
                    member_ids: member_ids.to_vec(),
                }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_channel(&self, ctx: &AuthContext, id: ChannelId) -> ClientResult<()> {
        self.send(self.delete(ctx, &format!("/channels/{id}")))
            .await?;
        Ok(())
    }

    pub async fn rename_channel(
        &self,
        ctx: &AuthContext,
        id: ChannelId,
        name: &str,
    ) -> ClientResult<()> {
        self.send(
            self.put(ctx, &format!("/channels/{id}/name"))
                .json(&RenameChannelRequest {
                    name: name.to_string(),
                }),
        )
        .await?;
        Ok(())
    }

    pub async fn channel_members(&self, ctx: &AuthContext, id: ChannelId) -> ClientResult<Vec<User>> {
        self.fetch(self.get(ctx, &format!("/channels/{id}/members")))
            .await
    }

    pub async fn add_members(
        &self,
        ctx: &AuthContext,
        id: ChannelId,
        user_ids: &[UserId],
    ) -> ClientResult<()> {
        self.send(
            self.post(ctx, &format!("/channels/{id}/members"))
                .json(&MembersRequest {
                    user_ids: user_ids.to_vec(),
                }),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_members(
        &self,
        ctx: &AuthContext,
        id: ChannelId,
        user_ids: &[UserId],
    ) -> ClientResult<()> {
        self.send(
            self.delete(ctx, &format!("/channels/{id}/members"))
                .json(&MembersRequest {
                    user_ids: user_ids.to_vec(),
                }),
        )
        .await?;
        Ok(())
    }

    pub async fn last_read(
        &self,
        ctx: &AuthContext,
        id: ChannelId,
    ) -> ClientResult<Option<MessageId>> {
        let body: LastReadResponse = self
            .fetch(self.get(ctx, &format!("/channels/{id}/last-read")))
            .await?;
        Ok(body.last_read_message_id)
    }

    /// A 403 means the user is no longer a member of the channel.
    pub async fn messages(&self, ctx: &AuthContext, channel_id: ChannelId) -> ClientResult<Vec<Message>> {
        let response = self
            .send_mapped(
                self.get(ctx, &format!("/messages/{channel_id}")),
                |rejection| {
                    if rejection.status == StatusCode::FORBIDDEN {
                        ClientError::AccessDenied
                    } else {
                        rejection.into_error()
                    }
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn send_message(&self, ctx: &AuthContext, body: &SendMessageRequest) -> ClientResult<()> {
        self.send(self.post(ctx, "/messages").json(body)).await?;
        Ok(())
    }

    pub async fn delete_message(&self, ctx: &AuthContext, id: MessageId) -> ClientResult<()> {
        self.send(self.delete(ctx, &format!("/messages/{id}")))
            .await?;
        Ok(())
    }

    pub async fn mark_read(
        &self,
        ctx: &AuthContext,
        channel_id: ChannelId,
        last_message_id: MessageId,
    ) -> ClientResult<()> {
        self.send(
            self.post(ctx, &format!("/messages/{channel_id}/read"))
                .json(&MarkReadRequest { last_message_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn unread_counts(&self, ctx: &AuthContext) -> ClientResult<HashMap<ChannelId, u32>> {
        let raw: UnreadCountsResponse = self.fetch(self.get(ctx, "/messages/unread-counts")).await?;
        let mut counts = HashMap::with_capacity(raw.len());
        for (key, count) in raw {
            match key.parse::<i64>() {
                Ok(id) => {
                    counts.insert(ChannelId(id), count);
                }
                Err(_) => warn!("api: skipping unread count for non-numeric channel '{key}'"),
            }
        }
        Ok(counts)
    }

    pub async fn users(&self, ctx: &AuthContext) -> ClientResult<Vec<User>> {
        self.fetch(self.get(ctx, "/users")).await
    }
}
