use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad credentials. Carries text that can be shown to the user as is.
    #[error("{0}")]
    Auth(String),
    /// Rejected input (registration conflicts, blank names, empty messages).
    #[error("{0}")]
    Validation(String),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("access denied")]
    AccessDenied,
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] serde_json::Error),
    #[error("failed to connect event stream: {0}")]
    Connection(String),
    #[error("not logged in")]
    NotAuthenticated,
    #[error("no channel selected")]
    NoChannelSelected,
}

impl ClientError {
    /// Failures of background refreshes that the UI should not be bothered
    /// with.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::AccessDenied)
    }
}
