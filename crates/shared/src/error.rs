use serde::{Deserialize, Serialize};

/// Error body returned by the chat server: `{"error": "..."}`. Some
/// handlers use `message` instead, so both are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Human readable text, if the server supplied any.
    pub fn text(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}
