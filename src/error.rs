//! Client error taxonomy. Nothing here is fatal: every variant ends up as a user notice.

use thiserror::Error;

use crate::types::Channel;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Stream connect/read failure or unexpected close. Never retried automatically.
    #[error("{channel} stream failed: {reason}")]
    Transport { channel: Channel, reason: String },

    /// Backend answered `success: false`.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Malformed user input caught before any request is sent.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("request to {url} failed with status={status}")]
    Status { url: String, status: u16 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ClientError::Validation(msg.into())
    }

    pub fn transport(channel: Channel, reason: impl ToString) -> Self {
        ClientError::Transport {
            channel,
            reason: reason.to_string(),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
