use reqwest::StatusCode;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Bb7Err>;

#[derive(Error, Debug)]
pub enum Bb7Err {
    /// Another turn holds the stream slot.
    #[error("Another request is already in progress")]
    Busy,

    #[error("No chat is active")]
    NoActiveChat,

    /// The user canceled the in-flight turn.
    #[error("Response aborted by user.")]
    Aborted,

    /// The transport hit its deadline before the stream finished.
    #[error("Request timed out.")]
    Timeout,

    /// The SSE stream disconnected or misbehaved **after** the HTTP
    /// handshake succeeded.
    #[error("stream error: {0}")]
    Stream(String),

    /// Unexpected HTTP status code.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("{0}")]
    InvalidRequest(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
