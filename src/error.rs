//! Crate-level error type.
//!
//! Only transport-layer failures surface as errors. Parsing problems (a
//! corrupt SSE record, a half-streamed plan block, an envelope whose JSON has
//! not finished arriving) are absorbed where they happen and traced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MouthpieceError {
    /// The endpoint replied with a non-2xx status before any chunk was read.
    #[error("API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// The request could not be sent or the connection failed before a
    /// response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection broke while the body was being streamed.
    #[error("stream error: {0}")]
    Stream(String),

    /// A whole-response payload could not be decoded.
    #[error("JSON error in {context}: {detail}")]
    Json { context: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} not set. Export it or pass it via the config file.")]
    MissingApiKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MouthpieceError {
    pub fn json(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        MouthpieceError::Json {
            context: context.into(),
            detail: err.to_string(),
        }
    }

    /// Whether this failure came from the network side (as opposed to a
    /// local configuration problem).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MouthpieceError::Api { .. } | MouthpieceError::Transport(_) | MouthpieceError::Stream(_)
        )
    }
}

impl From<reqwest::Error> for MouthpieceError {
    fn from(e: reqwest::Error) -> Self {
        MouthpieceError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MouthpieceError>;
