//! Error types for the Player

use thiserror::Error;

/// Result type for Player operations
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Errors that can occur while driving or operating a [`crate::player::Player`]
#[derive(Debug, Error)]
pub enum PlayerError {
    /// `New` called with an empty base or remote address
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Control operation attempted from a disallowed state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `Play`/`Record` attempted with no cassette loaded
    #[error("no cassette loaded")]
    CassetteNotLoaded,

    /// `Play(name)` when the cassette has no such record
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// `Read` past the last Exchange of a Record
    #[error("end of record")]
    EndOfRecord,

    /// Cassette read/write failure
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Cassette JSON (de)serialization failure
    #[error("cassette format error: {0}")]
    CassetteFormat(#[from] serde_json::Error),

    /// Outbound HTTP failure with no response body
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// A request or response exceeded a configured resource limit
    /// (`max_body_size` or `max_headers`)
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Outbound HTTP client transport failure (connect/DNS/etc.)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl PlayerError {
    /// The Player-error response code this error maps to when synthesized
    /// from within the proxy loop, given the state the dispatch was running
    /// in (`state_label` is one of `"play"`, `"record"`, or any other value
    /// for the generic case).
    #[must_use]
    pub fn response_code(&self, state_label: &str) -> u16 {
        match state_label {
            "play" => 551,
            "record" => 552,
            _ => 550,
        }
    }
}
