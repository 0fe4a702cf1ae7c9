use thiserror::Error;

use crate::types::{EventKind, Nonce, Symbol};

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Faults surfaced on the event stream rather than returned from a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} not supported by {venue}")]
    UnsupportedEvent { venue: &'static str, kind: EventKind },
    #[error("request {nonce} for {symbol} timed out")]
    RequestTimeout { symbol: Symbol, nonce: Nonce },
    #[error("request {nonce} for {symbol} rejected by venue")]
    SubscriptionRejected { symbol: Symbol, nonce: Nonce },
    #[error("nonce {nonce} already pending for {symbol}")]
    DuplicateNonce { symbol: Symbol, nonce: Nonce },
    #[error("no market id for symbol {0}")]
    InvalidMarket(String),
    #[error("request timers need a running tokio runtime")]
    NoRuntime,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
