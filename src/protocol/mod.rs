//! Venue wire protocols.
//!
//! A [`Protocol`] is picked once when a connection is set up and decides how
//! frames are built and classified for the lifetime of that connection.

mod gemini;
mod lbank;
mod markets;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::{
    config::SyncConfig,
    errors::SyncResult,
    order_book::BookLevel,
    types::{BookSide, EventKind, Nonce, Symbol},
};

pub use gemini::Gemini;
pub use lbank::Lbank;
pub use markets::MarketTable;

/// Capabilities every venue protocol provides to the engine.
pub trait StreamProtocol {
    fn venue(&self) -> &'static str;

    fn supports(&self, kind: EventKind) -> bool;

    /// Whether every frame carries a connection-wide sequence number.
    fn requires_sequence(&self) -> bool;

    /// Whether the venue answers subscribe/unsubscribe with ack frames.
    fn sends_acks(&self) -> bool;

    /// Frame to send for a subscribe request, if the venue needs one.
    fn subscribe_frame(&self, symbol: &Symbol, kind: EventKind, nonce: Nonce)
        -> SyncResult<Option<Value>>;

    /// Frame to send for an unsubscribe request, if the venue needs one.
    fn unsubscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        nonce: Nonce,
    ) -> SyncResult<Option<Value>>;

    fn classify(&self, message: &Value) -> Frame;

    fn stream_url(&self, config: &SyncConfig) -> SyncResult<Url>;

    fn wait_after_connect(&self, _config: &SyncConfig) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Protocol {
    Lbank(Lbank),
    Gemini(Gemini),
}

impl Protocol {
    fn inner(&self) -> &dyn StreamProtocol {
        match self {
            Protocol::Lbank(protocol) => protocol,
            Protocol::Gemini(protocol) => protocol,
        }
    }
}

impl From<Lbank> for Protocol {
    fn from(value: Lbank) -> Self {
        Protocol::Lbank(value)
    }
}

impl From<Gemini> for Protocol {
    fn from(value: Gemini) -> Self {
        Protocol::Gemini(value)
    }
}

impl StreamProtocol for Protocol {
    fn venue(&self) -> &'static str {
        self.inner().venue()
    }

    fn supports(&self, kind: EventKind) -> bool {
        self.inner().supports(kind)
    }

    fn requires_sequence(&self) -> bool {
        self.inner().requires_sequence()
    }

    fn sends_acks(&self) -> bool {
        self.inner().sends_acks()
    }

    fn subscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.inner().subscribe_frame(symbol, kind, nonce)
    }

    fn unsubscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.inner().unsubscribe_frame(symbol, kind, nonce)
    }

    fn classify(&self, message: &Value) -> Frame {
        self.inner().classify(message)
    }

    fn stream_url(&self, config: &SyncConfig) -> SyncResult<Url> {
        self.inner().stream_url(config)
    }

    fn wait_after_connect(&self, config: &SyncConfig) -> Option<Duration> {
        self.inner().wait_after_connect(config)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence: Option<u64>,
    pub inbound: Inbound,
}

impl Frame {
    pub fn new(inbound: Inbound) -> Self {
        Self {
            sequence: None,
            inbound,
        }
    }

    pub fn sequenced(sequence: Option<u64>, inbound: Inbound) -> Self {
        Self { sequence, inbound }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack {
        symbol: Symbol,
        success: bool,
    },
    Snapshot {
        symbol: Symbol,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: Option<i64>,
    },
    Update(BookUpdate),
    Heartbeat,
    Unrecognized {
        symbol: Option<Symbol>,
        reason: String,
    },
}

impl Inbound {
    pub(crate) fn unrecognized(symbol: Option<Symbol>, reason: impl Into<String>) -> Self {
        Inbound::Unrecognized {
            symbol,
            reason: reason.into(),
        }
    }
}

/// Incremental changes and trades carried by one update message.
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub symbol: Symbol,
    /// Empty the book before applying `changes`.
    pub reset: bool,
    pub timestamp: Option<i64>,
    pub event_id: Option<u64>,
    pub changes: Vec<BookChange>,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookChange {
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub id: String,
    pub symbol: Symbol,
    pub timestamp: Option<i64>,
    /// `None` for auction fills.
    pub maker_side: Option<BookSide>,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
}

/// Reads a finite number from a JSON number or numeric string.
pub(crate) fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Reads `[[price, size], ...]` into levels.
pub(crate) fn levels(value: Option<&Value>) -> Result<Vec<BookLevel>, String> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| format!("expected level array, got {value}"))?;
    entries
        .iter()
        .map(|entry| {
            let pair = entry.as_array().filter(|pair| pair.len() >= 2);
            match pair {
                Some(pair) => match (number(&pair[0]), number(&pair[1])) {
                    (Some(price), Some(size)) => Ok(BookLevel::new(price, size)),
                    _ => Err(format!("invalid level {entry}")),
                },
                None => Err(format!("invalid level {entry}")),
            }
        })
        .collect()
}
