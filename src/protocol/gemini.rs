//! Gemini-style protocol: one market per socket, selected through the stream
//! URL, with connection-wide `socket_sequence` numbers and incremental
//! `change` events.

use serde_json::Value;
use url::Url;

use super::{number, BookChange, BookUpdate, Frame, Inbound, MarketTable, StreamProtocol, Trade};
use crate::{
    config::SyncConfig,
    errors::{SyncError, SyncResult},
    types::{BookSide, EventKind, MarketId, Nonce, Symbol},
};

const STREAM_PARAMS: [(&str, &str); 4] = [
    ("heartbeat", "true"),
    ("bids", "true"),
    ("offers", "true"),
    ("trades", "true"),
];

#[derive(Debug, Clone)]
pub struct Gemini {
    symbol: Symbol,
    market: MarketId,
}

impl Gemini {
    pub fn new(symbol: impl Into<Symbol>, markets: &MarketTable) -> SyncResult<Self> {
        let symbol = symbol.into();
        let market = markets.market_id(&symbol)?;
        Ok(Self { symbol, market })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn market(&self) -> &MarketId {
        &self.market
    }

    /// The socket carries only the market it was opened for.
    fn ensure_supported(&self, symbol: &Symbol, kind: EventKind) -> SyncResult<()> {
        if !self.supports(kind) {
            return Err(SyncError::UnsupportedEvent {
                venue: self.venue(),
                kind,
            });
        }
        if symbol != &self.symbol {
            return Err(SyncError::InvalidMarket(symbol.to_string()));
        }
        Ok(())
    }

    fn parse_update(&self, message: &Value) -> Result<BookUpdate, String> {
        let events = match message.get("events") {
            None | Some(Value::Null) => &[][..],
            Some(Value::Array(events)) => events.as_slice(),
            Some(other) => return Err(format!("expected events array, got {other}")),
        };

        let mut update = BookUpdate {
            symbol: self.symbol.clone(),
            reset: false,
            timestamp: None,
            event_id: message.get("eventId").and_then(Value::as_u64),
            changes: Vec::new(),
            trades: Vec::new(),
        };

        if let Some(first) = events.first() {
            if event_type(first) == Some("change") {
                if first.get("reason").and_then(Value::as_str) == Some("initial") {
                    update.reset = true;
                } else {
                    update.timestamp = message
                        .get("timestamp")
                        .and_then(number)
                        .map(|seconds| (seconds * 1000.0) as i64);
                }
            }
        }

        let trade_timestamp = message.get("timestampms").and_then(Value::as_i64);
        for event in events {
            match event_type(event) {
                Some("change") => update.changes.push(parse_change(event)?),
                Some("trade") => update
                    .trades
                    .push(self.parse_trade(event, trade_timestamp)?),
                // auctions and anything newer the venue adds
                _ => {}
            }
        }
        Ok(update)
    }

    fn parse_trade(&self, event: &Value, timestamp: Option<i64>) -> Result<Trade, String> {
        let id = match event.get("tid") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => return Err(format!("trade without tid: {event}")),
        };
        let (Some(price), Some(amount)) = (
            event.get("price").and_then(number),
            event.get("amount").and_then(number),
        ) else {
            return Err(format!("invalid trade {event}"));
        };
        Ok(Trade {
            id,
            symbol: self.symbol.clone(),
            timestamp,
            maker_side: event
                .get("makerSide")
                .and_then(Value::as_str)
                .and_then(BookSide::parse),
            price,
            amount,
            cost: price * amount,
        })
    }
}

fn event_type(event: &Value) -> Option<&str> {
    event.get("type").and_then(Value::as_str)
}

fn parse_change(event: &Value) -> Result<BookChange, String> {
    let side = event
        .get("side")
        .and_then(Value::as_str)
        .and_then(BookSide::parse);
    match (
        side,
        event.get("price").and_then(number),
        event.get("remaining").and_then(number),
    ) {
        (Some(side), Some(price), Some(size)) => Ok(BookChange { side, price, size }),
        _ => Err(format!("invalid change event {event}")),
    }
}

impl StreamProtocol for Gemini {
    fn venue(&self) -> &'static str {
        "gemini"
    }

    fn supports(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::OrderBook | EventKind::Trade)
    }

    fn requires_sequence(&self) -> bool {
        true
    }

    fn sends_acks(&self) -> bool {
        false
    }

    fn subscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        _nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.ensure_supported(symbol, kind)?;
        Ok(None)
    }

    fn unsubscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        _nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.ensure_supported(symbol, kind)?;
        Ok(None)
    }

    fn classify(&self, message: &Value) -> Frame {
        let sequence = message.get("socket_sequence").and_then(Value::as_u64);
        let inbound = match message.get("type").and_then(Value::as_str) {
            Some("heartbeat") => Inbound::Heartbeat,
            Some("update") => match self.parse_update(message) {
                Ok(update) => Inbound::Update(update),
                Err(reason) => Inbound::unrecognized(Some(self.symbol.clone()), reason),
            },
            Some(other) => Inbound::unrecognized(
                Some(self.symbol.clone()),
                format!("unknown message type {other}"),
            ),
            None => Inbound::unrecognized(None, "gemini frame without type"),
        };
        Frame::sequenced(sequence, inbound)
    }

    fn stream_url(&self, config: &SyncConfig) -> SyncResult<Url> {
        let mut url = Url::parse(&config.gemini.base_url)?.join(self.market.as_str())?;
        url.query_pairs_mut().extend_pairs(STREAM_PARAMS);
        Ok(url)
    }
}
