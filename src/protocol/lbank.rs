//! LBank-style protocol: symbols multiplexed on one socket, explicit acks,
//! full-depth pushes and no sequence numbers.

use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use super::{levels, number, Frame, Inbound, MarketTable, StreamProtocol};
use crate::{
    config::SyncConfig,
    errors::{SyncError, SyncResult},
    types::{EventKind, Nonce, Symbol},
};

const DEPTH_SEGMENT: &str = "depth";
const DEPTH_LEVELS: u32 = 60;

#[derive(Debug, Clone)]
pub struct Lbank {
    markets: MarketTable,
}

impl Lbank {
    pub fn new(markets: MarketTable) -> Self {
        Self { markets }
    }

    pub fn markets(&self) -> &MarketTable {
        &self.markets
    }

    fn channel(&self, symbol: &Symbol) -> SyncResult<String> {
        let id = self.markets.market_id(symbol)?;
        Ok(format!("lh_sub_spot_{id}_{DEPTH_SEGMENT}_{DEPTH_LEVELS}"))
    }

    fn ensure_supported(&self, kind: EventKind) -> SyncResult<()> {
        if self.supports(kind) {
            Ok(())
        } else {
            Err(SyncError::UnsupportedEvent {
                venue: self.venue(),
                kind,
            })
        }
    }

    /// Symbol of a `lh_sub_spot_<base>_<quote>_depth_<n>` channel.
    fn depth_symbol(&self, parts: &[&str]) -> Result<Symbol, String> {
        let id = format!("{}_{}", parts[3], parts[4]);
        self.markets
            .symbol(&id)
            .ok_or_else(|| format!("unknown market {id}"))
    }
}

impl StreamProtocol for Lbank {
    fn venue(&self) -> &'static str {
        "lbank"
    }

    fn supports(&self, kind: EventKind) -> bool {
        kind == EventKind::OrderBook
    }

    fn requires_sequence(&self) -> bool {
        false
    }

    fn sends_acks(&self) -> bool {
        true
    }

    fn subscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        _nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.ensure_supported(kind)?;
        Ok(Some(json!({
            "event": "addChannel",
            "channel": self.channel(symbol)?,
        })))
    }

    fn unsubscribe_frame(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        nonce: Nonce,
    ) -> SyncResult<Option<Value>> {
        self.ensure_supported(kind)?;
        Ok(Some(json!({
            "event": "removeChannel",
            "channel": self.channel(symbol)?,
            "id": nonce,
        })))
    }

    fn classify(&self, message: &Value) -> Frame {
        let Some(channel) = message.get("channel").and_then(Value::as_str) else {
            return Frame::new(Inbound::unrecognized(None, "lbank frame without channel"));
        };
        let parts: Vec<&str> = channel.split('_').collect();
        let is_depth = parts.len() > 5 && parts[5] == DEPTH_SEGMENT;

        if let Some(flag) = message.get("success") {
            let Some(success) = parse_flag(flag) else {
                return Frame::new(Inbound::unrecognized(
                    None,
                    format!("invalid success flag {flag}"),
                ));
            };
            if !is_depth {
                return Frame::new(Inbound::unrecognized(
                    None,
                    format!("ack for unknown channel {channel}"),
                ));
            }
            return match self.depth_symbol(&parts) {
                Ok(symbol) => Frame::new(Inbound::Ack { symbol, success }),
                Err(reason) => Frame::new(Inbound::unrecognized(None, reason)),
            };
        }

        if parts.len() <= 5 {
            return Frame::new(Inbound::unrecognized(
                None,
                format!("invalid channel {channel}"),
            ));
        }
        if !is_depth {
            return Frame::new(Inbound::unrecognized(
                None,
                format!("unsupported channel {channel}"),
            ));
        }

        let symbol = match self.depth_symbol(&parts) {
            Ok(symbol) => symbol,
            Err(reason) => return Frame::new(Inbound::unrecognized(None, reason)),
        };
        let sides = levels(message.get("bids")).and_then(|bids| {
            levels(message.get("asks")).map(|asks| (bids, asks))
        });
        match sides {
            Ok((bids, asks)) => Frame::new(Inbound::Snapshot {
                symbol,
                bids,
                asks,
                timestamp: message
                    .get("timestamp")
                    .and_then(number)
                    .map(|millis| millis as i64),
            }),
            Err(reason) => Frame::new(Inbound::unrecognized(Some(symbol), reason)),
        }
    }

    fn stream_url(&self, config: &SyncConfig) -> SyncResult<Url> {
        Ok(Url::parse(&config.lbank.base_url)?)
    }

    fn wait_after_connect(&self, config: &SyncConfig) -> Option<Duration> {
        let millis = config.lbank.wait_after_connect_ms;
        (millis > 0).then(|| Duration::from_millis(millis))
    }
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
