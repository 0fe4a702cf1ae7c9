//! Inbound side of a connection.
//!
//! [`StreamDispatcher`] consumes raw frames strictly in arrival order,
//! checks sequence ids when the venue provides them, routes acks to the
//! pending-request registry and applies book data to the symbol contexts.
//! Every book it publishes is a depth-limited copy of the live book.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    config::SyncConfig,
    context::ConnectionState,
    errors::StreamError,
    order_book::{BookLevel, BookSnapshot},
    protocol::{BookUpdate, Inbound, Protocol, StreamProtocol, Trade},
    sequence::{SequenceCheck, SequenceGuard},
    subscription::SubscriptionController,
    timings::time_block,
    transport::Transport,
    types::{ConnectionId, Direction, EventKind, Symbol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Closed,
}

/// Published to every receiver of [`StreamDispatcher::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Book {
        symbol: Symbol,
        book: BookSnapshot,
    },
    Trade {
        symbol: Symbol,
        trade: Trade,
    },
    Error {
        symbol: Option<Symbol>,
        error: StreamError,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Book { .. } => "book",
            StreamEvent::Trade { .. } => "trade",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            StreamEvent::Book { symbol, .. } | StreamEvent::Trade { symbol, .. } => Some(symbol),
            StreamEvent::Error { symbol, .. } => symbol.as_ref(),
        }
    }
}

pub struct StreamDispatcher {
    state: Arc<ConnectionState>,
    phase: ConnectionPhase,
    last_sequence: Option<u64>,
}

impl StreamDispatcher {
    pub fn new(
        connection: ConnectionId,
        protocol: impl Into<Protocol>,
        transport: Arc<dyn Transport>,
        config: &SyncConfig,
    ) -> Self {
        let state = ConnectionState::new(
            connection,
            protocol.into(),
            transport,
            config.request_timeout(),
            config.event_capacity,
        );
        Self {
            state: Arc::new(state),
            phase: ConnectionPhase::Connecting,
            last_sequence: None,
        }
    }

    pub fn controller(&self) -> SubscriptionController {
        SubscriptionController::new(Arc::clone(&self.state))
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.state.events.subscribe()
    }

    pub fn connection(&self) -> ConnectionId {
        self.state.connection
    }

    pub fn protocol(&self) -> &Protocol {
        &self.state.protocol
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn current_book(&self, symbol: &Symbol, limit: Option<usize>) -> Option<BookSnapshot> {
        self.state.current_book(symbol, limit)
    }

    pub fn on_open(&mut self) {
        self.phase = ConnectionPhase::Open;
        self.last_sequence = None;
        self.state.set_closed(false);
        tracing::info!(
            connection = %self.state.connection,
            venue = self.state.protocol.venue(),
            "connection open"
        );
    }

    /// Tears the connection down: pending requests are cancelled and every
    /// symbol context is dropped.
    pub fn on_close(&mut self) {
        self.phase = ConnectionPhase::Closed;
        self.last_sequence = None;
        self.state.set_closed(true);
        let cancelled = self.state.registry.cancel_all();
        self.state.contexts.lock().clear();
        tracing::info!(
            connection = %self.state.connection,
            cancelled = cancelled.len(),
            "connection closed"
        );
    }

    pub fn on_message(&mut self, text: &str) {
        if self.phase != ConnectionPhase::Open {
            tracing::debug!(phase = ?self.phase, "dropping frame outside open phase");
            return;
        }

        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                self.report(None, StreamError::ProtocolViolation(format!("invalid json: {err}")));
                return;
            }
        };

        let frame = self.state.protocol.classify(&message);
        if self.state.protocol.requires_sequence() {
            let Some(sequence) = frame.sequence else {
                self.report(
                    inbound_symbol(&frame.inbound),
                    StreamError::ProtocolViolation("frame without sequence id".to_string()),
                );
                return;
            };
            if let SequenceCheck::Gap { expected, received } =
                SequenceGuard::check(&mut self.last_sequence, sequence)
            {
                tracing::warn!(
                    connection = %self.state.connection,
                    expected,
                    received,
                    "sequence gap"
                );
                self.report(
                    inbound_symbol(&frame.inbound),
                    StreamError::SequenceGap { expected, received },
                );
                return;
            }
        }

        match frame.inbound {
            Inbound::Ack { symbol, success } => self.handle_ack(&symbol, success),
            Inbound::Snapshot {
                symbol,
                bids,
                asks,
                timestamp,
            } => self.handle_snapshot(symbol, bids, asks, timestamp),
            Inbound::Update(update) => self.handle_update(update),
            Inbound::Heartbeat => {
                tracing::trace!(connection = %self.state.connection, "heartbeat");
            }
            Inbound::Unrecognized { symbol, reason } => {
                tracing::warn!(connection = %self.state.connection, %reason, "unrecognized frame");
                self.report(symbol, StreamError::ProtocolViolation(reason));
            }
        }
    }

    /// One ack settles every subscribe pending for the symbol, or every
    /// unsubscribe when no subscribe was pending.
    fn handle_ack(&self, symbol: &Symbol, success: bool) {
        let registry = &self.state.registry;
        let mut resolved = registry.resolve_all(symbol, Direction::Subscribe, success);
        if resolved.is_empty() {
            resolved = registry.resolve_all(symbol, Direction::Unsubscribe, success);
        }
        if resolved.is_empty() {
            tracing::debug!(symbol = %symbol, success, "unsolicited ack");
            return;
        }
        for request in &resolved {
            self.state.confirm(request);
        }
    }

    fn handle_snapshot(
        &self,
        symbol: Symbol,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: Option<i64>,
    ) {
        let published = self
            .state
            .with_context(&symbol, |context| {
                let limit = context.limit();
                let book = context.book_for_update()?;
                time_block("apply_snapshot", &symbol, || book.apply_snapshot(bids, asks));
                if let Some(timestamp) = timestamp {
                    book.set_timestamp(timestamp);
                }
                Some(book.snapshot(limit))
            })
            .flatten();

        match published {
            Some(book) => self.state.publish(StreamEvent::Book { symbol, book }),
            None => tracing::debug!(symbol = %symbol, "dropping book for inactive symbol"),
        }
    }

    fn handle_update(&self, update: BookUpdate) {
        let BookUpdate {
            symbol,
            reset,
            timestamp,
            event_id,
            changes,
            trades,
        } = update;

        let routed = self.state.with_context(&symbol, |context| {
            let trades_active = context.is_active(EventKind::Trade);
            let limit = context.limit();
            let book = context.book_for_update().map(|book| {
                time_block("apply_update", &symbol, || {
                    if reset {
                        book.reset();
                    }
                    if let Some(timestamp) = timestamp {
                        book.set_timestamp(timestamp);
                    }
                    if let Some(event_id) = event_id {
                        book.set_sequence(event_id);
                    }
                    for change in &changes {
                        book.apply_delta(change.side, change.price, change.size);
                    }
                });
                book.snapshot(limit)
            });
            (trades_active, book)
        });

        let Some((trades_active, book)) = routed else {
            tracing::debug!(symbol = %symbol, "dropping update for unknown symbol");
            return;
        };
        if trades_active {
            for trade in trades {
                self.state.publish(StreamEvent::Trade {
                    symbol: symbol.clone(),
                    trade,
                });
            }
        }
        if let Some(book) = book {
            self.state.publish(StreamEvent::Book { symbol, book });
        }
    }

    fn report(&self, symbol: Option<Symbol>, error: StreamError) {
        self.state.publish(StreamEvent::Error { symbol, error });
    }
}

fn inbound_symbol(inbound: &Inbound) -> Option<Symbol> {
    match inbound {
        Inbound::Ack { symbol, .. } | Inbound::Snapshot { symbol, .. } => Some(symbol.clone()),
        Inbound::Update(update) => Some(update.symbol.clone()),
        Inbound::Unrecognized { symbol, .. } => symbol.clone(),
        Inbound::Heartbeat => None,
    }
}
