//! Per-connection state shared by the dispatcher, the subscription
//! controller and expiry callbacks.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    dispatcher::StreamEvent,
    order_book::{BookSnapshot, OrderBook},
    pending::{AckOutcome, NonceTimeoutRegistry, ResolvedRequest},
    protocol::Protocol,
    transport::Transport,
    types::{ConnectionId, Direction, EventKind, Nonce, Symbol},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub connection: ConnectionId,
    pub symbol: Symbol,
}

/// Book, depth limit and confirmed event kinds of one symbol.
#[derive(Debug, Default)]
pub struct SymbolContext {
    book: Option<OrderBook>,
    limit: Option<usize>,
    active: HashSet<EventKind>,
}

impl SymbolContext {
    pub fn is_active(&self, kind: EventKind) -> bool {
        self.active.contains(&kind)
    }

    pub fn activate(&mut self, kind: EventKind) {
        self.active.insert(kind);
    }

    /// Deactivating the order book also drops it.
    pub fn deactivate(&mut self, kind: EventKind) {
        self.active.remove(&kind);
        if kind == EventKind::OrderBook {
            self.book = None;
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn book(&self) -> Option<&OrderBook> {
        self.book.as_ref()
    }

    /// Live book for incoming data, created on first use once the order
    /// book subscription is confirmed.
    pub fn book_for_update(&mut self) -> Option<&mut OrderBook> {
        if !self.is_active(EventKind::OrderBook) {
            return None;
        }
        Some(self.book.get_or_insert_with(OrderBook::new))
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }
}

pub(crate) struct ConnectionState {
    pub connection: ConnectionId,
    pub protocol: Protocol,
    pub transport: Arc<dyn Transport>,
    pub registry: NonceTimeoutRegistry,
    pub contexts: Mutex<HashMap<SymbolKey, SymbolContext>>,
    pub events: broadcast::Sender<StreamEvent>,
    pub request_timeout: Duration,
    next_nonce: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionState {
    pub fn new(
        connection: ConnectionId,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            connection,
            protocol,
            transport,
            registry: NonceTimeoutRegistry::new(),
            contexts: Mutex::new(HashMap::new()),
            events,
            request_timeout,
            next_nonce: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self, symbol: &Symbol) -> SymbolKey {
        SymbolKey {
            connection: self.connection,
            symbol: symbol.clone(),
        }
    }

    pub fn next_nonce(&self) -> Nonce {
        Nonce::new(self.next_nonce.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    pub fn with_context<R>(
        &self,
        symbol: &Symbol,
        f: impl FnOnce(&mut SymbolContext) -> R,
    ) -> Option<R> {
        let mut contexts = self.contexts.lock();
        contexts.get_mut(&self.key(symbol)).map(f)
    }

    pub fn ensure_context<R>(&self, symbol: &Symbol, f: impl FnOnce(&mut SymbolContext) -> R) -> R {
        let mut contexts = self.contexts.lock();
        f(contexts.entry(self.key(symbol)).or_default())
    }

    /// Drops the context once nothing is active and no subscribe is in flight.
    pub fn prune(&self, symbol: &Symbol) {
        // registry lock is released before the context lock is taken
        if !self.registry.pending(symbol, Direction::Subscribe).is_empty() {
            return;
        }
        let key = self.key(symbol);
        let mut contexts = self.contexts.lock();
        if contexts.get(&key).is_some_and(SymbolContext::is_idle) {
            contexts.remove(&key);
            tracing::debug!(symbol = %symbol, "dropped symbol context");
        }
    }

    /// Applies the bookkeeping of a finished request to its symbol context.
    pub fn confirm(&self, resolved: &ResolvedRequest) {
        let symbol = &resolved.symbol;
        match (resolved.direction, resolved.outcome) {
            (Direction::Subscribe, AckOutcome::Acknowledged) => {
                self.ensure_context(symbol, |context| context.activate(resolved.kind));
                tracing::info!(
                    symbol = %symbol,
                    nonce = %resolved.nonce,
                    kind = %resolved.kind,
                    "subscription confirmed"
                );
            }
            (Direction::Unsubscribe, AckOutcome::Acknowledged) => {
                self.with_context(symbol, |context| context.deactivate(resolved.kind));
                self.prune(symbol);
                tracing::info!(
                    symbol = %symbol,
                    nonce = %resolved.nonce,
                    kind = %resolved.kind,
                    "unsubscribed"
                );
            }
            (direction, AckOutcome::Rejected) => {
                tracing::warn!(
                    symbol = %symbol,
                    nonce = %resolved.nonce,
                    %direction,
                    "request rejected by venue"
                );
                if direction == Direction::Subscribe {
                    self.prune(symbol);
                }
            }
            (_, AckOutcome::TimedOut | AckOutcome::Cancelled) => {}
        }
    }

    pub fn current_book(&self, symbol: &Symbol, limit: Option<usize>) -> Option<BookSnapshot> {
        let contexts = self.contexts.lock();
        contexts
            .get(&self.key(symbol))
            .and_then(SymbolContext::book)
            .map(|book| book.snapshot(limit))
    }

    pub fn publish(&self, event: StreamEvent) {
        // no receivers is not an error for a market data feed
        let _ = self.events.send(event);
    }
}
