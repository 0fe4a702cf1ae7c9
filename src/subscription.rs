//! Subscribe/unsubscribe requests and their acknowledgements.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::{
    context::ConnectionState,
    dispatcher::StreamEvent,
    errors::{SyncError, SyncResult},
    order_book::BookSnapshot,
    pending::{AckOutcome, ResolvedRequest},
    protocol::StreamProtocol,
    types::{Direction, EventKind, Nonce, Symbol},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Cap on the depth of published books.
    pub limit: Option<usize>,
}

impl SubscribeOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

/// Completion of one subscribe or unsubscribe request.
#[derive(Debug)]
pub struct PendingAck {
    symbol: Symbol,
    nonce: Nonce,
    direction: Direction,
    receiver: oneshot::Receiver<AckOutcome>,
    resolved: Option<AckOutcome>,
}

impl PendingAck {
    fn new(
        symbol: Symbol,
        nonce: Nonce,
        direction: Direction,
        receiver: oneshot::Receiver<AckOutcome>,
    ) -> Self {
        Self {
            symbol,
            nonce,
            direction,
            receiver,
            resolved: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Waits for the request to finish. Later calls return the same outcome.
    pub async fn outcome(&mut self) -> AckOutcome {
        if let Some(outcome) = self.resolved {
            return outcome;
        }
        // a dropped sender means the registry went away with the connection
        let outcome = (&mut self.receiver)
            .await
            .unwrap_or(AckOutcome::Cancelled);
        self.resolved = Some(outcome);
        outcome
    }

    pub async fn wait(&mut self) -> SyncResult<()> {
        match self.outcome().await {
            AckOutcome::Acknowledged => Ok(()),
            AckOutcome::Rejected => Err(SyncError::SubscriptionRejected {
                symbol: self.symbol.clone(),
                nonce: self.nonce,
            }),
            AckOutcome::TimedOut => Err(SyncError::RequestTimeout {
                symbol: self.symbol.clone(),
                nonce: self.nonce,
            }),
            AckOutcome::Cancelled => Err(SyncError::ConnectionClosed),
        }
    }
}

/// Returned by [`SubscriptionController::subscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    kind: EventKind,
    ack: PendingAck,
}

impl SubscriptionHandle {
    pub fn symbol(&self) -> &Symbol {
        self.ack.symbol()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn nonce(&self) -> Nonce {
        self.ack.nonce()
    }

    pub async fn acknowledged(&mut self) -> SyncResult<()> {
        self.ack.wait().await
    }
}

/// Issues requests for one connection. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionController {
    state: Arc<ConnectionState>,
}

impl SubscriptionController {
    pub(crate) fn new(state: Arc<ConnectionState>) -> Self {
        Self { state }
    }

    pub fn subscribe(
        &self,
        symbol: impl Into<Symbol>,
        kind: EventKind,
        options: SubscribeOptions,
    ) -> SyncResult<SubscriptionHandle> {
        let nonce = self.state.next_nonce();
        self.subscribe_with_nonce(symbol, kind, nonce, options)
    }

    pub fn subscribe_with_nonce(
        &self,
        symbol: impl Into<Symbol>,
        kind: EventKind,
        nonce: Nonce,
        options: SubscribeOptions,
    ) -> SyncResult<SubscriptionHandle> {
        let symbol = symbol.into();
        self.ensure_usable(kind)?;
        let frame = self.state.protocol.subscribe_frame(&symbol, kind, nonce)?;

        self.state.ensure_context(&symbol, |context| {
            if kind == EventKind::OrderBook {
                context.set_limit(options.limit);
            }
        });
        let receiver = match self.register(&symbol, kind, Direction::Subscribe, nonce) {
            Ok(receiver) => receiver,
            Err(err) => {
                self.state.prune(&symbol);
                return Err(err);
            }
        };
        self.dispatch(frame, &symbol, kind, Direction::Subscribe, nonce)?;
        tracing::debug!(symbol = %symbol, nonce = %nonce, %kind, "subscribe requested");

        Ok(SubscriptionHandle {
            kind,
            ack: PendingAck::new(symbol, nonce, Direction::Subscribe, receiver),
        })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> SyncResult<PendingAck> {
        let nonce = self.state.next_nonce();
        self.unsubscribe_with_nonce(handle.symbol().clone(), handle.kind(), nonce)
    }

    pub fn unsubscribe_with_nonce(
        &self,
        symbol: impl Into<Symbol>,
        kind: EventKind,
        nonce: Nonce,
    ) -> SyncResult<PendingAck> {
        let symbol = symbol.into();
        self.ensure_usable(kind)?;
        let frame = self.state.protocol.unsubscribe_frame(&symbol, kind, nonce)?;

        let receiver = self.register(&symbol, kind, Direction::Unsubscribe, nonce)?;
        self.dispatch(frame, &symbol, kind, Direction::Unsubscribe, nonce)?;
        tracing::debug!(symbol = %symbol, nonce = %nonce, %kind, "unsubscribe requested");

        Ok(PendingAck::new(symbol, nonce, Direction::Unsubscribe, receiver))
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.state.events.subscribe()
    }

    /// Last known book for `symbol`, without waiting for the next push.
    pub fn current_book(&self, symbol: &Symbol, limit: Option<usize>) -> Option<BookSnapshot> {
        self.state.current_book(symbol, limit)
    }

    pub fn pending(&self, symbol: &Symbol, direction: Direction) -> Vec<Nonce> {
        self.state.registry.pending(symbol, direction)
    }

    fn ensure_usable(&self, kind: EventKind) -> SyncResult<()> {
        if self.state.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        if !self.state.protocol.supports(kind) {
            return Err(SyncError::UnsupportedEvent {
                venue: self.state.protocol.venue(),
                kind,
            });
        }
        Ok(())
    }

    fn register(
        &self,
        symbol: &Symbol,
        kind: EventKind,
        direction: Direction,
        nonce: Nonce,
    ) -> SyncResult<oneshot::Receiver<AckOutcome>> {
        let state = Arc::downgrade(&self.state);
        self.state.registry.register(
            symbol.clone(),
            kind,
            direction,
            nonce,
            self.state.request_timeout,
            move |resolved| {
                // the lost request only leaves bookkeeping behind
                if let Some(state) = state.upgrade() {
                    state.prune(&resolved.symbol);
                }
            },
        )
    }

    fn dispatch(
        &self,
        frame: Option<Value>,
        symbol: &Symbol,
        kind: EventKind,
        direction: Direction,
        nonce: Nonce,
    ) -> SyncResult<()> {
        if let Some(frame) = frame {
            if let Err(err) = self.state.transport.send(frame.to_string()) {
                self.state.registry.resolve(symbol, direction, nonce, false);
                self.state.prune(symbol);
                return Err(err);
            }
        }
        if !self.state.protocol.sends_acks() {
            // Nothing will answer: the context goes live now and the caller
            // is signalled from a separate task.
            self.state.confirm(&ResolvedRequest {
                nonce,
                symbol: symbol.clone(),
                kind,
                direction,
                outcome: AckOutcome::Acknowledged,
            });
            let state = Arc::clone(&self.state);
            let symbol = symbol.clone();
            tokio::spawn(async move {
                state.registry.resolve(&symbol, direction, nonce, true);
                state.prune(&symbol);
            });
        }
        Ok(())
    }
}
