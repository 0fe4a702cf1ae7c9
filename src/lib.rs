//! Real-time order-book synchronization for venue websocket streams.
//!
//! A [`StreamDispatcher`] owns one connection's inbound processing. Requests
//! go through its [`SubscriptionController`], books and trades come back on
//! the broadcast channel returned by [`StreamDispatcher::events`].

pub mod config;
mod context;
pub mod dispatcher;
pub mod errors;
pub mod order_book;
pub mod pending;
pub mod protocol;
pub mod sequence;
pub mod subscription;
pub(crate) mod timings;
pub mod transport;
pub mod types;
pub mod ws;

pub use config::SyncConfig;
pub use context::{SymbolContext, SymbolKey};
pub use dispatcher::{ConnectionPhase, StreamDispatcher, StreamEvent};
pub use errors::{StreamError, SyncError, SyncResult};
pub use order_book::{BookLevel, BookSnapshot, OrderBook};
pub use pending::{AckOutcome, NonceTimeoutRegistry, ResolvedRequest};
pub use protocol::{Gemini, Lbank, MarketTable, Protocol, StreamProtocol, Trade};
pub use sequence::{SequenceCheck, SequenceGuard};
pub use subscription::{PendingAck, SubscribeOptions, SubscriptionController, SubscriptionHandle};
pub use transport::{ChannelTransport, Transport};
pub use types::{BookSide, ConnectionId, Direction, EventKind, MarketId, Nonce, Symbol};
pub use ws::WsSession;
