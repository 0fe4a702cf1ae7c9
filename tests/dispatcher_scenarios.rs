use std::{sync::Arc, time::Duration};

use book_sync::{
    BookLevel, ChannelTransport, ConnectionId, Direction, EventKind, Gemini, Lbank, MarketTable,
    StreamDispatcher, StreamError, StreamEvent, SubscribeOptions, Symbol, SyncConfig, SyncError,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

const ETH_BTC_CHANNEL: &str = "lh_sub_spot_eth_btc_depth_60";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lbank() -> (StreamDispatcher, UnboundedReceiver<String>) {
    init_tracing();
    let (transport, outbound) = ChannelTransport::new();
    let mut dispatcher = StreamDispatcher::new(
        ConnectionId::new(1),
        Lbank::new(MarketTable::with_separator("_")),
        Arc::new(transport),
        &SyncConfig::default(),
    );
    dispatcher.on_open();
    (dispatcher, outbound)
}

fn gemini(symbol: &str) -> StreamDispatcher {
    init_tracing();
    let (transport, _) = ChannelTransport::new();
    let protocol = Gemini::new(symbol, &MarketTable::with_separator("")).unwrap();
    let mut dispatcher = StreamDispatcher::new(
        ConnectionId::new(2),
        protocol,
        Arc::new(transport),
        &SyncConfig::default(),
    );
    dispatcher.on_open();
    dispatcher
}

fn ack(success: bool) -> String {
    json!({"success": success.to_string(), "channel": ETH_BTC_CHANNEL}).to_string()
}

fn drain(events: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

fn levels(raw: &[(f64, f64)]) -> Vec<BookLevel> {
    raw.iter().copied().map(BookLevel::from).collect()
}

#[tokio::test]
async fn snapshot_then_delta_keeps_book_sorted() {
    let mut dispatcher = gemini("BTC/USD");
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let btc = Symbol::from("BTC/USD");

    let mut handle = controller
        .subscribe("BTC/USD", EventKind::OrderBook, SubscribeOptions::with_limit(5))
        .unwrap();
    handle.acknowledged().await.unwrap();

    dispatcher.on_message(
        &json!({
            "type": "update",
            "eventId": 1,
            "socket_sequence": 0,
            "events": [
                {"type": "change", "reason": "initial", "side": "bid", "price": "99", "remaining": "2"},
                {"type": "change", "reason": "initial", "side": "bid", "price": "100", "remaining": "1"},
                {"type": "change", "reason": "initial", "side": "ask", "price": "101", "remaining": "1"},
            ],
        })
        .to_string(),
    );
    let book = dispatcher.current_book(&btc, None).unwrap();
    assert_eq!(book.bids, levels(&[(100.0, 1.0), (99.0, 2.0)]));
    assert_eq!(book.asks, levels(&[(101.0, 1.0)]));
    assert_eq!(book.sequence, Some(1));

    dispatcher.on_message(
        &json!({
            "type": "update",
            "eventId": 2,
            "socket_sequence": 1,
            "timestamp": 1_700_000_000,
            "events": [
                {"type": "change", "reason": "cancel", "side": "bid", "price": "99", "remaining": "0"},
            ],
        })
        .to_string(),
    );
    let book = dispatcher.current_book(&btc, None).unwrap();
    assert_eq!(book.bids, levels(&[(100.0, 1.0)]));
    assert_eq!(book.timestamp, Some(1_700_000_000_000));

    let published = drain(&mut events);
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|event| event.kind() == "book"));
}

#[tokio::test]
async fn published_books_respect_limit() {
    let mut dispatcher = gemini("BTC/USD");
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    controller
        .subscribe("BTC/USD", EventKind::OrderBook, SubscribeOptions::with_limit(2))
        .unwrap();

    let changes: Vec<Value> = (0..4)
        .map(|i| json!({"type": "change", "reason": "initial", "side": "ask", "price": 101 + i, "remaining": 1}))
        .collect();
    dispatcher.on_message(
        &json!({"type": "update", "socket_sequence": 0, "events": changes}).to_string(),
    );

    let StreamEvent::Book { book, .. } = events.try_recv().unwrap() else {
        panic!("expected book");
    };
    assert_eq!(book.asks, levels(&[(101.0, 1.0), (102.0, 1.0)]));
    let full = dispatcher.current_book(&Symbol::from("BTC/USD"), None).unwrap();
    assert_eq!(full.asks.len(), 4);
}

#[tokio::test]
async fn one_ack_resolves_every_pending_subscribe() {
    let (mut dispatcher, mut outbound) = lbank();
    let controller = dispatcher.controller();

    let mut first = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    let mut second = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    assert_ne!(first.nonce(), second.nonce());
    assert_eq!(controller.pending(&Symbol::from("ETH/BTC"), Direction::Subscribe).len(), 2);

    for _ in 0..2 {
        let frame: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"event": "addChannel", "channel": ETH_BTC_CHANNEL}));
    }

    dispatcher.on_message(&ack(true));
    first.acknowledged().await.unwrap();
    second.acknowledged().await.unwrap();
    assert!(controller
        .pending(&Symbol::from("ETH/BTC"), Direction::Subscribe)
        .is_empty());
}

#[tokio::test]
async fn rejected_ack_fails_the_request() {
    let (mut dispatcher, _outbound) = lbank();
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let mut handle = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();

    dispatcher.on_message(&ack(false));
    assert!(matches!(
        handle.acknowledged().await,
        Err(SyncError::SubscriptionRejected { .. })
    ));

    dispatcher.on_message(
        &json!({"channel": ETH_BTC_CHANNEL, "bids": [[1, 1]], "asks": []}).to_string(),
    );
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out_and_cleans_up() {
    let (mut dispatcher, _outbound) = lbank();
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let eth = Symbol::from("ETH/BTC");
    let start = tokio::time::Instant::now();

    let mut handle = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    let result = handle.acknowledged().await;

    assert!(matches!(result, Err(SyncError::RequestTimeout { .. })));
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(controller
        .pending(&Symbol::from("ETH/BTC"), Direction::Subscribe)
        .is_empty());
    // the outcome is settled once and repeated waits see the same result
    assert!(matches!(
        handle.acknowledged().await,
        Err(SyncError::RequestTimeout { .. })
    ));

    // an ack arriving after the deadline settles nothing and opens no book
    dispatcher.on_message(&ack(true));
    dispatcher.on_message(
        &json!({"channel": ETH_BTC_CHANNEL, "bids": [["0.05", "3"]], "asks": [["0.06", "1"]]})
            .to_string(),
    );
    assert!(matches!(
        handle.acknowledged().await,
        Err(SyncError::RequestTimeout { .. })
    ));
    assert!(dispatcher.current_book(&eth, None).is_none());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn acked_venue_waits_for_ack_before_applying_data() {
    let (mut dispatcher, _outbound) = lbank();
    let controller = dispatcher.controller();
    let eth = Symbol::from("ETH/BTC");
    let snapshot =
        json!({"channel": ETH_BTC_CHANNEL, "bids": [["0.05", "3"]], "asks": [["0.06", "1"]]})
            .to_string();

    let mut handle = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    tokio::task::yield_now().await;
    dispatcher.on_message(&snapshot);
    assert!(dispatcher.current_book(&eth, None).is_none());
    assert_eq!(controller.pending(&eth, Direction::Subscribe).len(), 1);

    dispatcher.on_message(&ack(true));
    handle.acknowledged().await.unwrap();
    dispatcher.on_message(&snapshot);
    assert_eq!(
        dispatcher.current_book(&eth, None).unwrap().bids,
        levels(&[(0.05, 3.0)])
    );
}

#[tokio::test]
async fn gemini_rejects_markets_outside_its_stream() {
    let mut dispatcher = gemini("BTC/USD");
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let eth = Symbol::from("ETH/USD");

    let err = controller
        .subscribe("ETH/USD", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidMarket(symbol) if symbol == "ETH/USD"));
    assert!(controller.pending(&eth, Direction::Subscribe).is_empty());

    dispatcher.on_message(
        &json!({
            "type": "update",
            "socket_sequence": 0,
            "events": [
                {"type": "change", "reason": "initial", "side": "bid", "price": "100", "remaining": "1"},
            ],
        })
        .to_string(),
    );
    assert!(dispatcher.current_book(&eth, None).is_none());
    assert!(dispatcher.current_book(&Symbol::from("BTC/USD"), None).is_none());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn unsubscribe_ack_drops_the_book() {
    let (mut dispatcher, mut outbound) = lbank();
    let controller = dispatcher.controller();
    let eth = Symbol::from("ETH/BTC");

    let mut handle = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    dispatcher.on_message(&ack(true));
    handle.acknowledged().await.unwrap();
    dispatcher.on_message(
        &json!({"channel": ETH_BTC_CHANNEL, "bids": [["0.05", "3"]], "asks": [["0.06", "1"]]})
            .to_string(),
    );
    assert!(dispatcher.current_book(&eth, None).is_some());

    let mut pending = controller.unsubscribe(&handle).unwrap();
    let _subscribe = outbound.recv().await.unwrap();
    let frame: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(frame["event"], "removeChannel");
    assert_eq!(frame["id"], json!(pending.nonce().into_inner()));

    dispatcher.on_message(&ack(true));
    pending.wait().await.unwrap();
    assert!(dispatcher.current_book(&eth, None).is_none());
}

#[tokio::test]
async fn trades_published_only_when_subscribed() {
    let mut dispatcher = gemini("ETH/USD");
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let update = |sequence: u64| {
        json!({
            "type": "update",
            "socket_sequence": sequence,
            "timestampms": 1_700_000_000_500_i64,
            "events": [
                {"type": "trade", "tid": 9, "price": "2000", "amount": "0.5", "makerSide": "bid"},
            ],
        })
        .to_string()
    };

    let mut book = controller
        .subscribe("ETH/USD", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    book.acknowledged().await.unwrap();
    dispatcher.on_message(&update(0));
    let kinds: Vec<_> = drain(&mut events).iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["book"]);

    let mut trades = controller
        .subscribe("ETH/USD", EventKind::Trade, SubscribeOptions::default())
        .unwrap();
    trades.acknowledged().await.unwrap();
    dispatcher.on_message(&update(1));
    let published = drain(&mut events);
    let kinds: Vec<_> = published.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["trade", "book"]);
    let StreamEvent::Trade { trade, .. } = &published[0] else {
        panic!("expected trade first");
    };
    assert_eq!(trade.cost, 1000.0);
    assert_eq!(trade.timestamp, Some(1_700_000_000_500));
}

#[tokio::test]
async fn errors_do_not_stop_other_symbols() {
    let (mut dispatcher, _outbound) = lbank();
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    let mut handle = controller
        .subscribe("ETH/BTC", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();
    dispatcher.on_message(&ack(true));
    handle.acknowledged().await.unwrap();

    dispatcher.on_message(r#"{"channel":"lh_sub_spot"}"#);
    dispatcher.on_message(r#"{"channel":"lh_sub_spot_ltc_btc_depth_60","bids":[["bad"]]}"#);
    dispatcher.on_message(
        &json!({"channel": ETH_BTC_CHANNEL, "bids": [[0.05, 1]], "asks": []}).to_string(),
    );

    let published = drain(&mut events);
    let kinds: Vec<_> = published.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["error", "error", "book"]);
    assert!(matches!(
        &published[1],
        StreamEvent::Error {
            symbol: Some(symbol),
            error: StreamError::ProtocolViolation(_),
        } if symbol.as_str() == "LTC/BTC"
    ));
}

#[tokio::test]
async fn unsupported_kind_rejected_synchronously() {
    let (dispatcher, mut outbound) = lbank();
    let controller = dispatcher.controller();
    let err = controller
        .subscribe("ETH/BTC", EventKind::Trade, SubscribeOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::UnsupportedEvent {
            venue: "lbank",
            kind: EventKind::Trade
        }
    ));
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn sequence_gap_surfaces_without_self_healing() {
    let mut dispatcher = gemini("BTC/USD");
    let controller = dispatcher.controller();
    let mut events = dispatcher.events();
    controller
        .subscribe("BTC/USD", EventKind::OrderBook, SubscribeOptions::default())
        .unwrap();

    dispatcher.on_message(r#"{"type":"heartbeat","socket_sequence":0}"#);
    dispatcher.on_message(r#"{"type":"heartbeat","socket_sequence":2}"#);
    dispatcher.on_message(r#"{"type":"heartbeat","socket_sequence":3}"#);

    let published = drain(&mut events);
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|event| matches!(
        event,
        StreamEvent::Error {
            error: StreamError::SequenceGap { expected: 1, .. },
            ..
        }
    )));
}
