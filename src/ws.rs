//! Socket driver feeding a [`StreamDispatcher`].
//!
//! Reconnecting is left to the caller. The outbound receiver paired with the
//! dispatcher's [`ChannelTransport`](crate::transport::ChannelTransport) stays
//! with the caller and is lent to each [`WsSession::run`], so once a run
//! returns a new session can be connected and run against the same
//! dispatcher and receiver.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{
    config::SyncConfig,
    dispatcher::StreamDispatcher,
    errors::SyncResult,
    protocol::{Protocol, StreamProtocol},
};

#[derive(Debug)]
pub struct WsSession {
    url: Url,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    wait_after_connect: Option<Duration>,
}

impl WsSession {
    pub async fn connect(protocol: &Protocol, config: &SyncConfig) -> SyncResult<Self> {
        let url = protocol.stream_url(config)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        tracing::info!(%url, venue = protocol.venue(), "connected");
        Ok(Self {
            url,
            stream,
            wait_after_connect: protocol.wait_after_connect(config),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Pumps frames both ways until the socket ends. `outbound` is the
    /// receiving half of the transport handed to `dispatcher`; frames left
    /// over from an earlier session are discarded before the stream opens.
    pub async fn run(
        mut self,
        dispatcher: &mut StreamDispatcher,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> SyncResult<()> {
        let stale = std::iter::from_fn(|| outbound.try_recv().ok()).count();
        if stale > 0 {
            tracing::debug!(url = %self.url, stale, "discarding frames from previous session");
        }
        dispatcher.on_open();
        if let Some(wait) = self.wait_after_connect {
            tokio::time::sleep(wait).await;
        }
        let result = self.pump(dispatcher, outbound).await;
        dispatcher.on_close();
        if let Err(err) = &result {
            tracing::warn!(url = %self.url, error = %err, "stream ended with error");
        }
        result
    }

    async fn pump(
        &mut self,
        dispatcher: &mut StreamDispatcher,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> SyncResult<()> {
        loop {
            tokio::select! {
                inbound = self.stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => dispatcher.on_message(&text),
                    Some(Ok(Message::Binary(binary))) => {
                        dispatcher.on_message(&String::from_utf8_lossy(&binary));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        self.stream.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(url = %self.url, ?frame, "closed by venue");
                        return Ok(());
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        tracing::debug!(url = %self.url, %frame, "sending frame");
                        self.stream.send(Message::Text(frame)).await?;
                    }
                    None => {
                        self.stream.close(None).await?;
                        return Ok(());
                    }
                },
            }
        }
    }
}
