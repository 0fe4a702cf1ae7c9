//! Outbound side of a connection.

use tokio::sync::mpsc;

use crate::errors::{SyncError, SyncResult};

/// Sends serialized frames to the venue.
///
/// `send` must not block; implementations hand the frame to whatever task
/// owns the socket.
pub trait Transport: Send + Sync {
    fn send(&self, frame: String) -> SyncResult<()>;
}

/// Transport backed by an unbounded channel drained by the socket task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> SyncResult<()> {
        self.sender
            .send(frame)
            .map_err(|_| SyncError::Transport("outbound channel closed".to_string()))
    }
}
