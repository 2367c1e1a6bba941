use hostd_common::{HostdError, Result};
use tokio::sync::mpsc;

/// Buffered messages per direction before senders wait.
pub const CHANNEL_BUFFER_SIZE: usize = 64;

/// One end of a bidirectional message channel.
///
/// The HTTP layer keeps one end and pumps it to and from a websocket; the
/// other end is handed to the operation's [`Connector`](crate::Connector).
#[derive(Debug)]
pub struct Channel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Channel {
    /// Create two connected ends.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        (
            Channel { tx: a_tx, rx: a_rx },
            Channel { tx: b_tx, rx: b_rx },
        )
    }

    pub async fn send(&self, message: Vec<u8>) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| HostdError::internal("Channel peer disconnected"))
    }

    /// Next message from the peer, `None` once the peer has gone away.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn split(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.tx, self.rx)
    }
}
