//! In-memory engine link for tests and non-process contexts.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EngineConnector, EngineLink, LinkEvent, TransportError};
use crate::settings::EngineSettings;

/// The far end of an in-memory link: what a real engine would see.
pub struct MockPeer {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MockPeer {
    /// Next frame the client wrote, `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    pub fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.outgoing
            .send(frame.into())
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Drops both directions; the client observes an unexpected close.
    pub fn close(self) {}
}

/// Builds a connected link/peer pair backed by channels.
pub fn link_pair() -> (EngineLink, MockPeer) {
    let (outbound_tx, from_client_rx) = mpsc::unbounded_channel::<String>();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();

    let forward = tokio::spawn(async move {
        while let Some(frame) = to_client_rx.recv().await {
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
        let _ = event_tx.send(LinkEvent::Closed);
    });

    let link = EngineLink::from_parts(outbound_tx, inbound_rx, event_rx, None, vec![forward]);
    let peer = MockPeer {
        incoming: from_client_rx,
        outgoing: to_client_tx,
    };
    (link, peer)
}

/// Connector that hands each established peer to the test harness, so a
/// test can script one engine per connection (including reconnects).
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl EngineConnector for MockConnector {
    async fn connect(&self, _settings: &EngineSettings) -> Result<EngineLink, TransportError> {
        let (link, peer) = link_pair();
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Setup("mock peer receiver dropped".into()))?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pair_round_trip() {
        let (mut link, mut peer) = link_pair();
        let sender = link.sender();
        let mut inbound = link.take_inbound().expect("inbound taken once");

        sender.send("ping".to_string()).expect("client send");
        assert_eq!(peer.recv().await.as_deref(), Some("ping"));

        peer.send("pong").expect("peer send");
        assert_eq!(inbound.recv().await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn closing_the_peer_signals_the_link() {
        let (mut link, peer) = link_pair();
        let mut events = link.take_events().expect("events taken once");
        peer.close();
        assert_eq!(events.recv().await, Some(LinkEvent::Closed));
    }
}
