//! Transport abstraction for sync messages.
//!
//! A transport delivers [`SyncMessage`]s between peers. Implementations may
//! use WebSockets, HTTP, or anything else; the driver only needs this trait.

use std::time::Duration;

use async_trait::async_trait;

use covalue_core::PeerId;

use crate::error::Result;
use crate::messages::SyncMessage;

/// Transport trait for sending and receiving sync messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific peer.
    async fn send(&self, peer: &PeerId, message: SyncMessage) -> Result<()>;

    /// Receive the next message from any peer.
    ///
    /// Blocks until a message is available or the transport closes.
    async fn recv(&self) -> Result<(PeerId, SyncMessage)>;

    /// Receive with timeout. `None` if nothing arrived in time.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, SyncMessage)>>;

    /// Send a message to every connected peer.
    async fn broadcast(&self, message: SyncMessage) -> Result<()>;

    fn local_peer_id(&self) -> PeerId;

    async fn connected_peers(&self) -> Result<Vec<PeerId>>;

    async fn is_connected(&self, peer: &PeerId) -> bool;
}

/// In-memory transport over tokio channels.
///
/// Every message goes through the wire codec, so limits and encoding are
/// exercised exactly as over a real connection.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::{mpsc, RwLock};
    use tracing::trace;

    use crate::codec::{decode_message, encode_message};
    use crate::error::SyncError;

    const CHANNEL_CAPACITY: usize = 1000;

    #[derive(Debug)]
    struct Envelope {
        from: PeerId,
        bytes: Vec<u8>,
    }

    /// Shared routing table for a set of in-memory transports.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Join the network as `peer`.
        pub async fn create_transport(self: &Arc<Self>, peer: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            self.senders.write().await.insert(peer.clone(), tx);
            MemoryTransport {
                peer,
                network: Arc::clone(self),
                receiver: RwLock::new(rx),
            }
        }

        /// Drop `peer` from the network. Its receiver sees the channel close.
        pub async fn disconnect(&self, peer: &PeerId) {
            self.senders.write().await.remove(peer);
        }
    }

    /// One peer's end of a [`MemoryNetwork`].
    pub struct MemoryTransport {
        peer: PeerId,
        network: Arc<MemoryNetwork>,
        receiver: RwLock<mpsc::Receiver<Envelope>>,
    }

    impl MemoryTransport {
        fn envelope(&self, message: &SyncMessage) -> Result<Envelope> {
            Ok(Envelope {
                from: self.peer.clone(),
                bytes: encode_message(message)?,
            })
        }

        fn open(envelope: Envelope) -> Result<(PeerId, SyncMessage)> {
            let message = decode_message(&envelope.bytes)?;
            trace!(from = %envelope.from, action = message.action(), "delivered");
            Ok((envelope.from, message))
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &PeerId, message: SyncMessage) -> Result<()> {
            let envelope = self.envelope(&message)?;
            let sender = self
                .network
                .senders
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::PeerNotConnected(peer.to_string()))?;
            sender
                .send(envelope)
                .await
                .map_err(|_| SyncError::Transport(format!("{peer} disconnected")))
        }

        async fn recv(&self) -> Result<(PeerId, SyncMessage)> {
            let mut rx = self.receiver.write().await;
            match rx.recv().await {
                Some(envelope) => Self::open(envelope),
                None => Err(SyncError::Transport("channel closed".into())),
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, SyncMessage)>> {
            let mut rx = self.receiver.write().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => Self::open(envelope).map(Some),
                Ok(None) => Err(SyncError::Transport("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        async fn broadcast(&self, message: SyncMessage) -> Result<()> {
            let targets: Vec<mpsc::Sender<Envelope>> = self
                .network
                .senders
                .read()
                .await
                .iter()
                .filter(|(peer, _)| **peer != self.peer)
                .map(|(_, sender)| sender.clone())
                .collect();
            for sender in targets {
                // Peers may leave mid-broadcast.
                let _ = sender.send(self.envelope(&message)?).await;
            }
            Ok(())
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer.clone()
        }

        async fn connected_peers(&self) -> Result<Vec<PeerId>> {
            let senders = self.network.senders.read().await;
            Ok(senders
                .keys()
                .filter(|peer| **peer != self.peer)
                .cloned()
                .collect())
        }

        async fn is_connected(&self, peer: &PeerId) -> bool {
            self.network.senders.read().await.contains_key(peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::error::SyncError;
    use crate::messages::{DoneMessage, LoadMessage};
    use covalue_core::{CoValueId, KnownState};

    fn load() -> SyncMessage {
        SyncMessage::Load(LoadMessage::from(&KnownState::empty(CoValueId::from_bytes(
            [0xAA; 32],
        ))))
    }

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let b = network.create_transport(PeerId::from("b")).await;

        a.send(&PeerId::from("b"), load()).await.unwrap();

        let (from, received) = b.recv().await.unwrap();
        assert_eq!(from, PeerId::from("a"));
        assert_eq!(received, load());
    }

    #[tokio::test]
    async fn test_memory_transport_broadcast() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let b = network.create_transport(PeerId::from("b")).await;
        let c = network.create_transport(PeerId::from("c")).await;

        let done = SyncMessage::Done(DoneMessage {
            id: CoValueId::from_bytes([1; 32]),
        });
        a.broadcast(done.clone()).await.unwrap();

        assert_eq!(b.recv().await.unwrap().1, done);
        assert_eq!(c.recv().await.unwrap().1, done);
        assert_eq!(a.connected_peers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recv_timeout_and_disconnect() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let _b = network.create_transport(PeerId::from("b")).await;

        let nothing = a
            .recv_timeout(std::time::Duration::from_millis(5))
            .await
            .unwrap();
        assert!(nothing.is_none());

        network.disconnect(&PeerId::from("b")).await;
        assert!(!a.is_connected(&PeerId::from("b")).await);
        assert!(matches!(
            a.send(&PeerId::from("b"), load()).await,
            Err(SyncError::PeerNotConnected(_))
        ));
    }
}
