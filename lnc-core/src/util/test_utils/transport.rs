use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::peer::{MessageTransport, TransportConnector, TransportError};

/// One end of an in-process message pipe
pub struct MemoryTransport {
    tx: UnboundedSender<Vec<u8>>,
    rx: UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Two connected ends. Dropping one closes the other.
pub fn memory_transport_pair() -> (MemoryTransport, MemoryTransport) {
    let (left_tx, right_rx) = unbounded_channel();
    let (right_tx, left_rx) = unbounded_channel();
    (MemoryTransport { tx: left_tx, rx: left_rx }, MemoryTransport { tx: right_tx, rx: right_rx })
}

/// Hands out its end of a pipe once
pub struct MemoryConnector {
    transport: Mutex<Option<MemoryTransport>>,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(
        &self,
        _remote_node_id: &PublicKey,
        address: &str,
    ) -> Result<MemoryTransport, TransportError> {
        self.transport.lock().unwrap().take().ok_or_else(|| TransportError::Connect {
            address: address.to_string(),
            reason: "already connected".to_string(),
        })
    }
}

pub fn memory_connector_pair() -> (MemoryConnector, MemoryConnector) {
    let (left, right) = memory_transport_pair();
    (
        MemoryConnector { transport: Mutex::new(Some(left)) },
        MemoryConnector { transport: Mutex::new(Some(right)) },
    )
}
