//! A live connection to one peer.
//!
//! The session hides keepalive traffic and gossip from the channel code: it answers pings,
//! drops pongs and gossip, and ignores unknown odd messages.

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use log::{debug, error, trace};
use lnc_protocol::error::Error as WireError;
use lnc_protocol::msgs::{self, ErrorMessage, Init, Message, Pong, ALL_CHANNELS};

use crate::channel::ChannelId;
use crate::error::classified_error;
use crate::error::ClassifiedError;

/// Feature bits we announce: `option_static_remotekey`, optional
pub const INIT_FEATURES: [u8; 2] = [0x20, 0x00];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport i/o error: {0}")]
    Io(String),
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

impl ClassifiedError for TransportError {
    fn channel_breakdown(&self) -> bool {
        false
    }

    fn possible_bug(&self) -> bool {
        false
    }
}

/// An encrypted and authenticated message stream. Each item is one message with its type prefix.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Opens transports, including the cryptographic handshake
#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Transport: MessageTransport;

    async fn connect(
        &self,
        remote_node_id: &PublicKey,
        address: &str,
    ) -> Result<Self::Transport, TransportError>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("cannot decode message: {0}")]
    Decode(WireError),
    /// The caller decides if this is fatal for the channel
    #[error("peer sent error: {}", .0.text())]
    PeerError(ErrorMessage),
    #[error("peer sent init twice")]
    DuplicateInit,
    #[error("unknown even message type {0}")]
    UnknownEvenMessage(u16),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },
}

classified_error!(
    RecvError,
    wrapped: [Transport, Decode],
    breakdown: [PeerError, DuplicateInit, UnknownEvenMessage, UnexpectedMessage],
    bug: [],
);

pub struct PeerSession<T: MessageTransport> {
    transport: T,
    remote_node_id: PublicKey,
}

impl<T: MessageTransport> PeerSession<T> {
    /// Exchange `init` messages over a fresh transport
    pub async fn handshake(transport: T, remote_node_id: PublicKey) -> Result<Self, RecvError> {
        let mut session = PeerSession { transport, remote_node_id };
        let init = Init { global_features: vec![], features: INIT_FEATURES.to_vec(), tlvs: vec![] };
        session.send_message(&Message::Init(init)).await.map_err(RecvError::Transport)?;
        let message = session.recv_raw().await?;
        match message {
            Message::Init(init) => {
                debug!("init from {}, features {}", remote_node_id, hex::encode(&init.features));
                Ok(session)
            }
            Message::Error(e) => Err(RecvError::PeerError(e)),
            m => Err(RecvError::UnexpectedMessage { expected: "init", got: m.name() }),
        }
    }

    pub fn remote_node_id(&self) -> &PublicKey {
        &self.remote_node_id
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        trace!("send {:?}", message);
        self.transport.send(message.as_vec()).await
    }

    async fn recv_raw(&mut self) -> Result<Message, RecvError> {
        let bytes = self.transport.recv().await.map_err(RecvError::Transport)?;
        msgs::from_vec(bytes).map_err(RecvError::Decode)
    }

    /// The next message that concerns a channel
    pub async fn recv_channel_message(&mut self) -> Result<Message, RecvError> {
        loop {
            let message = self.recv_raw().await?;
            trace!("recv {:?}", message);
            match message {
                Message::Ping(ping) => {
                    if ping.wants_pong() {
                        let pong = Pong { ignored: vec![0u8; ping.num_pong_bytes as usize] };
                        self.send_message(&Message::Pong(pong))
                            .await
                            .map_err(RecvError::Transport)?;
                    }
                }
                Message::Pong(_) => {}
                Message::Gossip(m) => {
                    debug!("ignoring gossip message type {}", m.message_type);
                }
                Message::Init(_) => {
                    error!("init received twice from {}", self.remote_node_id);
                    return Err(RecvError::DuplicateInit);
                }
                Message::Error(e) => return Err(RecvError::PeerError(e)),
                Message::Unknown(m) if m.message_type % 2 == 1 => {
                    debug!("ignoring unknown odd message type {}", m.message_type);
                }
                Message::Unknown(m) => return Err(RecvError::UnknownEvenMessage(m.message_type)),
                m => return Ok(m),
            }
        }
    }

    /// Send an `error`, for one channel or for all of them
    pub async fn send_error(
        &mut self,
        text: &str,
        channel_id: Option<&ChannelId>,
    ) -> Result<(), TransportError> {
        let channel_id = channel_id.map(|c| c.0).unwrap_or(ALL_CHANNELS);
        self.send_message(&Message::Error(ErrorMessage::new(channel_id, text))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{memory_transport_pair, node_id};
    use lnc_protocol::msgs::{Opaque, Ping, SerBolt, UpdateFee};

    #[test_log::test(tokio::test)]
    async fn session_hides_keepalive_and_gossip() {
        let (left, mut right) = memory_transport_pair();
        let init = Message::Init(Init { global_features: vec![], features: vec![], tlvs: vec![] });
        right.send(init.as_vec()).await.unwrap();
        let mut session = PeerSession::handshake(left, node_id(2)).await.unwrap();
        assert!(matches!(msgs::from_vec(right.recv().await.unwrap()).unwrap(), Message::Init(_)));

        let fee = Message::UpdateFee(UpdateFee { channel_id: [3; 32], feerate_per_kw: 500 });
        right.send(Message::Ping(Ping { num_pong_bytes: 4, ignored: vec![] }).as_vec()).await.unwrap();
        right.send(Message::Gossip(Opaque { message_type: 258, payload: vec![1, 2] }).as_vec()).await.unwrap();
        right.send(Message::Unknown(Opaque { message_type: 32769, payload: vec![] }).as_vec()).await.unwrap();
        right.send(fee.as_vec()).await.unwrap();
        assert_eq!(session.recv_channel_message().await.unwrap(), fee);
        match msgs::from_vec(right.recv().await.unwrap()).unwrap() {
            Message::Pong(pong) => assert_eq!(pong.ignored.len(), 4),
            m => panic!("expected pong, got {:?}", m),
        }
    }

    #[test_log::test(tokio::test)]
    async fn protocol_violations_are_fatal() {
        let (left, mut right) = memory_transport_pair();
        let init = Message::Init(Init { global_features: vec![], features: vec![], tlvs: vec![] });
        right.send(init.as_vec()).await.unwrap();
        let mut session = PeerSession::handshake(left, node_id(2)).await.unwrap();
        // our side of the handshake
        assert!(matches!(msgs::from_vec(right.recv().await.unwrap()).unwrap(), Message::Init(_)));

        right.send(init.as_vec()).await.unwrap();
        let err = session.recv_channel_message().await.unwrap_err();
        assert_eq!(err, RecvError::DuplicateInit);
        assert!(err.channel_breakdown());

        right.send(Message::Unknown(Opaque { message_type: 32768, payload: vec![] }).as_vec()).await.unwrap();
        assert_eq!(session.recv_channel_message().await.unwrap_err(), RecvError::UnknownEvenMessage(32768));

        right.send(ErrorMessage::new([1; 32], "go away").as_vec()).await.unwrap();
        match session.recv_channel_message().await.unwrap_err() {
            RecvError::PeerError(e) => assert_eq!(e.text(), "go away"),
            e => panic!("unexpected {:?}", e),
        }

        session.send_error("bye", None).await.unwrap();
        match msgs::from_vec(right.recv().await.unwrap()).unwrap() {
            Message::Error(e) => {
                assert!(e.is_for_all_channels());
                assert_eq!(e.text(), "bye");
            }
            m => panic!("unexpected {:?}", m),
        }

        drop(right);
        let err = session.recv_channel_message().await.unwrap_err();
        assert_eq!(err, RecvError::Transport(TransportError::Closed));
        assert!(!err.channel_breakdown());
    }
}
