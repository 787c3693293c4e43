#![allow(missing_docs)]

use core::fmt::{self, Debug};
use std::io::Read;

use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use log::error;

use crate::error::{Error, Result};
use crate::io::*;

/// Largest message a peer may send, including the type prefix
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Size of a BOLT #4 onion packet
pub const ONION_PACKET_LEN: usize = 1366;

/// Type of the mono-hop unidirectional payment extension message
pub const MONO_HOP_PAYMENT_TYPE: u16 = 42198;

/// Serialize a message with a type prefix, in BOLT style
pub trait SerBolt: Debug + Send {
    fn as_vec(&self) -> Vec<u8>;
}

/// Deserialize a message with a type prefix, in BOLT style
pub trait DeBolt: Debug + Sized {
    fn from_vec(ser: Vec<u8>) -> Result<Self>;
}

/// Body codec shared by all typed messages
pub trait BoltBody: Debug + Sized + Send {
    const TYPE: u16;
    fn write_body(&self, out: &mut Vec<u8>);
    fn read_body<R: Read>(reader: &mut R) -> Result<Self>;
}

impl<T: BoltBody> SerBolt for T {
    fn as_vec(&self) -> Vec<u8> {
        let mut out = T::TYPE.to_be_bytes().to_vec();
        self.write_body(&mut out);
        out
    }
}

impl<T: BoltBody> DeBolt for T {
    fn from_vec(ser: Vec<u8>) -> Result<Self> {
        let mut cursor = &ser[..];
        let message_type = read_u16(&mut cursor).map_err(|_| Error::ShortRead)?;
        if message_type != T::TYPE {
            return Err(Error::UnexpectedType(message_type));
        }
        read_complete_body(&mut cursor, message_type)
    }
}

fn read_complete_body<T: BoltBody>(cursor: &mut &[u8], message_type: u16) -> Result<T> {
    let message = T::read_body(cursor).map_err(|e| match e {
        Error::Eof => Error::ShortRead,
        e => e,
    })?;
    if !cursor.is_empty() {
        return Err(Error::TrailingBytes(cursor.len(), message_type));
    }
    Ok(message)
}

/// A 32 byte channel id as it appears on the wire
pub type ChannelIdBytes = [u8; 32];

/// The all-zero channel id addresses every channel with the peer
pub const ALL_CHANNELS: ChannelIdBytes = [0u8; 32];

/// BOLT #4 onion packet
#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket(pub Box<[u8; ONION_PACKET_LEN]>);

impl OnionPacket {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ONION_PACKET_LEN] =
            bytes.try_into().map_err(|_| Error::InvalidValue("onion_routing_packet"))?;
        Ok(OnionPacket(Box::new(array)))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Debug for OnionPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionPacket({}..)", hex::encode(&self.0[..8]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub global_features: Vec<u8>,
    pub features: Vec<u8>,
    /// Unparsed TLV stream
    pub tlvs: Vec<u8>,
}

impl BoltBody for Init {
    const TYPE: u16 = 16;

    fn write_body(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, &self.global_features);
        write_var_bytes(out, &self.features);
        out.extend_from_slice(&self.tlvs);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let global_features = read_var_bytes(reader)?;
        let features = read_var_bytes(reader)?;
        let mut tlvs = Vec::new();
        reader.read_to_end(&mut tlvs).map_err(|e| Error::Io(e.kind()))?;
        Ok(Init { global_features, features, tlvs })
    }
}

/// BOLT #1 error
#[derive(Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub channel_id: ChannelIdBytes,
    pub data: Vec<u8>,
}

impl ErrorMessage {
    pub fn new(channel_id: ChannelIdBytes, text: &str) -> Self {
        let mut data = text.as_bytes().to_vec();
        data.truncate(MAX_MESSAGE_SIZE - 2 - 32 - 2);
        ErrorMessage { channel_id, data }
    }

    /// Whether this error is addressed to all channels
    pub fn is_for_all_channels(&self) -> bool {
        self.channel_id == ALL_CHANNELS
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl Debug for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMessage")
            .field("channel_id", &hex::encode(self.channel_id))
            .field("data", &self.text())
            .finish()
    }
}

impl BoltBody for ErrorMessage {
    const TYPE: u16 = 17;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_var_bytes(out, &self.data);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(ErrorMessage { channel_id: read_bytes(reader)?, data: read_var_bytes(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub num_pong_bytes: u16,
    pub ignored: Vec<u8>,
}

impl Ping {
    /// Pings asking for 65532 or more bytes must not be answered
    pub fn wants_pong(&self) -> bool {
        self.num_pong_bytes < 65532
    }
}

impl BoltBody for Ping {
    const TYPE: u16 = 18;

    fn write_body(&self, out: &mut Vec<u8>) {
        write_u16(out, self.num_pong_bytes);
        write_var_bytes(out, &self.ignored);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Ping { num_pong_bytes: read_u16(reader)?, ignored: read_var_bytes(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub ignored: Vec<u8>,
}

impl BoltBody for Pong {
    const TYPE: u16 = 19;

    fn write_body(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, &self.ignored);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Pong { ignored: read_var_bytes(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingLocked {
    pub channel_id: ChannelIdBytes,
    pub next_per_commitment_point: PublicKey,
}

impl BoltBody for FundingLocked {
    const TYPE: u16 = 36;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_pubkey(out, &self.next_per_commitment_point);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(FundingLocked {
            channel_id: read_bytes(reader)?,
            next_per_commitment_point: read_pubkey(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    pub channel_id: ChannelIdBytes,
    pub scriptpubkey: Vec<u8>,
}

impl BoltBody for Shutdown {
    const TYPE: u16 = 38;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_var_bytes(out, &self.scriptpubkey);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Shutdown { channel_id: read_bytes(reader)?, scriptpubkey: read_var_bytes(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelIdBytes,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
    pub onion_routing_packet: OnionPacket,
}

impl BoltBody for UpdateAddHtlc {
    const TYPE: u16 = 128;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.id);
        write_u64(out, self.amount_msat);
        out.extend_from_slice(&self.payment_hash);
        write_u32(out, self.cltv_expiry);
        out.extend_from_slice(self.onion_routing_packet.as_slice());
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UpdateAddHtlc {
            channel_id: read_bytes(reader)?,
            id: read_u64(reader)?,
            amount_msat: read_u64(reader)?,
            payment_hash: read_bytes(reader)?,
            cltv_expiry: read_u32(reader)?,
            onion_routing_packet: OnionPacket(Box::new(read_bytes(reader)?)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelIdBytes,
    pub id: u64,
    pub payment_preimage: [u8; 32],
}

impl BoltBody for UpdateFulfillHtlc {
    const TYPE: u16 = 130;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.id);
        out.extend_from_slice(&self.payment_preimage);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UpdateFulfillHtlc {
            channel_id: read_bytes(reader)?,
            id: read_u64(reader)?,
            payment_preimage: read_bytes(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelIdBytes,
    pub id: u64,
    pub reason: Vec<u8>,
}

impl BoltBody for UpdateFailHtlc {
    const TYPE: u16 = 131;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.id);
        write_var_bytes(out, &self.reason);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UpdateFailHtlc {
            channel_id: read_bytes(reader)?,
            id: read_u64(reader)?,
            reason: read_var_bytes(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentSigned {
    pub channel_id: ChannelIdBytes,
    pub signature: Signature,
    pub htlc_signatures: Vec<Signature>,
}

impl BoltBody for CommitmentSigned {
    const TYPE: u16 = 132;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_signature(out, &self.signature);
        write_u16(out, self.htlc_signatures.len() as u16);
        for sig in &self.htlc_signatures {
            write_signature(out, sig);
        }
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        let channel_id = read_bytes(reader)?;
        let signature = read_signature(reader)?;
        let num_htlcs = read_u16(reader)?;
        let htlc_signatures =
            (0..num_htlcs).map(|_| read_signature(reader)).collect::<Result<Vec<_>>>()?;
        Ok(CommitmentSigned { channel_id, signature, htlc_signatures })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RevokeAndAck {
    pub channel_id: ChannelIdBytes,
    pub per_commitment_secret: [u8; 32],
    pub next_per_commitment_point: PublicKey,
}

// Manual so that the secret is not logged
impl Debug for RevokeAndAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevokeAndAck")
            .field("channel_id", &hex::encode(self.channel_id))
            .field("next_per_commitment_point", &self.next_per_commitment_point)
            .finish_non_exhaustive()
    }
}

impl BoltBody for RevokeAndAck {
    const TYPE: u16 = 133;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        out.extend_from_slice(&self.per_commitment_secret);
        write_pubkey(out, &self.next_per_commitment_point);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(RevokeAndAck {
            channel_id: read_bytes(reader)?,
            per_commitment_secret: read_bytes(reader)?,
            next_per_commitment_point: read_pubkey(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFee {
    pub channel_id: ChannelIdBytes,
    pub feerate_per_kw: u32,
}

impl BoltBody for UpdateFee {
    const TYPE: u16 = 134;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u32(out, self.feerate_per_kw);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UpdateFee { channel_id: read_bytes(reader)?, feerate_per_kw: read_u32(reader)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: ChannelIdBytes,
    pub id: u64,
    pub sha256_of_onion: [u8; 32],
    pub failure_code: u16,
}

impl BoltBody for UpdateFailMalformedHtlc {
    const TYPE: u16 = 135;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.id);
        out.extend_from_slice(&self.sha256_of_onion);
        write_u16(out, self.failure_code);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UpdateFailMalformedHtlc {
            channel_id: read_bytes(reader)?,
            id: read_u64(reader)?,
            sha256_of_onion: read_bytes(reader)?,
            failure_code: read_u16(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ChannelReestablish {
    pub channel_id: ChannelIdBytes,
    /// The commitment number of the next `commitment_signed` the sender expects
    pub next_commitment_number: u64,
    /// The commitment number of the next `revoke_and_ack` the sender expects
    pub next_revocation_number: u64,
    pub your_last_per_commitment_secret: [u8; 32],
    pub my_current_per_commitment_point: PublicKey,
}

impl Debug for ChannelReestablish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReestablish")
            .field("channel_id", &hex::encode(self.channel_id))
            .field("next_commitment_number", &self.next_commitment_number)
            .field("next_revocation_number", &self.next_revocation_number)
            .field("my_current_per_commitment_point", &self.my_current_per_commitment_point)
            .finish_non_exhaustive()
    }
}

impl BoltBody for ChannelReestablish {
    const TYPE: u16 = 136;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.next_commitment_number);
        write_u64(out, self.next_revocation_number);
        out.extend_from_slice(&self.your_last_per_commitment_secret);
        write_pubkey(out, &self.my_current_per_commitment_point);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(ChannelReestablish {
            channel_id: read_bytes(reader)?,
            next_commitment_number: read_u64(reader)?,
            next_revocation_number: read_u64(reader)?,
            your_last_per_commitment_secret: read_bytes(reader)?,
            my_current_per_commitment_point: read_pubkey(reader)?,
        })
    }
}

/// Moves `amount_msat` from the sender's balance to the receiver's without an HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonoHopUnidirectionalPayment {
    pub channel_id: ChannelIdBytes,
    pub amount_msat: u64,
}

impl BoltBody for MonoHopUnidirectionalPayment {
    const TYPE: u16 = MONO_HOP_PAYMENT_TYPE;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id);
        write_u64(out, self.amount_msat);
    }

    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(MonoHopUnidirectionalPayment {
            channel_id: read_bytes(reader)?,
            amount_msat: read_u64(reader)?,
        })
    }
}

/// A message passed through without decoding
#[derive(Clone, PartialEq, Eq)]
pub struct Opaque {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

impl Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("message_type", &self.message_type)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Gossip message types, 256 through 265
pub fn is_gossip_type(message_type: u16) -> bool {
    (256..=265).contains(&message_type)
}

/// An enum representing all messages we can read and write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init(Init),
    Error(ErrorMessage),
    Ping(Ping),
    Pong(Pong),
    FundingLocked(FundingLocked),
    Shutdown(Shutdown),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    UpdateFee(UpdateFee),
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),
    ChannelReestablish(ChannelReestablish),
    MonoHopUnidirectionalPayment(MonoHopUnidirectionalPayment),
    Gossip(Opaque),
    Unknown(Opaque),
}

impl Message {
    pub fn message_type(&self) -> u16 {
        match self {
            Message::Init(_) => Init::TYPE,
            Message::Error(_) => ErrorMessage::TYPE,
            Message::Ping(_) => Ping::TYPE,
            Message::Pong(_) => Pong::TYPE,
            Message::FundingLocked(_) => FundingLocked::TYPE,
            Message::Shutdown(_) => Shutdown::TYPE,
            Message::UpdateAddHtlc(_) => UpdateAddHtlc::TYPE,
            Message::UpdateFulfillHtlc(_) => UpdateFulfillHtlc::TYPE,
            Message::UpdateFailHtlc(_) => UpdateFailHtlc::TYPE,
            Message::CommitmentSigned(_) => CommitmentSigned::TYPE,
            Message::RevokeAndAck(_) => RevokeAndAck::TYPE,
            Message::UpdateFee(_) => UpdateFee::TYPE,
            Message::UpdateFailMalformedHtlc(_) => UpdateFailMalformedHtlc::TYPE,
            Message::ChannelReestablish(_) => ChannelReestablish::TYPE,
            Message::MonoHopUnidirectionalPayment(_) => MonoHopUnidirectionalPayment::TYPE,
            Message::Gossip(m) | Message::Unknown(m) => m.message_type,
        }
    }

    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        message_name(self.message_type())
    }

    pub fn as_vec(&self) -> Vec<u8> {
        match self {
            Message::Init(m) => m.as_vec(),
            Message::Error(m) => m.as_vec(),
            Message::Ping(m) => m.as_vec(),
            Message::Pong(m) => m.as_vec(),
            Message::FundingLocked(m) => m.as_vec(),
            Message::Shutdown(m) => m.as_vec(),
            Message::UpdateAddHtlc(m) => m.as_vec(),
            Message::UpdateFulfillHtlc(m) => m.as_vec(),
            Message::UpdateFailHtlc(m) => m.as_vec(),
            Message::CommitmentSigned(m) => m.as_vec(),
            Message::RevokeAndAck(m) => m.as_vec(),
            Message::UpdateFee(m) => m.as_vec(),
            Message::UpdateFailMalformedHtlc(m) => m.as_vec(),
            Message::ChannelReestablish(m) => m.as_vec(),
            Message::MonoHopUnidirectionalPayment(m) => m.as_vec(),
            Message::Gossip(m) | Message::Unknown(m) => {
                let mut out = m.message_type.to_be_bytes().to_vec();
                out.extend_from_slice(&m.payload);
                out
            }
        }
    }
}

/// Name of a message type, "unknown" for types we do not decode
pub fn message_name(message_type: u16) -> &'static str {
    match message_type {
        Init::TYPE => "init",
        ErrorMessage::TYPE => "error",
        Ping::TYPE => "ping",
        Pong::TYPE => "pong",
        FundingLocked::TYPE => "funding_locked",
        Shutdown::TYPE => "shutdown",
        UpdateAddHtlc::TYPE => "update_add_htlc",
        UpdateFulfillHtlc::TYPE => "update_fulfill_htlc",
        UpdateFailHtlc::TYPE => "update_fail_htlc",
        CommitmentSigned::TYPE => "commitment_signed",
        RevokeAndAck::TYPE => "revoke_and_ack",
        UpdateFee::TYPE => "update_fee",
        UpdateFailMalformedHtlc::TYPE => "update_fail_malformed_htlc",
        ChannelReestablish::TYPE => "channel_reestablish",
        MONO_HOP_PAYMENT_TYPE => "mono_hop_unidirectional_payment",
        t if is_gossip_type(t) => "gossip",
        _ => "unknown",
    }
}

/// Read a BOLT message from a vector:
///
/// - u16 packet type
/// - data
pub fn from_vec(v: Vec<u8>) -> Result<Message> {
    if v.len() > MAX_MESSAGE_SIZE {
        error!("message too large {}", v.len());
        return Err(Error::MessageTooLarge);
    }
    let mut cursor = &v[..];
    let message_type = read_u16(&mut cursor).map_err(|_| Error::ShortRead)?;
    let cursor = &mut cursor;
    let message = match message_type {
        Init::TYPE => Message::Init(read_complete_body(cursor, message_type)?),
        ErrorMessage::TYPE => Message::Error(read_complete_body(cursor, message_type)?),
        Ping::TYPE => Message::Ping(read_complete_body(cursor, message_type)?),
        Pong::TYPE => Message::Pong(read_complete_body(cursor, message_type)?),
        FundingLocked::TYPE => Message::FundingLocked(read_complete_body(cursor, message_type)?),
        Shutdown::TYPE => Message::Shutdown(read_complete_body(cursor, message_type)?),
        UpdateAddHtlc::TYPE => Message::UpdateAddHtlc(read_complete_body(cursor, message_type)?),
        UpdateFulfillHtlc::TYPE =>
            Message::UpdateFulfillHtlc(read_complete_body(cursor, message_type)?),
        UpdateFailHtlc::TYPE => Message::UpdateFailHtlc(read_complete_body(cursor, message_type)?),
        CommitmentSigned::TYPE =>
            Message::CommitmentSigned(read_complete_body(cursor, message_type)?),
        RevokeAndAck::TYPE => Message::RevokeAndAck(read_complete_body(cursor, message_type)?),
        UpdateFee::TYPE => Message::UpdateFee(read_complete_body(cursor, message_type)?),
        UpdateFailMalformedHtlc::TYPE =>
            Message::UpdateFailMalformedHtlc(read_complete_body(cursor, message_type)?),
        ChannelReestablish::TYPE =>
            Message::ChannelReestablish(read_complete_body(cursor, message_type)?),
        MONO_HOP_PAYMENT_TYPE =>
            Message::MonoHopUnidirectionalPayment(read_complete_body(cursor, message_type)?),
        t if is_gossip_type(t) => Message::Gossip(Opaque { message_type, payload: cursor.to_vec() }),
        _ => Message::Unknown(Opaque { message_type, payload: cursor.to_vec() }),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use test_log::test;

    fn point(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    #[test]
    fn reestablish_layout() {
        let msg = ChannelReestablish {
            channel_id: [7u8; 32],
            next_commitment_number: 5,
            next_revocation_number: 4,
            your_last_per_commitment_secret: [9u8; 32],
            my_current_per_commitment_point: point(1),
        };
        let ser = msg.as_vec();
        assert_eq!(ser.len(), 2 + 32 + 8 + 8 + 32 + 33);
        assert_eq!(&ser[..2], &[0, 136]);
        assert_eq!(&ser[34..42], &5u64.to_be_bytes());
        match from_vec(ser).unwrap() {
            Message::ChannelReestablish(m) => assert_eq!(m, msg),
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn commitment_signed_with_htlc_sigs() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let digest = bitcoin::secp256k1::Message::from_digest([1u8; 32]);
        let sig = secp.sign_ecdsa(&digest, &key);
        let msg =
            CommitmentSigned { channel_id: [1u8; 32], signature: sig, htlc_signatures: vec![sig, sig] };
        let ser = msg.as_vec();
        assert_eq!(ser.len(), 2 + 32 + 64 + 2 + 2 * 64);
        assert_eq!(CommitmentSigned::from_vec(ser).unwrap(), msg);
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        let msg = UpdateFee { channel_id: [2u8; 32], feerate_per_kw: 253 };
        let mut ser = msg.as_vec();
        assert_eq!(from_vec(ser[..ser.len() - 1].to_vec()), Err(Error::ShortRead));
        ser.push(0);
        assert_eq!(from_vec(ser), Err(Error::TrailingBytes(1, 134)));
    }

    #[test]
    fn typed_decode_checks_type() {
        let ser = Pong { ignored: vec![] }.as_vec();
        assert_eq!(Ping::from_vec(ser), Err(Error::UnexpectedType(19)));
    }

    #[test]
    fn unknown_and_gossip_pass_through() {
        let gossip = vec![1, 2, 0xaa, 0xbb];
        assert_eq!(
            from_vec(gossip.clone()).unwrap(),
            Message::Gossip(Opaque { message_type: 258, payload: vec![0xaa, 0xbb] })
        );
        let odd = vec![0x80, 0x01, 0xcc];
        let decoded = from_vec(odd.clone()).unwrap();
        assert_eq!(decoded.name(), "unknown");
        assert_eq!(decoded.as_vec(), odd);
    }

    #[test]
    fn init_keeps_tlvs() {
        let msg = Init { global_features: vec![], features: vec![0x02, 0x0a], tlvs: vec![1, 0] };
        assert_eq!(from_vec(msg.as_vec()).unwrap(), Message::Init(msg));
    }

    #[test]
    fn onion_packet_length_enforced() {
        assert!(OnionPacket::from_slice(&[0u8; 10]).is_err());
        assert!(OnionPacket::from_slice(&[0u8; ONION_PACKET_LEN]).is_ok());
    }
}
