use core::fmt;

use bitcoin::hashes::sha256::Hash as Sha256Hash;
use bitcoin::hashes::Hash;
use lnc_protocol::msgs::{OnionPacket, UpdateAddHtlc};
use lightning::ln::chan_utils::{htlc_success_tx_weight, htlc_timeout_tx_weight};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::channel::ChannelId;
use crate::tx::script::channel_type;

/// SHA256 of a payment preimage
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash(#[serde_as(as = "Hex")] pub [u8; 32]);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage(#[serde_as(as = "Hex")] pub [u8; 32]);

impl PaymentPreimage {
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(Sha256Hash::hash(&self.0).to_byte_array())
    }
}

impl fmt::Debug for PaymentPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentPreimage(for {})", self.payment_hash())
    }
}

/// Whether an HTLC was offered or received, relative to the owner of the
/// commitment it appears in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HtlcDirection {
    Offered,
    Received,
}

impl HtlcDirection {
    pub fn opposite(self) -> Self {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

/// Lifecycle of an HTLC as seen by one side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcStatus {
    /// Added and not yet removed
    Pending,
    /// A fulfill is in flight
    Fulfilled,
    /// A fail or fail-malformed is in flight
    Failed,
    /// The removal is irrevocably committed on both sides
    Settled,
}

/// An HTLC in a commitment, with `direction` relative to the commitment owner
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    pub direction: HtlcDirection,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    #[serde_as(as = "Hex")]
    pub onion_routing_packet: Vec<u8>,
}

// Manual, to keep the onion out of the logs
impl fmt::Debug for Htlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Htlc")
            .field("direction", &self.direction)
            .field("id", &self.id)
            .field("amount_msat", &self.amount_msat)
            .field("payment_hash", &self.payment_hash)
            .field("cltv_expiry", &self.cltv_expiry)
            .finish()
    }
}

impl Htlc {
    pub fn from_add(add: &UpdateAddHtlc, direction: HtlcDirection) -> Self {
        Htlc {
            direction,
            id: add.id,
            amount_msat: add.amount_msat,
            payment_hash: PaymentHash(add.payment_hash),
            cltv_expiry: add.cltv_expiry,
            onion_routing_packet: add.onion_routing_packet.as_slice().to_vec(),
        }
    }

    pub fn to_add(&self, channel_id: &ChannelId) -> Option<UpdateAddHtlc> {
        Some(UpdateAddHtlc {
            channel_id: channel_id.0,
            id: self.id,
            amount_msat: self.amount_msat,
            payment_hash: self.payment_hash.0,
            cltv_expiry: self.cltv_expiry,
            onion_routing_packet: OnionPacket::from_slice(&self.onion_routing_packet).ok()?,
        })
    }

    /// The same HTLC as it appears in the other side's commitment
    pub fn flipped(&self) -> Self {
        Htlc { direction: self.direction.opposite(), ..self.clone() }
    }

    pub fn amount_sat(&self) -> u64 {
        self.amount_msat / 1000
    }

    /// Fee of the second-level transaction that resolves this HTLC on the owner's commitment
    pub fn second_level_fee_sat(&self, feerate_per_kw: u32) -> u64 {
        let weight = match self.direction {
            HtlcDirection::Offered => htlc_timeout_tx_weight(&channel_type()),
            HtlcDirection::Received => htlc_success_tx_weight(&channel_type()),
        };
        weight * feerate_per_kw as u64 / 1000
    }

    /// Dust HTLCs are trimmed from the commitment and their value goes to fees
    pub fn is_dust(&self, feerate_per_kw: u32, dust_limit_sat: u64) -> bool {
        self.amount_sat() < dust_limit_sat + self.second_level_fee_sat(feerate_per_kw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn htlc(direction: HtlcDirection, amount_msat: u64) -> Htlc {
        Htlc {
            direction,
            id: 0,
            amount_msat,
            payment_hash: PaymentHash([1; 32]),
            cltv_expiry: 500,
            onion_routing_packet: vec![],
        }
    }

    #[test]
    fn dust_threshold_depends_on_direction() {
        // at 1000 sat/kw, timeout costs 663 sat and success 703 sat
        let offered = htlc(HtlcDirection::Offered, 1_209_000);
        let received = htlc(HtlcDirection::Received, 1_209_000);
        assert!(!offered.is_dust(1000, 546));
        assert!(received.is_dust(1000, 546));
        assert!(!received.is_dust(1000, 500));
        assert!(offered.is_dust(1000, 547));
    }

    #[test]
    fn dust_at_zero_feerate_is_the_dust_limit() {
        assert!(htlc(HtlcDirection::Received, 545_999).is_dust(0, 546));
        assert!(!htlc(HtlcDirection::Received, 546_000).is_dust(0, 546));
    }

    #[test]
    fn preimage_hashes() {
        let preimage = PaymentPreimage([7; 32]);
        let hash = preimage.payment_hash();
        assert_eq!(hash.0, Sha256Hash::hash(&[7; 32]).to_byte_array());
        assert_eq!(htlc(HtlcDirection::Offered, 1).flipped().direction, HtlcDirection::Received);
    }
}
