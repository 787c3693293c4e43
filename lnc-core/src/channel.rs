use core::fmt;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::{OutPoint, ScriptBuf, Transaction};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::commitments::{Commitments, CommitmentsError};
use crate::keys::ChannelKeys;

/// BOLT #2 channel id: the funding txid with the output index XORed into the last two bytes
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(#[serde_as(as = "Hex")] pub [u8; 32]);

impl ChannelId {
    pub fn from_funding_outpoint(outpoint: &OutPoint) -> Self {
        let mut id = outpoint.txid.to_byte_array();
        id[30] ^= (outpoint.vout >> 8) as u8;
        id[31] ^= outpoint.vout as u8;
        ChannelId(id)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(ChannelId(bytes.try_into().ok()?))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", hex::encode(self.0))
    }
}

/// Derived from the persisted channel and the funding output's chain state, never stored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    FundingBroadcastButNotLocked { remaining_confirmations: u32 },
    Active,
    Closing,
    Closed,
    Broken,
}

/// What the chain says about the funding output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FundingState {
    pub confirmations: u32,
    pub spent: bool,
}

/// A cooperative close in progress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatingState {
    pub local_shutdown_script: Option<ScriptBuf>,
    pub remote_shutdown_script: Option<ScriptBuf>,
}

/// The persisted unit of truth for one channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedChannel {
    pub channel_index: u32,
    pub account_id: String,
    pub remote_node_id: PublicKey,
    /// `host:port` of the counterparty
    pub remote_address: String,
    pub keys: ChannelKeys,
    pub commitments: Commitments,
    /// Funding confirmations required before the channel is usable
    pub min_depth: u32,
    pub negotiating_state: Option<NegotiatingState>,
}

impl SerializedChannel {
    pub fn channel_id(&self) -> ChannelId {
        self.commitments.channel_id
    }

    /// Commitment indexes may be one apart, never more, and balances must add up to the funding
    pub fn is_consistent(&self) -> bool {
        let c = &self.commitments;
        let local = c.local_commit.index;
        let remote = c.latest_remote_commit().index;
        let funding_msat = c.funding.amount_sat * 1000;
        local.abs_diff(remote) <= 1
            && c.local_commit.spec.total_msat() == funding_msat
            && c.remote_commit.spec.total_msat() == funding_msat
    }

    pub fn status(&self, funding: &FundingState) -> ChannelStatus {
        if !self.is_consistent() {
            ChannelStatus::Broken
        } else if funding.spent {
            ChannelStatus::Closed
        } else if funding.confirmations < self.min_depth {
            ChannelStatus::FundingBroadcastButNotLocked {
                remaining_confirmations: self.min_depth - funding.confirmations,
            }
        } else if self.negotiating_state.is_some() {
            ChannelStatus::Closing
        } else {
            ChannelStatus::Active
        }
    }

    /// Our latest commitment transaction, signed and ready to broadcast
    pub fn force_close_tx(&self, secp_ctx: &Secp256k1<All>) -> Result<Transaction, CommitmentsError> {
        self.commitments.signed_local_commitment_tx(secp_ctx, &self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_channel_pair, ChannelPairConfig};
    use bitcoin::Txid;
    use test_log::test;

    #[test]
    fn channel_id_xors_output_index() {
        let txid = Txid::from_byte_array([0x11; 32]);
        let id = ChannelId::from_funding_outpoint(&OutPoint { txid, vout: 0x0102 });
        assert_eq!(id.0[29], 0x11);
        assert_eq!(id.0[30], 0x11 ^ 0x01);
        assert_eq!(id.0[31], 0x11 ^ 0x02);
        assert_eq!(ChannelId::from_hex(&id.to_string()), Some(id));
        assert_eq!(ChannelId::from_hex("abcd"), None);
    }

    #[test]
    fn status_follows_funding_and_close_state() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_channel_pair(&secp_ctx, &ChannelPairConfig::default());
        assert_eq!(
            a.status(&FundingState { confirmations: 1, spent: false }),
            ChannelStatus::FundingBroadcastButNotLocked { remaining_confirmations: 2 }
        );
        assert_eq!(a.status(&FundingState { confirmations: 3, spent: false }), ChannelStatus::Active);
        assert_eq!(a.status(&FundingState { confirmations: 3, spent: true }), ChannelStatus::Closed);

        let mut closing = a.clone();
        closing.negotiating_state =
            Some(NegotiatingState { local_shutdown_script: None, remote_shutdown_script: None });
        assert_eq!(closing.status(&FundingState { confirmations: 3, spent: false }), ChannelStatus::Closing);

        let mut broken = a;
        broken.commitments.local_commit.index = 5;
        assert_eq!(broken.status(&FundingState { confirmations: 3, spent: false }), ChannelStatus::Broken);
    }

    #[test]
    fn persisted_channel_round_trips() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_channel_pair(&secp_ctx, &ChannelPairConfig::default());
        let json = serde_json::to_string(&a).unwrap();
        let back: SerializedChannel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(a.force_close_tx(&secp_ctx).is_ok());
    }
}
